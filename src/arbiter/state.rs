//! Decision state machine.
//!
//! ```text
//!   submit ──► [idle] ──activate──► [pending] ──respond/expire──► recorded ──► promote next
//!                                      │
//!                         submit ──────┴──► coalesce | backlog | shed
//! ```
//!
//! Every transition takes `now` from the caller, so the machine is deterministic under test.
//! Each event leaves `Pending` exactly once and is recorded exactly once.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;

use super::{Action, ArbiterConfig, ArbiterError, Candidate, HumanResponse, PendingPolicy};
use crate::alert::{Alert, AlertDispatch};
use crate::event_log::EventLog;
use crate::gallery::{Category, IdentityGallery, IdentityId, NewIdentity};
use crate::{now_ms, DetectionEvent, EventId, Resolution};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ArbiterStats {
    pub received: u64,
    pub coalesced: u64,
    pub queued: u64,
    pub backlog_shed: u64,
    pub allowed: u64,
    pub denied: u64,
    pub timed_out: u64,
    pub stale_responses: u64,
    pub alert_failures: u64,
    pub persist_failures: u64,
    /// Resolved events the log could not store.
    pub unrecorded: u64,
}

/// Shared read-only view of the pending event.
///
/// Readers clone under a short lock; the arbiter replaces the value on every transition.
#[derive(Clone, Default)]
pub struct PendingView(Arc<Mutex<Option<DetectionEvent>>>);

impl PendingView {
    pub fn get(&self) -> Option<DetectionEvent> {
        match self.0.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn publish(&self, event: Option<DetectionEvent>) {
        match self.0.lock() {
            Ok(mut guard) => *guard = event,
            Err(poisoned) => *poisoned.into_inner() = event,
        }
    }
}

struct PendingDecision {
    candidate: Candidate,
    deadline: Instant,
}

pub struct DecisionArbiter {
    config: ArbiterConfig,
    gallery: Arc<IdentityGallery>,
    event_log: Arc<EventLog>,
    alerts: Box<dyn AlertDispatch>,
    pending: Option<PendingDecision>,
    backlog: VecDeque<Candidate>,
    view: PendingView,
    stats: ArbiterStats,
}

impl DecisionArbiter {
    pub fn new(
        config: ArbiterConfig,
        gallery: Arc<IdentityGallery>,
        event_log: Arc<EventLog>,
        alerts: Box<dyn AlertDispatch>,
    ) -> Self {
        Self {
            config,
            gallery,
            event_log,
            alerts,
            pending: None,
            backlog: VecDeque::new(),
            view: PendingView::default(),
            stats: ArbiterStats::default(),
        }
    }

    pub fn pending(&self) -> Option<&DetectionEvent> {
        self.pending.as_ref().map(|p| &p.candidate.event)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|p| p.deadline)
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    pub fn stats(&self) -> ArbiterStats {
        self.stats
    }

    pub fn view(&self) -> PendingView {
        self.view.clone()
    }

    /// Accept a candidate: make it pending, fold it into the pending event, queue it, or
    /// shed it when the backlog is full. Shed events are recorded as timed out.
    pub fn submit(&mut self, candidate: Candidate, now: Instant) {
        self.stats.received += 1;
        if self.pending.is_none() {
            self.activate(candidate, now);
            return;
        }
        let Some(pending) = self.pending.as_mut() else {
            return;
        };

        if self.config.pending_policy == PendingPolicy::Coalesce
            && same_subject(&self.config, &pending.candidate.event, &candidate.event)
        {
            let merged = &mut pending.candidate.event;
            merged.confidence = merged.confidence.max(candidate.event.confidence);
            log::info!(
                "arbiter: event {} (frame {}) coalesced into pending event {}",
                candidate.event.id,
                candidate.event.frame_id,
                merged.id
            );
            self.stats.coalesced += 1;
            self.view.publish(Some(merged.clone()));
            return;
        }

        if self.backlog.len() >= self.config.max_backlog {
            self.stats.backlog_shed += 1;
            log::warn!(
                "arbiter: backlog full ({}), shedding event {} (frame {})",
                self.config.max_backlog,
                candidate.event.id,
                candidate.event.frame_id
            );
            self.close(candidate, Resolution::TimedOut, Some("shed"));
            return;
        }
        log::debug!(
            "arbiter: event {} queued behind {} ({} waiting)",
            candidate.event.id,
            pending.candidate.event.id,
            self.backlog.len() + 1
        );
        self.backlog.push_back(candidate);
        self.stats.queued += 1;
    }

    /// Apply a human response to the pending event.
    ///
    /// A response for any other event, or one arriving at or after the deadline, is stale.
    pub fn respond(
        &mut self,
        response: HumanResponse,
        now: Instant,
    ) -> Result<DetectionEvent, ArbiterError> {
        self.expire(now);
        let current = self.pending.as_ref().map(|p| p.candidate.event.id);
        if current != Some(response.event_id) {
            self.stats.stale_responses += 1;
            log::warn!(
                "arbiter: stale response for event {} (pending: {:?})",
                response.event_id,
                current
            );
            return Err(ArbiterError::StaleResponse {
                event_id: response.event_id,
                pending: current,
            });
        }
        let Some(PendingDecision { mut candidate, .. }) = self.pending.take() else {
            return Err(ArbiterError::StaleResponse {
                event_id: response.event_id,
                pending: None,
            });
        };

        let resolution = match response.action {
            Action::Allow => Resolution::Allowed,
            Action::Deny => Resolution::Denied,
        };
        if response.action == Action::Allow && response.persist {
            candidate.event.persisted_identity = self.remember(&candidate, &response);
        } else if response.persist {
            log::info!(
                "arbiter: event {} denied; ignoring persist request",
                response.event_id
            );
        }
        Ok(self.finish(candidate, resolution, None, now))
    }

    /// Time out the pending event if its deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Option<DetectionEvent> {
        if !self.deadline().is_some_and(|deadline| deadline <= now) {
            return None;
        }
        let pending = self.pending.take()?;
        log::info!(
            "arbiter: event {} timed out after {:?}",
            pending.candidate.event.id,
            self.config.decision_timeout
        );
        Some(self.finish(pending.candidate, Resolution::TimedOut, None, now))
    }

    /// Resolve everything still open as timed out, pending first, then the backlog in order.
    pub fn shutdown(&mut self) -> Vec<DetectionEvent> {
        let mut closed = Vec::new();
        if let Some(pending) = self.pending.take() {
            closed.push(self.close(pending.candidate, Resolution::TimedOut, Some("shutdown")));
        }
        while let Some(candidate) = self.backlog.pop_front() {
            closed.push(self.close(candidate, Resolution::TimedOut, Some("shutdown")));
        }
        self.view.publish(None);
        if !closed.is_empty() {
            log::info!("arbiter: closed {} open events on shutdown", closed.len());
        }
        closed
    }

    fn activate(&mut self, candidate: Candidate, now: Instant) {
        let deadline = now + self.config.decision_timeout;
        self.view.publish(Some(candidate.event.clone()));
        let alert = Alert {
            event: &candidate.event,
            snapshot: candidate.snapshot.as_ref(),
            speech: candidate.speech.as_deref(),
            respond_within: self.config.decision_timeout,
        };
        if let Err(e) = self.alerts.notify(&alert) {
            self.stats.alert_failures += 1;
            log::warn!(
                "arbiter: {} alert for event {} failed: {}",
                self.alerts.name(),
                candidate.event.id,
                e
            );
        }
        log::info!(
            "arbiter: event {} pending ({}, frame {})",
            candidate.event.id,
            candidate.event.label(),
            candidate.event.frame_id
        );
        self.pending = Some(PendingDecision {
            candidate,
            deadline,
        });
    }

    fn finish(
        &mut self,
        candidate: Candidate,
        resolution: Resolution,
        note: Option<&str>,
        now: Instant,
    ) -> DetectionEvent {
        let event = self.close(candidate, resolution, note);
        match self.backlog.pop_front() {
            Some(next) => self.activate(next, now),
            None => self.view.publish(None),
        }
        event
    }

    /// Resolve, record, count. Does not touch `pending`.
    fn close(
        &mut self,
        candidate: Candidate,
        resolution: Resolution,
        note: Option<&str>,
    ) -> DetectionEvent {
        let mut event = candidate.event;
        if let Err(e) = event.resolve(resolution, now_ms()) {
            log::error!("arbiter: {}", e);
        }
        if let Some(note) = note {
            event.note = Some(note.to_string());
        }
        match resolution {
            Resolution::Allowed => self.stats.allowed += 1,
            Resolution::Denied => self.stats.denied += 1,
            Resolution::TimedOut => self.stats.timed_out += 1,
            Resolution::Pending => {}
        }
        if self.event_log.record_or_drop(&event).is_none() {
            self.stats.unrecorded += 1;
        }
        log::info!(
            "arbiter: event {} {} ({})",
            event.id,
            resolution.as_str(),
            event.label()
        );
        event
    }

    /// Enroll the person from an allowed event. Known people are updated in place.
    fn remember(&mut self, candidate: &Candidate, response: &HumanResponse) -> Option<IdentityId> {
        let event = &candidate.event;
        let display_name = response
            .display_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .or_else(|| event.display_name.clone())
            .unwrap_or_else(|| self.config.default_display_name.clone());
        let category = response.category.unwrap_or(if event.is_known {
            event.category
        } else {
            Category::Unknown
        });
        // an identity deleted while the event was pending is enrolled afresh
        let replaces = if event.is_known {
            event
                .person_identity
                .best_identity_id()
                .filter(|id| self.gallery.snapshot().get(*id).is_some())
        } else {
            None
        };

        let identity = NewIdentity {
            replaces,
            display_name,
            embedding: candidate.embedding.vector.clone(),
            category,
            photo_reference: None,
        };
        match self.gallery.persist(identity) {
            Ok(stored) => Some(stored.id),
            Err(e) => {
                self.stats.persist_failures += 1;
                log::error!(
                    "arbiter: could not remember person from event {}: {}",
                    event.id,
                    e
                );
                None
            }
        }
    }
}

/// Same recognized identity, or two unknowns whose boxes overlap, close together in time.
fn same_subject(config: &ArbiterConfig, pending: &DetectionEvent, arrival: &DetectionEvent) -> bool {
    let window_ms = config.coalesce_window.as_millis() as u64;
    if arrival.created_at.saturating_sub(pending.created_at) > window_ms {
        return false;
    }
    match (pending.is_known, arrival.is_known) {
        (true, true) => {
            pending.person_identity.best_identity_id().is_some()
                && pending.person_identity.best_identity_id()
                    == arrival.person_identity.best_identity_id()
        }
        (false, false) => pending.bbox.iou(&arrival.bbox) >= config.coalesce_iou,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{DetectionId, FaceEmbedding};
    use crate::frame::BoundingBox;
    use crate::gallery::IdentitySummary;
    use crate::matcher::MatchResult;
    use crate::storage::{InMemoryStore, RetryPolicy};
    use crate::test_util::identity;
    use std::time::Duration;

    struct RecordingDispatch {
        notified: Arc<Mutex<Vec<EventId>>>,
        fail: bool,
    }

    impl AlertDispatch for RecordingDispatch {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn notify(&mut self, alert: &Alert<'_>) -> anyhow::Result<()> {
            self.notified.lock().unwrap().push(alert.event.id);
            if self.fail {
                anyhow::bail!("broker down");
            }
            Ok(())
        }
    }

    struct Harness {
        arbiter: DecisionArbiter,
        store: Arc<InMemoryStore>,
        gallery: Arc<IdentityGallery>,
        notified: Arc<Mutex<Vec<EventId>>>,
    }

    fn harness(config: ArbiterConfig) -> Harness {
        harness_with(config, InMemoryStore::new(), false)
    }

    fn harness_with(config: ArbiterConfig, store: InMemoryStore, failing_alerts: bool) -> Harness {
        let store = Arc::new(store);
        let retry = RetryPolicy {
            attempts: 2,
            backoff: Duration::ZERO,
        };
        let gallery =
            Arc::new(IdentityGallery::load(store.clone(), 2, retry.clone()).unwrap());
        let log = Arc::new(EventLog::new(store.clone(), retry));
        let notified = Arc::new(Mutex::new(Vec::new()));
        let alerts = Box::new(RecordingDispatch {
            notified: Arc::clone(&notified),
            fail: failing_alerts,
        });
        Harness {
            arbiter: DecisionArbiter::new(config, Arc::clone(&gallery), log, alerts),
            store,
            gallery,
            notified,
        }
    }

    fn candidate(id: EventId, created_at: u64, known: Option<IdentityId>) -> Candidate {
        let detection_id = DetectionId {
            frame_id: id,
            index: 0,
        };
        let best_identity = known.map(|identity_id| IdentitySummary {
            id: identity_id,
            display_name: format!("person-{}", identity_id),
            category: Category::Known,
        });
        Candidate {
            event: DetectionEvent {
                id,
                frame_id: id,
                bbox: BoundingBox::new(100, 50, 60, 120),
                person_identity: MatchResult {
                    embedding_id: detection_id,
                    best_identity: best_identity.clone(),
                    similarity: if known.is_some() { 0.9 } else { 0.2 },
                },
                is_known: known.is_some(),
                category: if known.is_some() {
                    Category::Known
                } else {
                    Category::Unknown
                },
                display_name: best_identity.map(|i| i.display_name),
                confidence: 0.7,
                created_at,
                resolution: Resolution::Pending,
                resolved_at: None,
                persisted_identity: None,
                note: None,
            },
            embedding: FaceEmbedding::new(detection_id, vec![0.6, 0.8]),
            snapshot: None,
            speech: None,
        }
    }

    fn describe_pending(arbiter: &DecisionArbiter) -> Option<EventId> {
        arbiter.pending().map(|event| event.id)
    }

    fn timeout() -> Duration {
        ArbiterConfig::default().decision_timeout
    }

    #[test]
    fn first_arrival_pends_and_the_rest_queue_in_order() -> Result<(), ArbiterError> {
        let mut h = harness(ArbiterConfig::default());
        let t0 = Instant::now();
        h.arbiter.submit(candidate(1, 1_000, None), t0);
        h.arbiter.submit(candidate(2, 1_100, None), t0);
        h.arbiter.submit(candidate(3, 1_200, None), t0);
        assert_eq!(describe_pending(&h.arbiter), Some(1));
        assert_eq!(h.arbiter.backlog_len(), 2);

        let t1 = t0 + Duration::from_secs(3);
        let resolved = h.arbiter.respond(HumanResponse::deny(1), t1)?;
        assert_eq!(resolved.resolution, Resolution::Denied);
        assert_eq!(describe_pending(&h.arbiter), Some(2));
        assert_eq!(h.arbiter.deadline(), Some(t1 + timeout()));
        assert_eq!(*h.notified.lock().unwrap(), vec![1, 2]);
        Ok(())
    }

    #[test]
    fn response_for_other_event_is_stale_and_changes_nothing() {
        let mut h = harness(ArbiterConfig::default());
        let t0 = Instant::now();
        h.arbiter.submit(candidate(1, 1_000, None), t0);
        let err = h.arbiter.respond(HumanResponse::allow(7), t0);
        assert_eq!(
            err,
            Err(ArbiterError::StaleResponse {
                event_id: 7,
                pending: Some(1)
            })
        );
        assert_eq!(describe_pending(&h.arbiter), Some(1));
        assert!(h.store.recorded_events().is_empty());
    }

    #[test]
    fn timeout_records_timed_out_and_late_response_is_stale() {
        let mut h = harness(ArbiterConfig {
            decision_timeout: Duration::from_secs(1),
            ..ArbiterConfig::default()
        });
        let t0 = Instant::now();
        h.arbiter.submit(candidate(1, 1_000, None), t0);
        assert!(h.arbiter.expire(t0 + Duration::from_millis(999)).is_none());

        let expired = h.arbiter.expire(t0 + Duration::from_secs(1));
        assert_eq!(expired.map(|e| e.resolution), Some(Resolution::TimedOut));
        assert!(matches!(
            h.arbiter.respond(HumanResponse::allow(1), t0 + Duration::from_secs(2)),
            Err(ArbiterError::StaleResponse { event_id: 1, .. })
        ));
        let recorded = h.store.recorded_events();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].resolution, Resolution::TimedOut);
    }

    #[test]
    fn response_at_deadline_loses_to_timeout() {
        let mut h = harness(ArbiterConfig::default());
        let t0 = Instant::now();
        h.arbiter.submit(candidate(1, 1_000, None), t0);
        let result = h.arbiter.respond(HumanResponse::allow(1), t0 + timeout());
        assert!(result.is_err());
        assert_eq!(h.store.recorded_events()[0].resolution, Resolution::TimedOut);
    }

    #[test]
    fn allow_with_persist_enrolls_unknown_visitor() -> Result<(), ArbiterError> {
        let mut h = harness(ArbiterConfig::default());
        let t0 = Instant::now();
        h.arbiter.submit(candidate(1, 1_000, None), t0);
        let resolved = h
            .arbiter
            .respond(HumanResponse::allow(1).remember_as("Ana"), t0)?;

        let id = resolved.persisted_identity.expect("identity stored");
        let snapshot = h.gallery.snapshot();
        let stored = snapshot.get(id).expect("identity published");
        assert_eq!(stored.display_name, "Ana");
        assert_eq!(stored.embedding, vec![0.6, 0.8]);
        assert_eq!(stored.category, Category::Unknown);
        assert_eq!(h.store.recorded_events()[0].persisted_identity, Some(id));
        Ok(())
    }

    #[test]
    fn persist_without_name_uses_default_display_name() -> Result<(), ArbiterError> {
        let mut h = harness(ArbiterConfig::default());
        let t0 = Instant::now();
        h.arbiter.submit(candidate(1, 1_000, None), t0);
        let mut response = HumanResponse::allow(1).remember_as("   ");
        response.category = Some(Category::Delivery);
        let resolved = h.arbiter.respond(response, t0)?;
        let snapshot = h.gallery.snapshot();
        let stored = resolved
            .persisted_identity
            .and_then(|id| snapshot.get(id))
            .expect("identity stored");
        assert_eq!(stored.display_name, "Visitor");
        assert_eq!(stored.category, Category::Delivery);
        Ok(())
    }

    #[test]
    fn persist_on_known_event_updates_that_identity() -> Result<(), ArbiterError> {
        let store = InMemoryStore::with_identities(vec![identity(4, "Bo", vec![1.0, 0.0])]);
        let mut h = harness_with(ArbiterConfig::default(), store, false);
        let t0 = Instant::now();
        h.arbiter.submit(candidate(1, 1_000, Some(4)), t0);
        let resolved = h.arbiter.respond(HumanResponse::allow(1).remember_as("Bo"), t0)?;
        assert_eq!(resolved.persisted_identity, Some(4));
        let snapshot = h.gallery.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get(4).map(|i| i.embedding.clone()), Some(vec![0.6, 0.8]));
        Ok(())
    }

    #[test]
    fn persist_after_identity_was_removed_enrolls_a_new_one() -> Result<(), ArbiterError> {
        let store = InMemoryStore::with_identities(vec![identity(4, "Bo", vec![1.0, 0.0])]);
        let mut h = harness_with(ArbiterConfig::default(), store, false);
        let t0 = Instant::now();
        h.arbiter.submit(candidate(1, 1_000, Some(4)), t0);
        assert!(h.gallery.remove(4).expect("remove identity"));

        let resolved = h.arbiter.respond(HumanResponse::allow(1).remember_as("Bo"), t0)?;
        let new_id = resolved.persisted_identity.expect("identity enrolled");
        assert_ne!(new_id, 4);
        let snapshot = h.gallery.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get(new_id).map(|i| i.display_name.as_str()), Some("Bo"));
        assert_eq!(h.arbiter.stats().persist_failures, 0);
        Ok(())
    }

    #[test]
    fn failed_persist_still_allows() -> Result<(), ArbiterError> {
        let store = InMemoryStore::new();
        store.inject_transient_failures(2);
        let mut h = harness_with(ArbiterConfig::default(), store, false);
        let t0 = Instant::now();
        h.arbiter.submit(candidate(1, 1_000, None), t0);
        let resolved = h.arbiter.respond(HumanResponse::allow(1).remember_as("Ana"), t0)?;
        assert_eq!(resolved.resolution, Resolution::Allowed);
        assert_eq!(resolved.persisted_identity, None);
        assert!(h.gallery.snapshot().is_empty());
        assert_eq!(h.arbiter.stats().persist_failures, 1);
        Ok(())
    }

    #[test]
    fn deny_ignores_persist_request() -> Result<(), ArbiterError> {
        let mut h = harness(ArbiterConfig::default());
        let t0 = Instant::now();
        h.arbiter.submit(candidate(1, 1_000, None), t0);
        let mut response = HumanResponse::deny(1);
        response.persist = true;
        let resolved = h.arbiter.respond(response, t0)?;
        assert_eq!(resolved.persisted_identity, None);
        assert!(h.gallery.snapshot().is_empty());
        Ok(())
    }

    #[test]
    fn coalesce_folds_same_subject_and_keeps_max_confidence() {
        let mut h = harness(ArbiterConfig {
            pending_policy: PendingPolicy::Coalesce,
            ..ArbiterConfig::default()
        });
        let t0 = Instant::now();
        h.arbiter.submit(candidate(1, 1_000, Some(4)), t0);
        let mut same = candidate(2, 2_000, Some(4));
        same.event.confidence = 0.95;
        h.arbiter.submit(same, t0);
        h.arbiter.submit(candidate(3, 2_500, Some(5)), t0);
        h.arbiter.submit(candidate(4, 9_000, Some(4)), t0);

        assert_eq!(h.arbiter.pending().map(|e| e.confidence), Some(0.95));
        assert_eq!(h.arbiter.view().get().map(|e| e.confidence), Some(0.95));
        assert_eq!(h.arbiter.backlog_len(), 2);
        assert_eq!(h.arbiter.stats().coalesced, 1);
    }

    #[test]
    fn coalesce_matches_unknowns_by_overlap() {
        let mut h = harness(ArbiterConfig {
            pending_policy: PendingPolicy::Coalesce,
            ..ArbiterConfig::default()
        });
        let t0 = Instant::now();
        h.arbiter.submit(candidate(1, 1_000, None), t0);
        h.arbiter.submit(candidate(2, 1_500, None), t0);
        let mut elsewhere = candidate(3, 1_600, None);
        elsewhere.event.bbox = BoundingBox::new(400, 300, 20, 20);
        h.arbiter.submit(elsewhere, t0);
        assert_eq!(h.arbiter.stats().coalesced, 1);
        assert_eq!(h.arbiter.backlog_len(), 1);
    }

    #[test]
    fn full_backlog_sheds_and_records_newest_arrivals() {
        let mut h = harness(ArbiterConfig {
            max_backlog: 1,
            ..ArbiterConfig::default()
        });
        let t0 = Instant::now();
        for id in 1..=4 {
            h.arbiter.submit(candidate(id, 1_000 + id, None), t0);
        }
        assert_eq!(h.arbiter.backlog_len(), 1);
        assert_eq!(h.arbiter.stats().backlog_shed, 2);

        // shed arrivals are still recorded, once, as timed out
        let recorded = h.store.recorded_events();
        assert_eq!(recorded.iter().map(|e| e.id).collect::<Vec<_>>(), vec![3, 4]);
        assert!(recorded
            .iter()
            .all(|e| e.resolution == Resolution::TimedOut && e.note.as_deref() == Some("shed")));
        assert_eq!(h.arbiter.stats().timed_out, 2);

        let closed = h.arbiter.shutdown();
        assert_eq!(closed.iter().map(|e| e.id).collect::<Vec<_>>(), vec![1, 2]);
        let mut ids: Vec<_> = h.store.recorded_events().iter().map(|e| e.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        // shed events never became pending
        assert_eq!(*h.notified.lock().unwrap(), vec![1]);
    }

    #[test]
    fn alert_failure_does_not_block_the_decision() -> Result<(), ArbiterError> {
        let mut h = harness_with(ArbiterConfig::default(), InMemoryStore::new(), true);
        let t0 = Instant::now();
        h.arbiter.submit(candidate(1, 1_000, None), t0);
        assert_eq!(describe_pending(&h.arbiter), Some(1));
        assert_eq!(h.arbiter.stats().alert_failures, 1);
        h.arbiter.respond(HumanResponse::allow(1), t0)?;
        assert_eq!(h.store.recorded_events().len(), 1);
        Ok(())
    }

    #[test]
    fn shutdown_times_out_pending_then_backlog() {
        let mut h = harness(ArbiterConfig::default());
        let t0 = Instant::now();
        for id in 1..=3 {
            h.arbiter.submit(candidate(id, 1_000 + id, None), t0);
        }
        let closed = h.arbiter.shutdown();
        assert_eq!(closed.iter().map(|e| e.id).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(closed
            .iter()
            .all(|e| e.resolution == Resolution::TimedOut && e.note.as_deref() == Some("shutdown")));
        assert!(h.arbiter.pending().is_none());
        assert!(h.arbiter.view().get().is_none());
        assert_eq!(h.store.recorded_events().len(), 3);
        // only the first ever became pending, so only it alerted
        assert_eq!(*h.notified.lock().unwrap(), vec![1]);
    }
}

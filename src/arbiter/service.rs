//! Arbiter thread.
//!
//! The `DecisionArbiter` lives on one thread and is reached only through its inbox, so
//! submissions, responses and the deadline timer are applied one at a time in arrival
//! order. The first of a response and the timeout to reach the thread wins.

use std::thread::JoinHandle;
use std::time::Instant;

use anyhow::{anyhow, Result};
use crossbeam::channel::{self, select, Receiver, Sender};

use super::state::{ArbiterStats, DecisionArbiter, PendingView};
use super::{ArbiterError, Candidate, HumanResponse};
use crate::DetectionEvent;

enum Command {
    Submit(Box<Candidate>),
    Respond(
        HumanResponse,
        Sender<Result<DetectionEvent, ArbiterError>>,
    ),
    Stats(Sender<ArbiterStats>),
    Shutdown,
}

/// Cloneable handle to a running arbiter.
#[derive(Clone)]
pub struct ArbiterHandle {
    tx: Sender<Command>,
    view: PendingView,
}

impl ArbiterHandle {
    /// Hand a candidate to the arbiter. Blocks while the inbox is full.
    pub fn submit(&self, candidate: Candidate) -> Result<(), ArbiterError> {
        self.tx
            .send(Command::Submit(Box::new(candidate)))
            .map_err(|_| ArbiterError::Stopped)
    }

    /// Deliver a human response and wait for the outcome.
    pub fn respond(&self, response: HumanResponse) -> Result<DetectionEvent, ArbiterError> {
        let (reply_tx, reply_rx) = channel::bounded(1);
        self.tx
            .send(Command::Respond(response, reply_tx))
            .map_err(|_| ArbiterError::Stopped)?;
        reply_rx.recv().map_err(|_| ArbiterError::Stopped)?
    }

    /// Snapshot of the pending event. Never waits on the arbiter thread.
    pub fn pending(&self) -> Option<DetectionEvent> {
        self.view.get()
    }

    pub fn stats(&self) -> Result<ArbiterStats, ArbiterError> {
        let (reply_tx, reply_rx) = channel::bounded(1);
        self.tx
            .send(Command::Stats(reply_tx))
            .map_err(|_| ArbiterError::Stopped)?;
        reply_rx.recv().map_err(|_| ArbiterError::Stopped)
    }
}

/// Where the recognize stage delivers candidates.
pub trait CandidateSink: Send {
    fn deliver(&self, candidate: Candidate) -> Result<(), ArbiterError>;
}

impl CandidateSink for ArbiterHandle {
    fn deliver(&self, candidate: Candidate) -> Result<(), ArbiterError> {
        self.submit(candidate)
    }
}

impl CandidateSink for Sender<Candidate> {
    fn deliver(&self, candidate: Candidate) -> Result<(), ArbiterError> {
        self.send(candidate).map_err(|_| ArbiterError::Stopped)
    }
}

pub struct ArbiterService {
    handle: ArbiterHandle,
    join: Option<JoinHandle<Vec<DetectionEvent>>>,
}

impl ArbiterService {
    /// Move `arbiter` onto its own thread. `inbox_capacity` bounds queued commands.
    pub fn spawn(arbiter: DecisionArbiter, inbox_capacity: usize) -> Result<Self> {
        let (tx, rx) = channel::bounded(inbox_capacity.max(1));
        let view = arbiter.view();
        let join = std::thread::Builder::new()
            .name("arbiter".to_string())
            .spawn(move || run(arbiter, rx))?;
        Ok(Self {
            handle: ArbiterHandle { tx, view },
            join: Some(join),
        })
    }

    pub fn handle(&self) -> ArbiterHandle {
        self.handle.clone()
    }

    /// Stop the thread. Open events are resolved as timed out and returned.
    pub fn shutdown(mut self) -> Result<Vec<DetectionEvent>> {
        let _ = self.handle.tx.send(Command::Shutdown);
        match self.join.take() {
            Some(join) => join
                .join()
                .map_err(|_| anyhow!("arbiter thread panicked")),
            None => Ok(Vec::new()),
        }
    }
}

fn run(mut arbiter: DecisionArbiter, rx: Receiver<Command>) -> Vec<DetectionEvent> {
    log::info!("arbiter: running");
    loop {
        let timer = match arbiter.deadline() {
            Some(deadline) => channel::at(deadline),
            None => channel::never(),
        };
        select! {
            recv(rx) -> command => match command {
                Ok(Command::Submit(candidate)) => arbiter.submit(*candidate, Instant::now()),
                Ok(Command::Respond(response, reply)) => {
                    let _ = reply.send(arbiter.respond(response, Instant::now()));
                }
                Ok(Command::Stats(reply)) => {
                    let _ = reply.send(arbiter.stats());
                }
                Ok(Command::Shutdown) | Err(_) => break,
            },
            recv(timer) -> _ => {
                arbiter.expire(Instant::now());
            }
        }
    }
    let closed = arbiter.shutdown();
    log::info!("arbiter: stopped ({:?})", arbiter.stats());
    closed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::LogDispatch;
    use crate::arbiter::ArbiterConfig;
    use crate::detect::{DetectionId, FaceEmbedding};
    use crate::event_log::EventLog;
    use crate::gallery::IdentityGallery;
    use crate::storage::{InMemoryStore, RetryPolicy};
    use crate::test_util::event;
    use crate::Resolution;
    use std::sync::Arc;
    use std::time::Duration;

    fn spawn(config: ArbiterConfig) -> (ArbiterService, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let gallery =
            Arc::new(IdentityGallery::load(store.clone(), 2, RetryPolicy::none()).unwrap());
        let log = Arc::new(EventLog::new(store.clone(), RetryPolicy::none()));
        let arbiter = DecisionArbiter::new(config, gallery, log, Box::new(LogDispatch));
        (ArbiterService::spawn(arbiter, 8).unwrap(), store)
    }

    fn candidate(id: u64) -> Candidate {
        Candidate {
            event: event(id, 1_000 + id, Resolution::Pending),
            embedding: FaceEmbedding::new(
                DetectionId {
                    frame_id: id,
                    index: 0,
                },
                vec![1.0, 0.0],
            ),
            snapshot: None,
            speech: None,
        }
    }

    fn wait_for_pending(handle: &ArbiterHandle, id: u64) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.pending().map(|e| e.id) != Some(id) {
            assert!(Instant::now() < deadline, "event {} never became pending", id);
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn respond_through_handle_resolves_pending() -> Result<()> {
        let (service, store) = spawn(ArbiterConfig::default());
        let handle = service.handle();
        handle.submit(candidate(1))?;
        wait_for_pending(&handle, 1);
        let resolved = handle.respond(crate::HumanResponse::allow(1))?;
        assert_eq!(resolved.resolution, Resolution::Allowed);
        assert!(handle.pending().is_none());
        assert_eq!(handle.stats()?.allowed, 1);
        service.shutdown()?;
        assert_eq!(store.recorded_events().len(), 1);
        Ok(())
    }

    #[test]
    fn deadline_timer_fires_within_its_window_without_any_traffic() -> Result<()> {
        let timeout = Duration::from_millis(200);
        let slack = Duration::from_millis(500);
        let (service, store) = spawn(ArbiterConfig {
            decision_timeout: timeout,
            ..ArbiterConfig::default()
        });
        let handle = service.handle();
        let started = Instant::now();
        let submitted_ms = crate::now_ms();
        handle.submit(candidate(1))?;

        // nothing can resolve before the deadline
        std::thread::sleep(timeout - Duration::from_millis(50));
        assert!(store.recorded_events().is_empty(), "resolved before its deadline");

        while store.recorded_events().is_empty() {
            assert!(started.elapsed() < timeout + slack, "timeout fired late");
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(started.elapsed() >= timeout);
        let recorded = &store.recorded_events()[0];
        assert_eq!(recorded.resolution, Resolution::TimedOut);
        let resolved_at = recorded.resolved_at.expect("resolved_at set");
        assert!(resolved_at >= submitted_ms + timeout.as_millis() as u64);
        assert!(matches!(
            handle.respond(crate::HumanResponse::allow(1)),
            Err(ArbiterError::StaleResponse { .. })
        ));
        service.shutdown()?;
        Ok(())
    }

    #[test]
    fn shutdown_returns_open_events_and_handles_report_stopped() -> Result<()> {
        let (service, _store) = spawn(ArbiterConfig::default());
        let handle = service.handle();
        handle.submit(candidate(1))?;
        handle.submit(candidate(2))?;
        wait_for_pending(&handle, 1);
        let closed = service.shutdown()?;
        assert_eq!(closed.iter().map(|e| e.id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(handle.submit(candidate(3)), Err(ArbiterError::Stopped));
        Ok(())
    }
}

//! Stage loops. Each runs on its own thread and consumes its input in FIFO order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender};

use super::queue::LatestSender;
use super::PipelineCounters;
use crate::arbiter::service::CandidateSink;
use crate::arbiter::Candidate;
use crate::classify::{Classifier, Outcome};
use crate::detect::{Detection, Detector, Embedder, FaceEmbedding, ModelUnavailable};
use crate::frame::{BoundingBox, FaceCrop, Frame};
use crate::gallery::{IdentityGallery, IdentityId};
use crate::ingest::{FrameSource, ReconnectPolicy, SourceFailure};
use crate::matcher::{MatchError, Matcher};
use crate::{DetectionEvent, EventId, Resolution};

const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

/// Why the capture loop stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CaptureExit {
    EndOfStream,
    Shutdown,
    /// Reconnect attempts ran out.
    SourceFailed(SourceFailure),
}

/// A frame with the person detections worth recognizing.
pub(crate) struct DetectedFrame {
    pub frame: Frame,
    pub persons: Vec<Detection>,
}

// ----------------------------------------------------------------------------
// Capture
// ----------------------------------------------------------------------------

pub(crate) fn capture_loop(
    mut source: Box<dyn FrameSource>,
    queue: LatestSender<Frame>,
    policy: ReconnectPolicy,
    counters: Arc<PipelineCounters>,
    shutdown: Arc<AtomicBool>,
) -> CaptureExit {
    let mut last_sequence = 0u64;
    log::info!("capture: reading from {}", source.name());
    while !shutdown.load(Ordering::SeqCst) {
        match source.next() {
            Ok(Some(frame)) => {
                if frame.sequence_id <= last_sequence {
                    log::warn!(
                        "capture: dropping out-of-order frame {} (last {})",
                        frame.sequence_id,
                        last_sequence
                    );
                    counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                last_sequence = frame.sequence_id;
                counters.frames_captured.fetch_add(1, Ordering::Relaxed);
                for stale in queue.push(frame) {
                    log::debug!("capture: frame {} superseded", stale.sequence_id);
                    counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            Ok(None) => {
                log::info!("capture: {} reached end of stream", source.name());
                return CaptureExit::EndOfStream;
            }
            Err(failure) => {
                counters.source_failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("capture: {}: {}", source.name(), failure);
                if let Err(exit) =
                    reconnect(source.as_mut(), failure, &policy, &counters, &shutdown)
                {
                    return exit;
                }
            }
        }
    }
    CaptureExit::Shutdown
}

fn reconnect(
    source: &mut dyn FrameSource,
    failure: SourceFailure,
    policy: &ReconnectPolicy,
    counters: &PipelineCounters,
    shutdown: &AtomicBool,
) -> Result<(), CaptureExit> {
    let mut last_failure = failure;
    for attempt in 0..policy.max_attempts {
        if !sleep_unless_shutdown(policy.backoff(attempt), shutdown) {
            return Err(CaptureExit::Shutdown);
        }
        match source.reconnect() {
            Ok(()) => {
                counters.reconnects.fetch_add(1, Ordering::Relaxed);
                log::info!(
                    "capture: {} reconnected after {} attempt(s)",
                    source.name(),
                    attempt + 1
                );
                return Ok(());
            }
            Err(e) => {
                log::warn!(
                    "capture: reconnect {}/{} failed: {}",
                    attempt + 1,
                    policy.max_attempts,
                    e
                );
                last_failure = e;
            }
        }
    }
    log::error!("capture: giving up on {}: {}", source.name(), last_failure);
    Err(CaptureExit::SourceFailed(last_failure))
}

/// Sleep for `total`, waking early on shutdown. Returns false if shutdown was requested.
fn sleep_unless_shutdown(total: Duration, shutdown: &AtomicBool) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep((deadline - now).min(SHUTDOWN_POLL));
    }
}

// ----------------------------------------------------------------------------
// Detect
// ----------------------------------------------------------------------------

pub(crate) fn detect_stage(
    mut detector: Box<dyn Detector>,
    frames: Receiver<Frame>,
    out: Sender<DetectedFrame>,
    min_confidence: f32,
    counters: Arc<PipelineCounters>,
) {
    if let Err(e) = detector.warm_up() {
        log::warn!("detect: warm-up failed: {}", e);
    }
    for frame in frames.iter() {
        let detections = match detector.detect(&frame) {
            Ok(detections) => detections,
            Err(e) => {
                counters.detector_failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("detect: frame {}: {}", frame.sequence_id, e);
                Vec::new()
            }
        };
        counters.frames_processed.fetch_add(1, Ordering::Relaxed);
        let persons = persons_in(&frame, detections, min_confidence);
        if persons.is_empty() {
            continue;
        }
        if out.send(DetectedFrame { frame, persons }).is_err() {
            break;
        }
    }
    log::debug!("detect: input closed");
}

/// Person detections at or above `min_confidence`, renumbered for this frame.
fn persons_in(frame: &Frame, detections: Vec<Detection>, min_confidence: f32) -> Vec<Detection> {
    detections
        .into_iter()
        .filter(|d| d.is_person() && d.confidence >= min_confidence)
        .enumerate()
        .map(|(index, mut d)| {
            d.frame_id = frame.sequence_id;
            d.index = index as u32;
            d
        })
        .collect()
}

// ----------------------------------------------------------------------------
// Recognize
// ----------------------------------------------------------------------------

pub(crate) struct Recognizer {
    pub embedder: Arc<dyn Embedder>,
    pub matcher: Arc<dyn Matcher>,
    pub gallery: Arc<IdentityGallery>,
    pub classifier: Classifier,
    pub cooldown: SubjectCooldown,
    pub next_event_id: EventId,
    pub counters: Arc<PipelineCounters>,
}

type Embedded = Result<Option<FaceEmbedding>, ModelUnavailable>;

impl Recognizer {
    pub fn run(mut self, frames: Receiver<DetectedFrame>, sink: Box<dyn CandidateSink>) {
        for detected in frames.iter() {
            for candidate in self.recognize(detected) {
                if let Err(e) = sink.deliver(candidate) {
                    log::warn!("recognize: {}; stopping", e);
                    return;
                }
            }
        }
        log::debug!("recognize: input closed");
    }

    fn recognize(&mut self, detected: DetectedFrame) -> Vec<Candidate> {
        let DetectedFrame { frame, persons } = detected;
        let snapshot = self.gallery.snapshot();
        let embedded = self.embed_all(&frame, &persons);

        let mut candidates = Vec::new();
        for (detection, result) in persons.into_iter().zip(embedded) {
            let embedding = match result {
                Ok(Some(embedding)) => embedding,
                Ok(None) => {
                    self.counters.no_face.fetch_add(1, Ordering::Relaxed);
                    log::debug!("recognize: no face in detection {:?}", detection.id());
                    continue;
                }
                Err(e) => {
                    self.counters.embedder_failures.fetch_add(1, Ordering::Relaxed);
                    log::warn!("recognize: detection {:?}: {}", detection.id(), e);
                    continue;
                }
            };
            let matched = match self.matcher.best_match(&embedding, &snapshot) {
                Ok(matched) => matched,
                Err(e @ MatchError::DimensionMismatch { .. }) => {
                    self.counters
                        .dimension_mismatches
                        .fetch_add(1, Ordering::Relaxed);
                    log::warn!(
                        "recognize: excluding embedding {:?}: {}",
                        embedding.detection_id,
                        e
                    );
                    continue;
                }
            };
            let outcome = self.classifier.classify(&detection, &matched);
            if !self
                .cooldown
                .admit(Subject::of(&outcome, &detection), frame.captured_at)
            {
                self.counters
                    .events_suppressed
                    .fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "recognize: suppressing repeat of {} in frame {}",
                    outcome.display_name().unwrap_or("unknown subject"),
                    frame.sequence_id
                );
                continue;
            }

            let event = DetectionEvent {
                id: self.next_event_id,
                frame_id: frame.sequence_id,
                bbox: detection.bbox,
                person_identity: matched,
                is_known: outcome.is_known(),
                category: outcome.category(),
                display_name: outcome.display_name().map(str::to_string),
                confidence: detection.confidence,
                created_at: frame.captured_at,
                resolution: Resolution::Pending,
                resolved_at: None,
                persisted_identity: None,
                note: None,
            };
            self.next_event_id += 1;
            self.counters.events_emitted.fetch_add(1, Ordering::Relaxed);
            candidates.push(Candidate {
                event,
                embedding,
                snapshot: Some(frame.annotate(&detection.bbox)),
                speech: Some(outcome.speech_text()),
            });
        }
        candidates
    }

    /// One result per detection, in detection order.
    fn embed_all(&self, frame: &Frame, persons: &[Detection]) -> Vec<Embedded> {
        let crops: Vec<Option<FaceCrop>> = persons
            .iter()
            .map(|d| frame.face_crop(d.id(), &d.bbox))
            .collect();
        if crops.len() <= 1 {
            return crops.iter().map(|c| self.embed_one(c.as_ref())).collect();
        }
        std::thread::scope(|scope| {
            let workers: Vec<_> = crops
                .iter()
                .map(|crop| scope.spawn(move || self.embed_one(crop.as_ref())))
                .collect();
            workers
                .into_iter()
                .map(|worker| {
                    worker.join().unwrap_or_else(|_| {
                        log::error!("recognize: embedding worker panicked");
                        Err(ModelUnavailable::new(self.embedder.name(), "worker panicked"))
                    })
                })
                .collect()
        })
    }

    fn embed_one(&self, crop: Option<&FaceCrop>) -> Embedded {
        match crop {
            Some(crop) => self.embedder.embed(crop),
            None => Ok(None),
        }
    }
}

// ----------------------------------------------------------------------------
// Cooldown
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Subject {
    Known(IdentityId),
    Unknown(BoundingBox),
}

impl Subject {
    fn of(outcome: &Outcome, detection: &Detection) -> Self {
        match outcome {
            Outcome::Recognized { identity, .. } => Subject::Known(identity.id),
            Outcome::Unknown { .. } => Subject::Unknown(detection.bbox),
        }
    }

    fn same_as(&self, other: &Subject, min_iou: f32) -> bool {
        match (self, other) {
            (Subject::Known(a), Subject::Known(b)) => a == b,
            (Subject::Unknown(a), Subject::Unknown(b)) => a.iou(b) >= min_iou,
            _ => false,
        }
    }
}

/// Suppresses repeat events for one subject. The window runs from the first emitted
/// event and is not extended by suppressed repeats.
pub(crate) struct SubjectCooldown {
    window_ms: u64,
    min_iou: f32,
    recent: Vec<(Subject, u64)>,
}

impl SubjectCooldown {
    pub fn new(window: Duration, min_iou: f32) -> Self {
        Self {
            window_ms: window.as_millis() as u64,
            min_iou,
            recent: Vec::new(),
        }
    }

    /// True if an event for `subject` at `at_ms` should be emitted.
    pub fn admit(&mut self, subject: Subject, at_ms: u64) -> bool {
        let window_ms = self.window_ms;
        self.recent
            .retain(|(_, emitted)| at_ms.saturating_sub(*emitted) < window_ms);
        if self
            .recent
            .iter()
            .any(|(seen, _)| seen.same_as(&subject, self.min_iou))
        {
            return false;
        }
        if window_ms > 0 {
            self.recent.push((subject, at_ms));
        }
        true
    }
}

//! Detection pipeline.
//!
//! Three threads connected by bounded queues:
//!
//! ```text
//! capture --keep-latest--> detect --bounded--> recognize --> CandidateSink (arbiter)
//! ```
//!
//! Capture never blocks on a slow detector: queued frames that have not started are
//! superseded by newer ones. Detect and recognize each consume in FIFO order, so
//! candidates reach the sink in non-decreasing frame order. Parallelism exists only
//! inside one frame, when several people are embedded at once.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Result};
use crossbeam::channel;
use serde::Serialize;

use crate::arbiter::service::CandidateSink;
use crate::classify::Classifier;
use crate::detect::{Detector, Embedder};
use crate::gallery::IdentityGallery;
use crate::ingest::{FrameSource, ReconnectPolicy};
use crate::matcher::Matcher;
use crate::EventId;

pub mod queue;
mod stages;

pub use stages::CaptureExit;

use stages::{Recognizer, SubjectCooldown};

#[derive(Clone, Debug, PartialEq)]
pub struct PipelineConfig {
    /// Frames in flight between capture and detect, and between detect and recognize.
    pub queue_capacity: usize,
    pub recognition_threshold: f32,
    /// Person boxes below this detector confidence are ignored.
    pub min_detection_confidence: f32,
    /// Repeat events for one subject inside this window are suppressed. Zero disables.
    pub alert_cooldown: Duration,
    /// Box overlap at which two unknown detections count as the same subject.
    pub cooldown_iou: f32,
    pub reconnect: ReconnectPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 2,
            recognition_threshold: 0.6,
            min_detection_confidence: 0.5,
            alert_cooldown: Duration::from_secs(5),
            cooldown_iou: 0.3,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Collaborators the pipeline runs.
pub struct PipelineParts {
    pub source: Box<dyn FrameSource>,
    pub detector: Box<dyn Detector>,
    pub embedder: Arc<dyn Embedder>,
    pub matcher: Arc<dyn Matcher>,
    pub gallery: Arc<IdentityGallery>,
    pub sink: Box<dyn CandidateSink>,
    /// Id given to the first emitted event; later ones count up from it.
    pub first_event_id: EventId,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub frames_captured: u64,
    /// Superseded in the keep-latest queue, or out of sequence.
    pub frames_dropped: u64,
    /// Frames that went through the detector.
    pub frames_processed: u64,
    pub detector_failures: u64,
    pub embedder_failures: u64,
    pub no_face: u64,
    pub dimension_mismatches: u64,
    pub events_emitted: u64,
    pub events_suppressed: u64,
    pub source_failures: u64,
    pub reconnects: u64,
}

#[derive(Default)]
pub(crate) struct PipelineCounters {
    pub frames_captured: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub frames_processed: AtomicU64,
    pub detector_failures: AtomicU64,
    pub embedder_failures: AtomicU64,
    pub no_face: AtomicU64,
    pub dimension_mismatches: AtomicU64,
    pub events_emitted: AtomicU64,
    pub events_suppressed: AtomicU64,
    pub source_failures: AtomicU64,
    pub reconnects: AtomicU64,
}

impl PipelineCounters {
    fn snapshot(&self) -> PipelineStats {
        let read = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        PipelineStats {
            frames_captured: read(&self.frames_captured),
            frames_dropped: read(&self.frames_dropped),
            frames_processed: read(&self.frames_processed),
            detector_failures: read(&self.detector_failures),
            embedder_failures: read(&self.embedder_failures),
            no_face: read(&self.no_face),
            dimension_mismatches: read(&self.dimension_mismatches),
            events_emitted: read(&self.events_emitted),
            events_suppressed: read(&self.events_suppressed),
            source_failures: read(&self.source_failures),
            reconnects: read(&self.reconnects),
        }
    }
}

pub struct Pipeline;

impl Pipeline {
    /// Start the capture, detect and recognize threads.
    pub fn spawn(config: PipelineConfig, parts: PipelineParts) -> Result<PipelineHandle> {
        if parts.embedder.dimension() != parts.gallery.dimension() {
            log::warn!(
                "pipeline: embedder {} produces {}-d vectors but the gallery holds {}-d; \
                 every match will be rejected",
                parts.embedder.name(),
                parts.embedder.dimension(),
                parts.gallery.dimension()
            );
        }

        let counters = Arc::new(PipelineCounters::default());
        let shutdown = Arc::new(AtomicBool::new(false));
        let (frame_tx, frame_rx) = queue::keep_latest(config.queue_capacity);
        let (detected_tx, detected_rx) = channel::bounded(config.queue_capacity.max(1));

        let recognizer = Recognizer {
            embedder: parts.embedder,
            matcher: parts.matcher,
            gallery: parts.gallery,
            classifier: Classifier::new(config.recognition_threshold),
            cooldown: SubjectCooldown::new(config.alert_cooldown, config.cooldown_iou),
            next_event_id: parts.first_event_id,
            counters: Arc::clone(&counters),
        };
        let sink = parts.sink;
        let recognize = std::thread::Builder::new()
            .name("recognize".to_string())
            .spawn(move || recognizer.run(detected_rx, sink))?;

        let detector = parts.detector;
        let min_confidence = config.min_detection_confidence;
        let detect_counters = Arc::clone(&counters);
        let detect = std::thread::Builder::new()
            .name("detect".to_string())
            .spawn(move || {
                stages::detect_stage(
                    detector,
                    frame_rx,
                    detected_tx,
                    min_confidence,
                    detect_counters,
                )
            })?;

        let source = parts.source;
        let policy = config.reconnect.clone();
        let capture_counters = Arc::clone(&counters);
        let capture_shutdown = Arc::clone(&shutdown);
        let capture = std::thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || {
                stages::capture_loop(source, frame_tx, policy, capture_counters, capture_shutdown)
            })?;

        log::info!(
            "pipeline: started (queue capacity {}, threshold {:.2})",
            config.queue_capacity,
            config.recognition_threshold
        );
        Ok(PipelineHandle {
            shutdown,
            counters,
            capture: Some(capture),
            detect: Some(detect),
            recognize: Some(recognize),
        })
    }
}

pub struct PipelineHandle {
    shutdown: Arc<AtomicBool>,
    counters: Arc<PipelineCounters>,
    capture: Option<JoinHandle<CaptureExit>>,
    detect: Option<JoinHandle<()>>,
    recognize: Option<JoinHandle<()>>,
}

impl PipelineHandle {
    pub fn stats(&self) -> PipelineStats {
        self.counters.snapshot()
    }

    /// Ask capture to stop. Frames already queued are still processed.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// True once every stage thread has exited.
    pub fn is_finished(&self) -> bool {
        [
            self.capture.as_ref().map(JoinHandle::is_finished),
            self.detect.as_ref().map(JoinHandle::is_finished),
            self.recognize.as_ref().map(JoinHandle::is_finished),
        ]
        .into_iter()
        .all(|finished| finished.unwrap_or(true))
    }

    /// Wait for capture to stop and the downstream stages to drain. Stats stay readable
    /// afterwards; a second call returns `CaptureExit::Shutdown` at once.
    pub fn join(&mut self) -> Result<CaptureExit> {
        let exit = match self.capture.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| anyhow!("capture thread panicked"))?,
            None => CaptureExit::Shutdown,
        };
        for (name, handle) in [
            ("detect", self.detect.take()),
            ("recognize", self.recognize.take()),
        ] {
            if let Some(handle) = handle {
                handle
                    .join()
                    .map_err(|_| anyhow!("{} thread panicked", name))?;
            }
        }
        log::info!("pipeline: stopped ({:?}): {:?}", exit, self.counters.snapshot());
        Ok(exit)
    }
}

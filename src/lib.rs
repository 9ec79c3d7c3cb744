//! Doorman access kernel
//!
//! This crate turns a live camera feed into human-confirmed access decisions.
//!
//! # Architecture
//!
//! Frames flow through three pipeline stages and end at a single decision point:
//!
//! 1. **Capture**: a `FrameSource` feeds a keep-latest queue. Stale frames are superseded.
//! 2. **Detect**: a `Detector` finds people. Model failures degrade to zero detections.
//! 3. **Recognize**: an `Embedder` and `Matcher` compare each face against the
//!    `IdentityGallery`, and the classifier marks the detection known or unknown.
//! 4. **Decide**: the `DecisionArbiter` holds at most one pending decision, applies the
//!    human response (or the timeout), and records the resolved event exactly once.
//!
//! # Module Structure
//!
//! - `frame`: Frame ownership (Frame, FrameClock, FaceCrop, Snapshot)
//! - `ingest`: Frame sources (synthetic, raw RGB files) and reconnect policy
//! - `detect`: Detector/Embedder traits, detections, built-in backends
//! - `gallery`, `matcher`, `classify`: recognition
//! - `pipeline`: stage threads and keep-latest back-pressure
//! - `arbiter`: single-pending decision state machine and its service thread
//! - `event_log`, `storage`, `chain`: durable, append-only history
//! - `alert`, `api`, `config`: edges
//! - Core types: DetectionEvent, Resolution

use anyhow::{anyhow, Result};
use rand::RngCore;
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod alert;
pub mod api;
pub mod arbiter;
pub mod chain;
pub mod classify;
pub mod config;
pub mod detect;
pub mod event_log;
pub mod frame;
pub mod gallery;
pub mod ingest;
pub mod matcher;
pub mod pipeline;
pub mod storage;

#[cfg(test)]
pub(crate) mod test_util;

pub use alert::{Alert, AlertDispatch, LogDispatch, MqttDispatch};
pub use arbiter::{
    service::{ArbiterHandle, ArbiterService, CandidateSink},
    state::DecisionArbiter,
    Action, ArbiterConfig, ArbiterError, Candidate, HumanResponse, PendingPolicy,
};
pub use classify::{classify, Classifier, Outcome};
pub use config::DoormanConfig;
pub use detect::{
    Detection, DetectionId, Detector, Embedder, FaceEmbedding, ModelUnavailable, ObjectClass,
};
pub use event_log::{EventLog, EventStats, History, Recorded};
pub use frame::{BoundingBox, FaceCrop, Frame, FrameClock, Snapshot};
pub use gallery::{
    Category, GalleryError, GallerySnapshot, Identity, IdentityGallery, IdentityId,
    IdentitySummary, NewIdentity,
};
pub use ingest::{FileSource, FrameSource, ReconnectPolicy, SourceFailure, SyntheticSource};
pub use matcher::{LinearMatcher, MatchError, MatchResult, Matcher};
pub use pipeline::{
    CaptureExit, Pipeline, PipelineConfig, PipelineHandle, PipelineParts, PipelineStats,
};
pub use storage::{
    EventCursor, InMemoryStore, Persistence, PersistenceError, RetryPolicy, SqliteStore,
};

/// Unique in-memory SQLite URI, shared between connections of one process.
pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:doorman_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}

/// Wall-clock milliseconds since the epoch. A clock set before 1970 reads as zero.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Start of the current UTC day in epoch milliseconds.
pub fn start_of_day_ms(at_ms: u64) -> u64 {
    at_ms - at_ms % 86_400_000
}

// -------------------- Detection Events --------------------

pub type EventId = u64;

/// Lifecycle of a detection event. `Pending` is the only non-terminal state.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Pending,
    Allowed,
    Denied,
    TimedOut,
}

impl Resolution {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Resolution::Pending)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Resolution::Pending => "pending",
            Resolution::Allowed => "allowed",
            Resolution::Denied => "denied",
            Resolution::TimedOut => "timed_out",
        }
    }
}

impl std::str::FromStr for Resolution {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(Resolution::Pending),
            "allowed" => Ok(Resolution::Allowed),
            "denied" => Ok(Resolution::Denied),
            "timed_out" | "timeout" => Ok(Resolution::TimedOut),
            other => Err(anyhow!("unknown resolution '{}'", other)),
        }
    }
}

/// One person detection that reached the decision point.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DetectionEvent {
    pub id: EventId,
    pub frame_id: u64,
    pub bbox: BoundingBox,
    pub person_identity: MatchResult,
    pub is_known: bool,
    pub category: Category,
    pub display_name: Option<String>,
    /// Detector confidence for the person box.
    pub confidence: f32,
    /// Capture time of the source frame, epoch milliseconds.
    pub created_at: u64,
    pub resolution: Resolution,
    pub resolved_at: Option<u64>,
    /// Identity written to the gallery when the response asked to persist.
    pub persisted_identity: Option<IdentityId>,
    pub note: Option<String>,
}

impl DetectionEvent {
    /// Move out of `Pending`. A second resolution is refused.
    pub fn resolve(&mut self, resolution: Resolution, at_ms: u64) -> Result<()> {
        if self.resolution.is_terminal() {
            return Err(anyhow!(
                "event {} already resolved as {}",
                self.id,
                self.resolution.as_str()
            ));
        }
        if !resolution.is_terminal() {
            return Err(anyhow!("event {} cannot resolve to pending", self.id));
        }
        self.resolution = resolution;
        self.resolved_at = Some(at_ms);
        Ok(())
    }

    /// Name shown to the operator: the matched name, or "Unknown".
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or("Unknown")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_event() -> DetectionEvent {
        DetectionEvent {
            id: 7,
            frame_id: 3,
            bbox: BoundingBox::new(1, 2, 3, 4),
            person_identity: MatchResult::no_match(DetectionId {
                frame_id: 3,
                index: 0,
            }),
            is_known: false,
            category: Category::Unknown,
            display_name: None,
            confidence: 0.9,
            created_at: 1_000,
            resolution: Resolution::Pending,
            resolved_at: None,
            persisted_identity: None,
            note: None,
        }
    }

    #[test]
    fn event_resolves_exactly_once() -> Result<()> {
        let mut event = pending_event();
        event.resolve(Resolution::Denied, 2_000)?;
        assert_eq!(event.resolution, Resolution::Denied);
        assert_eq!(event.resolved_at, Some(2_000));
        assert!(event.resolve(Resolution::Allowed, 3_000).is_err());
        assert_eq!(event.resolution, Resolution::Denied);
        Ok(())
    }

    #[test]
    fn pending_is_not_a_resolution() {
        let mut event = pending_event();
        assert!(event.resolve(Resolution::Pending, 2_000).is_err());
        assert_eq!(event.resolved_at, None);
    }

    #[test]
    fn resolution_round_trips_through_text() -> Result<()> {
        for r in [
            Resolution::Pending,
            Resolution::Allowed,
            Resolution::Denied,
            Resolution::TimedOut,
        ] {
            assert_eq!(r.as_str().parse::<Resolution>()?, r);
        }
        assert_eq!("timeout".parse::<Resolution>()?, Resolution::TimedOut);
        Ok(())
    }

    #[test]
    fn day_start_truncates() {
        assert_eq!(start_of_day_ms(86_400_000 * 3 + 5), 86_400_000 * 3);
    }
}

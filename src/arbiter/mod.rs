//! Single-pending decision point.
//!
//! - `state`: the deterministic state machine. Time is passed in, never read.
//! - `service`: the thread that owns the state machine and the `ArbiterHandle` to reach it.
//!
//! At most one event is pending at any instant. Other arrivals either wait in a bounded
//! FIFO backlog or fold into the pending event, depending on `PendingPolicy`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::detect::FaceEmbedding;
use crate::frame::Snapshot;
use crate::gallery::Category;
use crate::{DetectionEvent, EventId};

pub mod service;
pub mod state;

/// What happens to a candidate that arrives while a decision is pending.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingPolicy {
    /// Wait in FIFO order behind the pending event.
    #[default]
    Queue,
    /// Fold into the pending event when it is the same subject, otherwise queue.
    Coalesce,
}

impl std::str::FromStr for PendingPolicy {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> anyhow::Result<Self> {
        match value {
            "queue" => Ok(PendingPolicy::Queue),
            "coalesce" => Ok(PendingPolicy::Coalesce),
            other => Err(anyhow::anyhow!(
                "unknown pending policy '{}' (expected queue or coalesce)",
                other
            )),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ArbiterConfig {
    pub decision_timeout: Duration,
    pub pending_policy: PendingPolicy,
    /// Coalesce only candidates created within this long of the pending event.
    pub coalesce_window: Duration,
    /// Minimum box overlap for two unknown detections to count as one subject.
    pub coalesce_iou: f32,
    /// Backlog bound. Arrivals beyond it are shed.
    pub max_backlog: usize,
    /// Name stored when a response persists a visitor without naming them.
    pub default_display_name: String,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            decision_timeout: Duration::from_secs(45),
            pending_policy: PendingPolicy::Queue,
            coalesce_window: Duration::from_secs(5),
            coalesce_iou: 0.3,
            max_backlog: 32,
            default_display_name: "Visitor".to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Allow,
    Deny,
}

/// Operator decision on one event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HumanResponse {
    pub event_id: EventId,
    pub action: Action,
    /// Remember this person in the gallery. Honored only with `Allow`.
    #[serde(default)]
    pub persist: bool,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub category: Option<Category>,
}

impl HumanResponse {
    pub fn allow(event_id: EventId) -> Self {
        Self {
            event_id,
            action: Action::Allow,
            persist: false,
            display_name: None,
            category: None,
        }
    }

    pub fn deny(event_id: EventId) -> Self {
        Self {
            action: Action::Deny,
            ..Self::allow(event_id)
        }
    }

    /// Persist the person under `name` when allowed.
    pub fn remember_as(mut self, name: impl Into<String>) -> Self {
        self.persist = true;
        self.display_name = Some(name.into());
        self
    }

    pub fn with_category(mut self, category: Category) -> Self {
        self.category = Some(category);
        self
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ArbiterError {
    /// The event is not the one pending: already resolved, timed out, or never issued.
    #[error("stale response for event {event_id} (pending: {pending:?})")]
    StaleResponse {
        event_id: EventId,
        pending: Option<EventId>,
    },
    #[error("decision arbiter is not running")]
    Stopped,
}

/// One recognized detection on its way to the decision point.
#[derive(Debug)]
pub struct Candidate {
    pub event: DetectionEvent,
    /// Kept so an Allow+persist can enroll the face.
    pub embedding: FaceEmbedding,
    pub snapshot: Option<Snapshot>,
    pub speech: Option<String>,
}

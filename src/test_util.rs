//! Builders shared by unit tests.

use crate::detect::DetectionId;
use crate::frame::BoundingBox;
use crate::gallery::{Category, Identity, IdentityId};
use crate::matcher::MatchResult;
use crate::{DetectionEvent, EventId, Resolution};

pub(crate) fn event(id: EventId, created_at: u64, resolution: Resolution) -> DetectionEvent {
    DetectionEvent {
        id,
        frame_id: id,
        bbox: BoundingBox::new(10, 10, 40, 80),
        person_identity: MatchResult::no_match(DetectionId {
            frame_id: id,
            index: 0,
        }),
        is_known: false,
        category: Category::Unknown,
        display_name: None,
        confidence: 0.9,
        created_at,
        resolution,
        resolved_at: resolution.is_terminal().then_some(created_at),
        persisted_identity: None,
        note: None,
    }
}

pub(crate) fn identity(id: IdentityId, name: &str, embedding: Vec<f32>) -> Identity {
    Identity {
        id,
        display_name: name.to_string(),
        embedding,
        category: Category::Known,
        photo_reference: None,
    }
}

//! Known/unknown decision for one detection.
//!
//! A detection is recognized when its best match scores at or above the threshold. The
//! comparison is inclusive: a score exactly equal to the threshold is recognized.

use crate::detect::Detection;
use crate::gallery::{Category, IdentitySummary};
use crate::matcher::MatchResult;

#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    Recognized {
        identity: IdentitySummary,
        similarity: f32,
    },
    Unknown {
        similarity: f32,
    },
}

impl Outcome {
    pub fn is_known(&self) -> bool {
        matches!(self, Outcome::Recognized { .. })
    }

    pub fn category(&self) -> Category {
        match self {
            Outcome::Recognized { identity, .. } => identity.category,
            Outcome::Unknown { .. } => Category::Unknown,
        }
    }

    pub fn display_name(&self) -> Option<&str> {
        match self {
            Outcome::Recognized { identity, .. } => Some(&identity.display_name),
            Outcome::Unknown { .. } => None,
        }
    }

    pub fn similarity(&self) -> f32 {
        match self {
            Outcome::Recognized { similarity, .. } | Outcome::Unknown { similarity } => {
                *similarity
            }
        }
    }

    /// Announcement for the door speaker.
    pub fn speech_text(&self) -> String {
        match self {
            Outcome::Recognized { identity, .. } => match identity.category {
                Category::Delivery => format!(
                    "Hello {}, please leave the delivery at the door.",
                    identity.display_name
                ),
                _ => format!("Welcome back, {}.", identity.display_name),
            },
            Outcome::Unknown { .. } => {
                "Hello. Please wait while someone confirms your visit.".to_string()
            }
        }
    }
}

/// Only person detections can be recognized; anything else is unknown.
pub fn classify(detection: &Detection, result: &MatchResult, threshold: f32) -> Outcome {
    match &result.best_identity {
        Some(identity) if detection.is_person() && result.similarity >= threshold => {
            Outcome::Recognized {
                identity: identity.clone(),
                similarity: result.similarity,
            }
        }
        _ => Outcome::Unknown {
            similarity: result.similarity,
        },
    }
}

/// `classify` bound to a configured threshold.
#[derive(Clone, Copy, Debug)]
pub struct Classifier {
    threshold: f32,
}

impl Classifier {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn classify(&self, detection: &Detection, result: &MatchResult) -> Outcome {
        classify(detection, result, self.threshold)
    }
}

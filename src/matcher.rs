//! Embedding matcher.
//!
//! Similarity is cosine similarity. Identities scoring below 0.0 are never candidates, so
//! every reported score is in [0, 1].
//! Ties go to the lowest identity id: candidates are visited in ascending id order and the
//! best is replaced only on a strictly greater score.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::detect::{DetectionId, FaceEmbedding};
use crate::gallery::{GallerySnapshot, IdentityId, IdentitySummary};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum MatchError {
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Best gallery candidate for one embedding, whether or not it clears the threshold.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub embedding_id: DetectionId,
    pub best_identity: Option<IdentitySummary>,
    pub similarity: f32,
}

impl MatchResult {
    pub fn no_match(embedding_id: DetectionId) -> Self {
        Self {
            embedding_id,
            best_identity: None,
            similarity: 0.0,
        }
    }

    pub fn best_identity_id(&self) -> Option<IdentityId> {
        self.best_identity.as_ref().map(|identity| identity.id)
    }
}

pub trait Matcher: Send + Sync {
    fn best_match(
        &self,
        embedding: &FaceEmbedding,
        gallery: &GallerySnapshot,
    ) -> Result<MatchResult, MatchError>;
}

/// Negatively correlated identities are not candidates.
const SIMILARITY_FLOOR: f32 = 0.0;

/// Exhaustive scan over the snapshot.
#[derive(Clone, Copy, Debug, Default)]
pub struct LinearMatcher;

impl Matcher for LinearMatcher {
    fn best_match(
        &self,
        embedding: &FaceEmbedding,
        gallery: &GallerySnapshot,
    ) -> Result<MatchResult, MatchError> {
        if embedding.dimension() != gallery.dimension() {
            return Err(MatchError::DimensionMismatch {
                expected: gallery.dimension(),
                actual: embedding.dimension(),
            });
        }

        let mut best: Option<(f32, &crate::gallery::Identity)> = None;
        for identity in gallery.identities() {
            let score = cosine_similarity(&embedding.vector, &identity.embedding);
            if score < SIMILARITY_FLOOR {
                continue;
            }
            // strictly greater: earlier (lower) id wins ties
            if best.map_or(true, |(best_score, _)| score > best_score) {
                best = Some((score, identity));
            }
        }

        Ok(match best {
            Some((similarity, identity)) => MatchResult {
                embedding_id: embedding.detection_id,
                best_identity: Some(identity.summary()),
                similarity: similarity.min(1.0),
            },
            None => MatchResult::no_match(embedding.detection_id),
        })
    }
}

/// Cosine similarity in [-1, 1]. Zero-length vectors score 0.0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0f64;
    let mut norm_a = 0f64;
    let mut norm_b = 0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())) as f32
}

use thiserror::Error;

use crate::detect::result::{Detection, FaceEmbedding};
use crate::frame::{FaceCrop, Frame};

/// What a detector backend can report.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectionCapability {
    PersonDetection,
    ObjectDetection,
}

/// A model could not run: weights missing, device lost, inference error.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("model '{model}' unavailable: {reason}")]
pub struct ModelUnavailable {
    pub model: String,
    pub reason: String,
}

impl ModelUnavailable {
    pub fn new(model: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            reason: reason.into(),
        }
    }
}

/// Object detector.
///
/// Runs on the detect stage thread only, so it may keep state between frames.
/// Implementations must not retain the frame or its pixels past the call.
pub trait Detector: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Returns true when the backend supports a capability.
    fn supports(&self, capability: DetectionCapability) -> bool;

    /// Detections for one frame, in the detector's own order.
    ///
    /// The pipeline renumbers `frame_id`/`index` so detection ids stay unique.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, ModelUnavailable>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<(), ModelUnavailable> {
        Ok(())
    }
}

/// Face embedder.
///
/// Called concurrently for every person in a frame, hence `&self` and `Sync`.
pub trait Embedder: Send + Sync {
    fn name(&self) -> &'static str;

    /// Length of every vector this embedder produces.
    fn dimension(&self) -> usize;

    /// `Ok(None)` means no face was found in the crop.
    fn embed(&self, crop: &FaceCrop) -> Result<Option<FaceEmbedding>, ModelUnavailable>;
}

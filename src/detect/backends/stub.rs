use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::detect::backend::{DetectionCapability, Detector, Embedder, ModelUnavailable};
use crate::detect::result::{Detection, FaceEmbedding, ObjectClass};
use crate::frame::{BoundingBox, FaceCrop, Frame};

/// Scripted detector for tests and dry runs.
///
/// Returns the same person boxes for every frame unless a frame has its own script entry.
/// Every frame it sees is appended to a shared log.
#[derive(Default)]
pub struct StubDetector {
    every_frame: Vec<(BoundingBox, f32)>,
    per_frame: HashMap<u64, Vec<(BoundingBox, f32)>>,
    delay: Duration,
    failing: bool,
    seen: Arc<Mutex<Vec<u64>>>,
}

impl StubDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// One person box reported on every frame.
    pub fn always(bbox: BoundingBox, confidence: f32) -> Self {
        Self::new().with_person(bbox, confidence)
    }

    pub fn with_person(mut self, bbox: BoundingBox, confidence: f32) -> Self {
        self.every_frame.push((bbox, confidence));
        self
    }

    pub fn on_frame(mut self, frame_id: u64, persons: Vec<(BoundingBox, f32)>) -> Self {
        self.per_frame.insert(frame_id, persons);
        self
    }

    /// Sleep this long per frame, to simulate a slow model.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    /// Shared log of frame ids passed to `detect`, in call order.
    pub fn seen_frames(&self) -> Arc<Mutex<Vec<u64>>> {
        Arc::clone(&self.seen)
    }
}

impl Detector for StubDetector {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn supports(&self, capability: DetectionCapability) -> bool {
        matches!(capability, DetectionCapability::PersonDetection)
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, ModelUnavailable> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(frame.sequence_id);
        }
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if self.failing {
            return Err(ModelUnavailable::new("stub", "scripted failure"));
        }
        let persons = self
            .per_frame
            .get(&frame.sequence_id)
            .unwrap_or(&self.every_frame);
        Ok(persons
            .iter()
            .enumerate()
            .map(|(index, (bbox, confidence))| Detection {
                frame_id: frame.sequence_id,
                index: index as u32,
                bbox: *bbox,
                class: ObjectClass::Person,
                confidence: *confidence,
            })
            .collect())
    }
}

/// Scripted embedder: the vector is chosen by the detection's index within its frame.
///
/// Indexes without a vector report no face.
pub struct StubEmbedder {
    dimension: usize,
    by_index: HashMap<u32, Vec<f32>>,
    fallback: Option<Vec<f32>>,
    delay: Duration,
    failing: bool,
}

impl StubEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            by_index: HashMap::new(),
            fallback: None,
            delay: Duration::ZERO,
            failing: false,
        }
    }

    pub fn with_vector(mut self, index: u32, vector: Vec<f32>) -> Self {
        self.by_index.insert(index, vector);
        self
    }

    /// Vector for every index not scripted explicitly.
    pub fn with_fallback(mut self, vector: Vec<f32>) -> Self {
        self.fallback = Some(vector);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }
}

impl Embedder for StubEmbedder {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, crop: &FaceCrop) -> Result<Option<FaceEmbedding>, ModelUnavailable> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if self.failing {
            return Err(ModelUnavailable::new("stub", "scripted failure"));
        }
        let vector = self
            .by_index
            .get(&crop.detection_id.index)
            .or(self.fallback.as_ref());
        Ok(vector.map(|v| FaceEmbedding::new(crop.detection_id, v.clone())))
    }
}

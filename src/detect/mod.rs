mod backend;
mod backends;
mod registry;
mod result;

pub use backend::{DetectionCapability, Detector, Embedder, ModelUnavailable};
pub use backends::{BrightRegionDetector, HistogramEmbedder, StubDetector, StubEmbedder};
pub use registry::{detector_by_name, embedder_by_name, DETECTOR_NAMES, EMBEDDER_NAMES};
pub use result::{Detection, DetectionId, FaceEmbedding, ObjectClass};

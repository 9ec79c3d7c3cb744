pub mod cpu;
pub mod histogram;
pub mod stub;

pub use cpu::BrightRegionDetector;
pub use histogram::HistogramEmbedder;
pub use stub::{StubDetector, StubEmbedder};

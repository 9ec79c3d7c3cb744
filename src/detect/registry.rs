use anyhow::{anyhow, Result};

use super::backend::{Detector, Embedder};
use super::backends::{BrightRegionDetector, HistogramEmbedder, StubDetector, StubEmbedder};

/// Detector backends selectable by name in the config file.
pub const DETECTOR_NAMES: &[&str] = &["cpu", "stub"];
/// Embedder backends selectable by name in the config file.
pub const EMBEDDER_NAMES: &[&str] = &["histogram", "stub"];

/// Build a detector backend by name.
pub fn detector_by_name(name: &str) -> Result<Box<dyn Detector>> {
    match name {
        "cpu" => Ok(Box::new(BrightRegionDetector::new())),
        "stub" => Ok(Box::new(StubDetector::new())),
        other => Err(anyhow!(
            "detector backend '{}' not registered (available: {})",
            other,
            DETECTOR_NAMES.join(", ")
        )),
    }
}

/// Build an embedder backend by name, producing `dimension`-length vectors.
pub fn embedder_by_name(name: &str, dimension: usize) -> Result<Box<dyn Embedder>> {
    match name {
        "histogram" => Ok(Box::new(HistogramEmbedder::new(dimension)?)),
        "stub" => Ok(Box::new(StubEmbedder::new(dimension))),
        other => Err(anyhow!(
            "embedder backend '{}' not registered (available: {})",
            other,
            EMBEDDER_NAMES.join(", ")
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_names_resolve() -> Result<()> {
        assert_eq!(detector_by_name("cpu")?.name(), "cpu");
        assert_eq!(embedder_by_name("histogram", 512)?.dimension(), 512);
        Ok(())
    }

    #[test]
    fn unknown_name_lists_alternatives() {
        let err = detector_by_name("yolo").err().map(|e| e.to_string());
        assert!(err.unwrap_or_default().contains("cpu, stub"));
    }
}

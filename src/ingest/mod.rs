//! Frame ingestion sources.
//!
//! This module provides the sources that feed the capture stage:
//! - Synthetic scenes (`stub://` URLs) for dry runs and tests
//! - Raw RGB24 recordings on local disk (`file://` URLs or plain paths)
//!
//! Every source stamps frames with its own `FrameClock`, so sequence ids are monotonic
//! per source. A source reports `Ok(None)` once at end of stream and `Err(SourceFailure)`
//! when the device misbehaves; the capture loop owns the reconnect policy.
//!
//! The ingestion layer MUST NOT:
//! - Store decoded frames to disk
//! - Log raw frame content

use std::time::Duration;

use anyhow::{anyhow, Result};
use thiserror::Error;

use crate::frame::Frame;

pub mod file;
pub mod synthetic;

pub use file::FileSource;
pub use synthetic::SyntheticSource;

/// Capture device errors.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SourceFailure {
    #[error("capture device unreachable: {0}")]
    Unreachable(String),
    #[error("capture read failed: {0}")]
    Read(String),
}

/// Ordered stream of frames from one camera.
pub trait FrameSource: Send {
    /// Human-readable source name for logs.
    fn name(&self) -> &str;

    /// Next frame, `Ok(None)` at end of stream.
    fn next(&mut self) -> Result<Option<Frame>, SourceFailure>;

    /// Re-establish the device after a failure. Sources that cannot reconnect refuse.
    fn reconnect(&mut self) -> Result<(), SourceFailure> {
        Err(SourceFailure::Unreachable(format!(
            "{} does not support reconnect",
            self.name()
        )))
    }
}

/// Configuration for opening a source.
#[derive(Clone, Debug)]
pub struct SourceSettings {
    /// `stub://<name>[?frames=N&period=N&fail_after=N]`, `file:///path.rgb`, or a plain path.
    pub url: String,
    pub width: u32,
    pub height: u32,
    /// Target frame rate. 0 means as fast as the source can go.
    pub target_fps: u32,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            url: "stub://front_door".to_string(),
            width: 640,
            height: 480,
            target_fps: 10,
        }
    }
}

/// Open the source named by `settings.url`.
pub fn open_source(settings: &SourceSettings) -> Result<Box<dyn FrameSource>> {
    if settings.width == 0 || settings.height == 0 {
        return Err(anyhow!(
            "source dimensions must be non-zero (got {}x{})",
            settings.width,
            settings.height
        ));
    }
    if settings.url.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::from_settings(settings)?));
    }
    if let Some(path) = settings.url.strip_prefix("file://") {
        return Ok(Box::new(FileSource::open(path, settings.width, settings.height)?));
    }
    if settings.url.contains("://") {
        return Err(anyhow!(
            "unsupported source url '{}': expected stub:// or file://",
            settings.url
        ));
    }
    Ok(Box::new(FileSource::open(
        &settings.url,
        settings.width,
        settings.height,
    )?))
}

/// How the capture loop retries a failed source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl ReconnectPolicy {
    /// Wait before reconnect attempt `attempt` (0-based): doubles each time, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

//! Frame ownership.
//!
//! - `Frame`: one decoded RGB24 image. Pixels are private and zeroized on drop.
//! - `FrameClock`: the only way to mint frames. Sequence ids and capture times never go backwards.
//! - `FaceCrop`: the head region of one person box, handed to the embedder.
//! - `Snapshot`: an owned copy of the frame with the detection box outlined, for alerts.
//!
//! A frame moves through the pipeline by value. There is no `Clone`: a frame sits in exactly
//! one queue or stage at a time.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::detect::DetectionId;

pub const RGB_CHANNELS: usize = 3;

/// Outline colour drawn on alert snapshots.
const OUTLINE_RGB: [u8; 3] = [255, 0, 0];
const OUTLINE_THICKNESS: u32 = 2;

// ----------------------------------------------------------------------------
// BoundingBox
// ----------------------------------------------------------------------------

/// Share of a person box, from the top, taken as the head.
const HEAD_NUMERATOR: u32 = 2;
const HEAD_DENOMINATOR: u32 = 5;

/// Pixel-space box. `x`/`y` is the top-left corner.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl BoundingBox {
    pub fn new(x: u32, y: u32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }

    pub fn area(&self) -> u64 {
        u64::from(self.w) * u64::from(self.h)
    }

    /// Intersect with a `width` x `height` image. `None` when nothing is left.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<Self> {
        if self.x >= width || self.y >= height {
            return None;
        }
        let w = self.w.min(width - self.x);
        let h = self.h.min(height - self.y);
        if w == 0 || h == 0 {
            return None;
        }
        Some(Self::new(self.x, self.y, w, h))
    }

    /// Upper part of a standing-person box where the face is expected.
    pub fn head_region(&self) -> Self {
        let h = (self.h * HEAD_NUMERATOR / HEAD_DENOMINATOR).max(1).min(self.h);
        Self::new(self.x, self.y, self.w, h)
    }

    /// Intersection over union, 0.0 for disjoint or empty boxes.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x.saturating_add(self.w)).min(other.x.saturating_add(other.w));
        let y2 = (self.y.saturating_add(self.h)).min(other.y.saturating_add(other.h));
        if x2 <= x1 || y2 <= y1 {
            return 0.0;
        }
        let inter = u64::from(x2 - x1) * u64::from(y2 - y1);
        let union = self.area() + other.area() - inter;
        if union == 0 {
            return 0.0;
        }
        (inter as f64 / union as f64) as f32
    }
}

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One captured RGB24 frame.
pub struct Frame {
    /// Monotonic per source, assigned by `FrameClock`.
    pub sequence_id: u64,
    /// Capture time, epoch milliseconds.
    pub captured_at: u64,
    pub width: u32,
    pub height: u32,
    pixels: Vec<u8>,
}

// No Clone: frames are moved, never duplicated.

impl Frame {
    pub(crate) fn new(
        sequence_id: u64,
        captured_at: u64,
        width: u32,
        height: u32,
        pixels: Vec<u8>,
    ) -> Result<Self> {
        let expected = rgb_len(width, height);
        if pixels.len() != expected {
            return Err(anyhow!(
                "frame {} is {} bytes, expected {} for {}x{} RGB24",
                sequence_id,
                pixels.len(),
                expected,
                width,
                height
            ));
        }
        Ok(Self {
            sequence_id,
            captured_at,
            width,
            height,
            pixels,
        })
    }

    /// Read-only pixel access for detectors.
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// RGB triple at (x, y). Caller keeps coordinates in bounds.
    pub fn rgb_at(&self, x: u32, y: u32) -> [u8; 3] {
        let offset = (y as usize * self.width as usize + x as usize) * RGB_CHANNELS;
        [
            self.pixels[offset],
            self.pixels[offset + 1],
            self.pixels[offset + 2],
        ]
    }

    /// Copy out the head region of the person box `bbox`. `None` when it misses the frame.
    pub fn face_crop(&self, detection_id: DetectionId, bbox: &BoundingBox) -> Option<FaceCrop> {
        self.crop(detection_id, &bbox.head_region())
    }

    /// Copy out the pixels under `bbox`. `None` when the box misses the frame.
    pub fn crop(&self, detection_id: DetectionId, bbox: &BoundingBox) -> Option<FaceCrop> {
        let region = bbox.clamp_to(self.width, self.height)?;
        let row_len = region.w as usize * RGB_CHANNELS;
        let mut pixels = Vec::with_capacity(row_len * region.h as usize);
        for row in region.y..region.y + region.h {
            let start = (row as usize * self.width as usize + region.x as usize) * RGB_CHANNELS;
            pixels.extend_from_slice(&self.pixels[start..start + row_len]);
        }
        Some(FaceCrop {
            detection_id,
            width: region.w,
            height: region.h,
            pixels,
        })
    }

    /// Owned copy of the frame with `bbox` outlined.
    pub fn annotate(&self, bbox: &BoundingBox) -> Snapshot {
        let mut snapshot = Snapshot {
            frame_id: self.sequence_id,
            width: self.width,
            height: self.height,
            pixels: self.pixels.clone(),
        };
        if let Some(region) = bbox.clamp_to(self.width, self.height) {
            snapshot.outline(&region);
        }
        snapshot
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        self.pixels.zeroize();
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("sequence_id", &self.sequence_id)
            .field("captured_at", &self.captured_at)
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

fn rgb_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * RGB_CHANNELS
}

// ----------------------------------------------------------------------------
// FrameClock
// ----------------------------------------------------------------------------

/// Stamps frames for one source.
///
/// Sequence ids start at 1 and increase by one per frame. A capture time earlier than the
/// previous frame's (wall clock stepped back) is clamped to the previous value.
#[derive(Debug, Default)]
pub struct FrameClock {
    last_sequence: u64,
    last_captured_at: u64,
}

impl FrameClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frame(
        &mut self,
        captured_at: u64,
        width: u32,
        height: u32,
        pixels: Vec<u8>,
    ) -> Result<Frame> {
        let sequence_id = self.last_sequence + 1;
        let captured_at = captured_at.max(self.last_captured_at);
        let frame = Frame::new(sequence_id, captured_at, width, height, pixels)?;
        self.last_sequence = sequence_id;
        self.last_captured_at = captured_at;
        Ok(frame)
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }
}

// ----------------------------------------------------------------------------
// FaceCrop / Snapshot
// ----------------------------------------------------------------------------

/// Pixels of one head region. Lives only for the embed call.
pub struct FaceCrop {
    pub detection_id: DetectionId,
    pub width: u32,
    pub height: u32,
    pixels: Vec<u8>,
}

impl FaceCrop {
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Luma (0..=255) at (x, y) using BT.601 weights.
    pub fn luma_at(&self, x: u32, y: u32) -> u8 {
        let offset = (y as usize * self.width as usize + x as usize) * RGB_CHANNELS;
        let r = u32::from(self.pixels[offset]);
        let g = u32::from(self.pixels[offset + 1]);
        let b = u32::from(self.pixels[offset + 2]);
        ((r * 299 + g * 587 + b * 114) / 1000) as u8
    }
}

impl Drop for FaceCrop {
    fn drop(&mut self) {
        self.pixels.zeroize();
    }
}

/// Annotated copy of a frame attached to an alert.
#[derive(Clone)]
pub struct Snapshot {
    pub frame_id: u64,
    pub width: u32,
    pub height: u32,
    pixels: Vec<u8>,
}

impl Snapshot {
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }

    fn outline(&mut self, region: &BoundingBox) {
        let right = region.x + region.w;
        let bottom = region.y + region.h;
        for y in region.y..bottom {
            for x in region.x..right {
                let on_edge = x < region.x + OUTLINE_THICKNESS
                    || y < region.y + OUTLINE_THICKNESS
                    || x + OUTLINE_THICKNESS >= right
                    || y + OUTLINE_THICKNESS >= bottom;
                if on_edge {
                    let offset = (y as usize * self.width as usize + x as usize) * RGB_CHANNELS;
                    self.pixels[offset..offset + RGB_CHANNELS].copy_from_slice(&OUTLINE_RGB);
                }
            }
        }
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.pixels.zeroize();
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("frame_id", &self.frame_id)
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

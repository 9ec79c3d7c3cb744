use crate::detect::backend::{DetectionCapability, Detector, ModelUnavailable};
use crate::detect::result::{Detection, ObjectClass};
use crate::frame::{BoundingBox, Frame};

/// Channel value at or above which a pixel counts as foreground.
const DEFAULT_BRIGHTNESS: u8 = 200;
/// Fewer foreground pixels than this is noise.
const DEFAULT_MIN_PIXELS: usize = 16;

/// CPU person detector for lit doorways.
///
/// Treats the bounding box of all bright pixels as one person. Confidence grows with how
/// densely the box is filled. This is the detector the synthetic source is drawn for.
pub struct BrightRegionDetector {
    brightness: u8,
    min_pixels: usize,
}

impl BrightRegionDetector {
    pub fn new() -> Self {
        Self {
            brightness: DEFAULT_BRIGHTNESS,
            min_pixels: DEFAULT_MIN_PIXELS,
        }
    }

    pub fn with_brightness(mut self, brightness: u8) -> Self {
        self.brightness = brightness;
        self
    }
}

impl Default for BrightRegionDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector for BrightRegionDetector {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn supports(&self, capability: DetectionCapability) -> bool {
        matches!(capability, DetectionCapability::PersonDetection)
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, ModelUnavailable> {
        let mut count = 0usize;
        let (mut min_x, mut min_y) = (u32::MAX, u32::MAX);
        let (mut max_x, mut max_y) = (0u32, 0u32);
        for y in 0..frame.height {
            for x in 0..frame.width {
                let [r, g, b] = frame.rgb_at(x, y);
                if r >= self.brightness && g >= self.brightness && b >= self.brightness {
                    count += 1;
                    min_x = min_x.min(x);
                    min_y = min_y.min(y);
                    max_x = max_x.max(x);
                    max_y = max_y.max(y);
                }
            }
        }
        if count < self.min_pixels {
            return Ok(Vec::new());
        }

        let bbox = BoundingBox::new(min_x, min_y, max_x - min_x + 1, max_y - min_y + 1);
        let fill = count as f32 / bbox.area() as f32;
        Ok(vec![Detection {
            frame_id: frame.sequence_id,
            index: 0,
            bbox,
            class: ObjectClass::Person,
            confidence: (0.5 + 0.5 * fill).min(1.0),
        }])
    }
}

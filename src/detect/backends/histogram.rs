use crate::detect::backend::{Embedder, ModelUnavailable};
use crate::detect::result::FaceEmbedding;
use crate::frame::FaceCrop;

/// 4x4 grid, mean and deviation per cell.
const GRID: u32 = 4;
const TEXTURE_FEATURES: usize = (GRID * GRID * 2) as usize;
/// Crops smaller than this on either side carry no usable face.
pub const MIN_FACE_SIDE: u32 = 8;

/// Appearance embedder without a model file.
///
/// Luma histogram followed by coarse texture statistics, scaled to unit length. Good enough
/// to tell apart the synthetic visitors; a real deployment plugs in a face model here.
pub struct HistogramEmbedder {
    dimension: usize,
}

impl HistogramEmbedder {
    /// `dimension` must leave room for at least one histogram bin after the texture block.
    pub fn new(dimension: usize) -> Result<Self, ModelUnavailable> {
        if dimension <= TEXTURE_FEATURES {
            return Err(ModelUnavailable::new(
                "histogram",
                format!(
                    "dimension {} too small, need more than {}",
                    dimension, TEXTURE_FEATURES
                ),
            ));
        }
        Ok(Self { dimension })
    }
}

impl Embedder for HistogramEmbedder {
    fn name(&self) -> &'static str {
        "histogram"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, crop: &FaceCrop) -> Result<Option<FaceEmbedding>, ModelUnavailable> {
        if crop.width < MIN_FACE_SIDE || crop.height < MIN_FACE_SIDE {
            return Ok(None);
        }
        let bins = self.dimension - TEXTURE_FEATURES;
        let mut vector = vec![0f32; self.dimension];

        for y in 0..crop.height {
            for x in 0..crop.width {
                let luma = crop.luma_at(x, y) as usize;
                vector[luma * bins / 256] += 1.0;
            }
        }
        let total = (crop.width * crop.height) as f32;
        for bin in vector.iter_mut().take(bins) {
            *bin /= total;
        }

        let cell_w = crop.width / GRID;
        let cell_h = crop.height / GRID;
        let mut slot = bins;
        for gy in 0..GRID {
            for gx in 0..GRID {
                let (mean, deviation) = cell_stats(crop, gx * cell_w, gy * cell_h, cell_w, cell_h);
                vector[slot] = mean;
                vector[slot + 1] = deviation;
                slot += 2;
            }
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in vector.iter_mut() {
                *v /= norm;
            }
        }
        Ok(Some(FaceEmbedding::new(crop.detection_id, vector)))
    }
}

fn cell_stats(crop: &FaceCrop, x0: u32, y0: u32, w: u32, h: u32) -> (f32, f32) {
    let mut sum = 0f32;
    let mut sum_sq = 0f32;
    for y in y0..y0 + h {
        for x in x0..x0 + w {
            let v = f32::from(crop.luma_at(x, y)) / 255.0;
            sum += v;
            sum_sq += v * v;
        }
    }
    let n = (w * h) as f32;
    let mean = sum / n;
    let variance = (sum_sq / n - mean * mean).max(0.0);
    (mean, variance.sqrt())
}

use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::detector::{BubbleDetector, ClassifyError, Detection};

/// Model-free detector: a bubble is filled when enough of its interior is
/// dark.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DarknessDetector {
    pub input_size: u32,
    /// Luminance below which a pixel counts as ink.
    pub ink_level: u8,
    /// Fraction of inked interior pixels needed for "filled".
    pub min_fill: f32,
    /// Fraction of the crop, per side, ignored as the printed outline.
    pub border: f32,
}

impl Default for DarknessDetector {
    fn default() -> Self {
        Self {
            input_size: 32,
            ink_level: 110,
            min_fill: 0.4,
            border: 0.2,
        }
    }
}

pub const FILLED: usize = 0;
pub const EMPTY: usize = 1;

impl DarknessDetector {
    fn ink_fraction(&self, crop: &RgbImage) -> f32 {
        let (w, h) = crop.dimensions();
        let bx = (w as f32 * self.border) as u32;
        let by = (h as f32 * self.border) as u32;
        let (x0, x1) = (bx, w.saturating_sub(bx).max(bx + 1).min(w));
        let (y0, y1) = (by, h.saturating_sub(by).max(by + 1).min(h));

        let mut inked = 0usize;
        let mut total = 0usize;
        for y in y0..y1 {
            for x in x0..x1 {
                let [r, g, b] = crop.get_pixel(x, y).0;
                let luma = (299 * r as u32 + 587 * g as u32 + 114 * b as u32) / 1000;
                if luma < self.ink_level as u32 {
                    inked += 1;
                }
                total += 1;
            }
        }
        if total == 0 {
            0.0
        } else {
            inked as f32 / total as f32
        }
    }
}

impl BubbleDetector for DarknessDetector {
    fn input_size(&self) -> (u32, u32) {
        (self.input_size, self.input_size)
    }

    fn filled_class(&self) -> usize {
        FILLED
    }

    fn detect_batch(&self, crops: &[RgbImage]) -> Result<Vec<Option<Detection>>, ClassifyError> {
        Ok(crops
            .iter()
            .map(|crop| {
                let fill = self.ink_fraction(crop);
                let detection = if fill >= self.min_fill {
                    Detection {
                        class_id: FILLED,
                        confidence: fill,
                    }
                } else {
                    Detection {
                        class_id: EMPTY,
                        confidence: 1.0 - fill,
                    }
                };
                Some(detection)
            })
            .collect())
    }
}

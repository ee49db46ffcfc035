use std::path::Path;

use image::RgbImage;
use log::info;
use serde::{Deserialize, Serialize};
use tract_onnx::prelude::*;

use crate::detector::{BubbleDetector, ClassifyError, Detection};

type Plan = TypedRunnableModel<TypedModel>;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OnnxConfig {
    pub input_width: u32,
    pub input_height: u32,
    /// The model is compiled for this fixed batch size; short batches are
    /// zero-padded.
    pub batch_size: usize,
    pub filled_class: usize,
}

impl Default for OnnxConfig {
    fn default() -> Self {
        Self {
            input_width: 64,
            input_height: 64,
            batch_size: 16,
            filled_class: 0,
        }
    }
}

/// ONNX bubble model run through tract.
///
/// Accepts classification heads (`[N, classes]`) and YOLO-style detection
/// heads (`[N, 4 + classes, anchors]`, or the transposed layout).
pub struct OnnxDetector {
    plan: Plan,
    config: OnnxConfig,
}

impl std::fmt::Debug for OnnxDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxDetector")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl OnnxDetector {
    pub fn load(path: &Path, config: OnnxConfig) -> Result<Self, ClassifyError> {
        let load_err = |e: TractError| ClassifyError::ModelLoad {
            path: path.to_path_buf(),
            message: e.to_string(),
        };
        let batch = config.batch_size.max(1);
        let shape = [
            batch,
            3,
            config.input_height as usize,
            config.input_width as usize,
        ];
        let plan = tract_onnx::onnx()
            .model_for_path(path)
            .map_err(load_err)?
            .with_input_fact(0, f32::fact(shape).into())
            .map_err(load_err)?
            .into_optimized()
            .map_err(load_err)?
            .into_runnable()
            .map_err(load_err)?;
        info!(
            "loaded bubble model {} (batch {}, input {}x{})",
            path.display(),
            batch,
            config.input_width,
            config.input_height
        );
        Ok(Self {
            plan,
            config: OnnxConfig {
                batch_size: batch,
                ..config
            },
        })
    }

    /// NCHW, scaled to `[0, 1]`, zero-padded up to the compiled batch size.
    fn tensor(&self, crops: &[RgbImage]) -> Result<Tensor, ClassifyError> {
        let (w, h) = (
            self.config.input_width as usize,
            self.config.input_height as usize,
        );
        let plane = w * h;
        let mut data = vec![0.0f32; self.config.batch_size * 3 * plane];
        for (n, crop) in crops.iter().enumerate() {
            for (x, y, px) in crop.enumerate_pixels() {
                let (x, y) = (x as usize, y as usize);
                if x < w && y < h {
                    for c in 0..3 {
                        data[(n * 3 + c) * plane + y * w + x] = px.0[c] as f32 / 255.0;
                    }
                }
            }
        }
        Tensor::from_shape(&[self.config.batch_size, 3, h, w], &data)
            .map_err(|e| ClassifyError::Inference(e.to_string()))
    }
}

impl BubbleDetector for OnnxDetector {
    fn input_size(&self) -> (u32, u32) {
        (self.config.input_width, self.config.input_height)
    }

    fn filled_class(&self) -> usize {
        self.config.filled_class
    }

    fn batch_size(&self) -> usize {
        self.config.batch_size
    }

    fn detect_batch(&self, crops: &[RgbImage]) -> Result<Vec<Option<Detection>>, ClassifyError> {
        let mut out = Vec::with_capacity(crops.len());
        for chunk in crops.chunks(self.config.batch_size) {
            let outputs = self
                .plan
                .run(tvec!(self.tensor(chunk)?.into()))
                .map_err(|e| ClassifyError::Inference(e.to_string()))?;
            let first = outputs
                .first()
                .ok_or_else(|| ClassifyError::Inference("model produced no outputs".into()))?;
            let view = first
                .to_array_view::<f32>()
                .map_err(|e| ClassifyError::Inference(e.to_string()))?;
            let shape = view.shape().to_vec();
            let flat: Vec<f32> = view.iter().copied().collect();
            let mut decoded = decode_output(&flat, &shape)?;
            decoded.truncate(chunk.len());
            out.extend(decoded);
        }
        Ok(out)
    }
}

fn argmax(values: impl Iterator<Item = f32>) -> Option<(usize, f32)> {
    values
        .enumerate()
        .fold(None, |best: Option<(usize, f32)>, (i, v)| match best {
            Some((_, b)) if b >= v => best,
            _ => Some((i, v)),
        })
}

fn softmax(row: &[f32]) -> Vec<f32> {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp: Vec<f32> = row.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exp.iter().sum();
    exp.into_iter().map(|v| v / sum).collect()
}

fn looks_like_probabilities(row: &[f32]) -> bool {
    let sum: f32 = row.iter().sum();
    row.iter().all(|v| (0.0..=1.0).contains(v)) && (sum - 1.0).abs() < 1e-2
}

/// Decode a row-major output tensor into one top detection per batch item.
pub(crate) fn decode_output(flat: &[f32], shape: &[usize]) -> Result<Vec<Option<Detection>>, ClassifyError> {
    match *shape {
        [n, classes] if classes > 0 => Ok((0..n)
            .map(|i| {
                let row = &flat[i * classes..(i + 1) * classes];
                let probs = if looks_like_probabilities(row) {
                    row.to_vec()
                } else {
                    softmax(row)
                };
                argmax(probs.into_iter()).map(|(class_id, confidence)| Detection {
                    class_id,
                    confidence,
                })
            })
            .collect()),
        [n, a, b] if a.min(b) > 4 => {
            // attributes along the shorter axis: 4 box values then class scores
            let (attrs, anchors, attrs_major) = if a <= b { (a, b, true) } else { (b, a, false) };
            let stride = a * b;
            Ok((0..n)
                .map(|i| {
                    let item = &flat[i * stride..(i + 1) * stride];
                    let at = |attr: usize, anchor: usize| {
                        if attrs_major {
                            item[attr * anchors + anchor]
                        } else {
                            item[anchor * attrs + attr]
                        }
                    };
                    (0..anchors)
                        .filter_map(|anchor| argmax((4..attrs).map(|c| at(c, anchor))))
                        .fold(None, |best: Option<(usize, f32)>, cand| match best {
                            Some((_, b)) if b >= cand.1 => best,
                            _ => Some(cand),
                        })
                        .filter(|&(_, confidence)| confidence > 0.0)
                        .map(|(class_id, confidence)| Detection {
                            class_id,
                            confidence,
                        })
                })
                .collect())
        }
        _ => Err(ClassifyError::OutputShape(shape.to_vec())),
    }
}

use std::collections::BTreeMap;
use std::sync::Arc;

use image::RgbImage;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use sheetgrade_core::{crop_rgb, resize_rgb, BubblePoint, PixelRect};

#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::detector::{BubbleDetector, ClassifyError};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Minimum confidence of a "filled" detection.
    pub confidence: f32,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self { confidence: 0.25 }
    }
}

/// A bubble judged filled.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilledBubble {
    pub qid: String,
    pub choice: String,
    pub rect: PixelRect,
    pub confidence: f32,
}

/// Recognized answers for one aligned image.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    /// qid to concatenated choices; blank questions are absent.
    pub answers: BTreeMap<String, String>,
    /// qids with more than one filled choice.
    pub multi_marked: Vec<String>,
    pub filled: Vec<FilledBubble>,
    /// Bubbles whose crop fell entirely outside the image.
    pub skipped: usize,
}

/// Crops every bubble, batches the crops through a shared detector and turns
/// the detections into per-question answers.
#[derive(Clone)]
pub struct BubbleClassifier {
    detector: Arc<dyn BubbleDetector>,
    config: ClassifierConfig,
}

impl std::fmt::Debug for BubbleClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BubbleClassifier")
            .field("config", &self.config)
            .field("input_size", &self.detector.input_size())
            .finish()
    }
}

impl BubbleClassifier {
    pub fn new(detector: Arc<dyn BubbleDetector>, config: ClassifierConfig) -> Self {
        Self { detector, config }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    pub fn detector(&self) -> &Arc<dyn BubbleDetector> {
        &self.detector
    }

    /// Classify all `bubbles` on an RGB image already in the template frame.
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "debug", skip_all, fields(bubbles = bubbles.len()))
    )]
    pub fn classify(&self, image: &RgbImage, bubbles: &[BubblePoint]) -> Result<Classification, ClassifyError> {
        let mut result = Classification::default();
        if bubbles.is_empty() {
            return Ok(result);
        }

        let (img_w, img_h) = image.dimensions();
        let (in_w, in_h) = self.detector.input_size();

        let mut kept: Vec<(&BubblePoint, PixelRect)> = Vec::with_capacity(bubbles.len());
        let mut crops = Vec::with_capacity(bubbles.len());
        for bubble in bubbles {
            let Some(rect) = bubble.clipped_rect(img_w, img_h) else {
                result.skipped += 1;
                continue;
            };
            crops.push(resize_rgb(&crop_rgb(image, rect), in_w, in_h));
            kept.push((bubble, rect));
        }
        if result.skipped > 0 {
            debug!("{} bubbles outside the image were skipped", result.skipped);
        }

        let mut detections = Vec::with_capacity(crops.len());
        for chunk in crops.chunks(self.detector.batch_size().max(1)) {
            let batch = self.detector.detect_batch(chunk)?;
            if batch.len() != chunk.len() {
                return Err(ClassifyError::BatchLength {
                    expected: chunk.len(),
                    got: batch.len(),
                });
            }
            detections.extend(batch);
        }

        let filled_class = self.detector.filled_class();
        let mut choices: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for ((bubble, rect), detection) in kept.into_iter().zip(detections) {
            let Some(det) = detection else { continue };
            if det.class_id != filled_class || det.confidence < self.config.confidence {
                continue;
            }
            choices.entry(&bubble.qid).or_default().push(&bubble.choice);
            result.filled.push(FilledBubble {
                qid: bubble.qid.clone(),
                choice: bubble.choice.clone(),
                rect,
                confidence: det.confidence,
            });
        }

        for (qid, mut marked) in choices {
            marked.sort_unstable();
            if marked.len() > 1 {
                warn!("question {qid} has multiple marks: {}", marked.join(","));
                result.multi_marked.push(qid.to_string());
            }
            result.answers.insert(qid.to_string(), marked.concat());
        }
        Ok(result)
    }
}

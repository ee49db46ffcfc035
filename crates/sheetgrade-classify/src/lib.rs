//! Bubble classification.
//!
//! [`BubbleClassifier`] crops every template bubble out of an aligned image,
//! runs the crops through a [`BubbleDetector`] in batches and reports, per
//! question, the filled choices.
//!
//! Two detectors ship with the crate: [`OnnxDetector`] runs a trained model
//! through tract, [`DarknessDetector`] thresholds ink coverage and needs no
//! model at all.

mod classifier;
mod darkness;
mod detector;
mod onnx;

pub use classifier::{BubbleClassifier, Classification, ClassifierConfig, FilledBubble};
pub use darkness::{DarknessDetector, EMPTY, FILLED};
pub use detector::{BubbleDetector, ClassifyError, Detection};
pub use onnx::{OnnxConfig, OnnxDetector};

use std::path::PathBuf;

use image::RgbImage;

/// Top detection for one crop.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Detection {
    pub class_id: usize,
    pub confidence: f32,
}

#[derive(thiserror::Error, Debug)]
pub enum ClassifyError {
    #[error("failed to load model {path}: {message}")]
    ModelLoad { path: PathBuf, message: String },
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("unsupported model output shape {0:?}")]
    OutputShape(Vec<usize>),
    #[error("detector returned {got} results for {expected} crops")]
    BatchLength { expected: usize, got: usize },
}

/// Filled/empty detector for bubble crops.
///
/// One instance serves every worker thread of a batch, so `detect_batch` is
/// called concurrently through a shared reference and must keep all per-call
/// state local.
pub trait BubbleDetector: Send + Sync {
    /// Size every crop is resized to before `detect_batch`.
    fn input_size(&self) -> (u32, u32);

    /// Class id that means "filled".
    fn filled_class(&self) -> usize {
        0
    }

    /// Largest slice `detect_batch` accepts in one call.
    fn batch_size(&self) -> usize {
        32
    }

    /// Top detection for each crop, in input order. `None` when the model
    /// reports nothing for that crop.
    fn detect_batch(&self, crops: &[RgbImage]) -> Result<Vec<Option<Detection>>, ClassifyError>;
}

impl<T: BubbleDetector + ?Sized> BubbleDetector for Box<T> {
    fn input_size(&self) -> (u32, u32) {
        (**self).input_size()
    }

    fn filled_class(&self) -> usize {
        (**self).filled_class()
    }

    fn batch_size(&self) -> usize {
        (**self).batch_size()
    }

    fn detect_batch(&self, crops: &[RgbImage]) -> Result<Vec<Option<Detection>>, ClassifyError> {
        (**self).detect_batch(crops)
    }
}

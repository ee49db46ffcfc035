use std::path::PathBuf;

use sheetgrade_align::AlignmentError;
use sheetgrade_classify::ClassifyError;
use sheetgrade_core::TemplateLoadError;
use sheetgrade_scoring::{RecognitionFailure, ScoringError};

/// Failure to set up a grading job. Nothing is graded when this happens.
#[derive(thiserror::Error, Debug)]
pub enum GradeError {
    #[error("template: {0}")]
    Template(#[from] TemplateLoadError),
    #[error("model: {0}")]
    Model(#[from] ClassifyError),
    #[error("alignment reference: {0}")]
    Alignment(#[from] AlignmentError),
    #[error(transparent)]
    Scoring(#[from] ScoringError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to start worker pool: {0}")]
    ThreadPool(String),
}

/// Failure of a single image or frame. A batch records it and moves on.
#[derive(thiserror::Error, Debug)]
pub enum SheetError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("classification failed: {0}")]
    Classify(#[from] ClassifyError),
    #[error("recognition failed: {0}")]
    Recognition(#[from] RecognitionFailure),
    #[error(transparent)]
    Scoring(#[from] ScoringError),
    #[error("deadline of {limit_ms} ms exceeded before {stage}")]
    DeadlineExceeded { stage: &'static str, limit_ms: u64 },
    #[error("failed to write output {}: {message}", path.display())]
    Output { path: PathBuf, message: String },
    #[error("invalid frame: {0}")]
    Frame(String),
}

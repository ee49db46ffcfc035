use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum ScoringError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid answer key: {0}")]
    InvalidKey(String),
    #[error("invalid student list: {0}")]
    InvalidStudents(String),
    #[error("unsupported file type: {}", .0.display())]
    UnsupportedFormat(PathBuf),
    #[error("answer key has no entry for exam code `{0}`")]
    NoKeyForForm(String),
}

pub type ScoringResult<T> = Result<T, ScoringError>;

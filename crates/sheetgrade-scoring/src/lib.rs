//! Everything after bubble recognition: joining code columns and composite
//! answers, grading against an answer key, exporting the breakdown and
//! finding the student behind a recognized student number.
//!
//! All functions here are pure or do plain file I/O; none of them touch
//! images.

mod answer_key;
mod codes;
mod error;
mod report;
mod scoring;
mod students;

pub use answer_key::{AnswerKey, FormKey};
pub use codes::{
    extract_code, group_answers, validate_code, AnswerGrouper, CodeField, RecognitionFailure,
    UNKNOWN_CODE,
};
pub use error::{ScoringError, ScoringResult};
pub use report::{write_csv, write_csv_path, CSV_HEADER};
pub use scoring::{
    natural_cmp, round_to, score_answers, Outcome, QuestionScore, ScoreBreakdown, ScoringRules,
};
pub use students::{match_student, Student, StudentDirectory, StudentMatch};

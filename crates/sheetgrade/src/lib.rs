//! High-level facade crate for the `sheetgrade-*` workspace.
//!
//! This crate provides:
//! - re-exports of the component crates (template, alignment, bubble
//!   classification, scoring)
//! - a [`GradingPipeline`] that grades one photographed answer sheet
//! - a [`BatchOrchestrator`] that grades a folder on a worker pool
//! - [`live`] sessions that grade streamed camera frames
//!
//! ## Quickstart
//!
//! ```no_run
//! use sheetgrade::{BatchOrchestrator, GradingConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = GradingConfig {
//!     template: "template.json".into(),
//!     answer_key: Some("key.csv".into()),
//!     output_dir: Some("out".into()),
//!     ..GradingConfig::default()
//! };
//! let batch = BatchOrchestrator::from_config(&config)?;
//! let report = batch.run_dir("scans".as_ref())?;
//! println!("{}/{} graded", report.summary.successful, report.summary.total);
//! # Ok(())
//! # }
//! ```
//!
//! ## API map
//! - `sheetgrade::core`: template model, image helpers, homographies.
//! - `sheetgrade::align`: feature-based alignment to a reference scan.
//! - `sheetgrade::classify`: bubble detectors (ONNX model or ink darkness).
//! - `sheetgrade::scoring`: codes, answer keys, scores, student matching.

pub use sheetgrade_align as align;
pub use sheetgrade_classify as classify;
pub use sheetgrade_core as core;
pub use sheetgrade_scoring as scoring;

mod annotate;
mod batch;
mod config;
mod error;
mod events;
pub mod live;
mod pipeline;

pub use annotate::{annotate, CORRECT_COLOR, WRONG_COLOR};
pub use batch::{
    list_images, write_sheet_outputs, BatchOptions, BatchOrchestrator, BatchReport, BatchSummary,
    FileFailure, IMAGE_EXTENSIONS, MAX_REPORTED_ERRORS, SUMMARY_FILE,
};
pub use config::{CodeSettings, GradingConfig, ALIGNMENT_STEP};
pub use error::{GradeError, SheetError};
pub use events::{EventSink, LogSink, Status, StatusEvent};
pub use pipeline::{
    complete_event, AlignmentOutcome, Deadline, ExamContext, GradedSheet, GradingPipeline,
    SheetResult,
};

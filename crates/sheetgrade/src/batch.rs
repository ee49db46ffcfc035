//! Folder grading on a bounded worker pool.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use log::{error, info};
use rayon::prelude::*;
use serde::Serialize;
use sheetgrade_scoring::write_csv_path;

#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::config::GradingConfig;
use crate::error::{GradeError, SheetError};
use crate::events::LogSink;
use crate::pipeline::{GradedSheet, GradingPipeline, SheetResult};

/// File extensions picked up by [`list_images`], lowercase.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "tif", "tiff", "webp"];

/// Error entries kept in the summary; the rest only reach the log.
pub const MAX_REPORTED_ERRORS: usize = 20;

pub const SUMMARY_FILE: &str = "batch_summary.json";

/// Image files directly inside `dir`, sorted by path.
pub fn list_images(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
        if is_image && path.is_file() {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

#[derive(Clone, Debug, Serialize)]
pub struct FileFailure {
    pub file: String,
    pub error: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct BatchSummary {
    pub batch_id: String,
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub failed_files: Vec<String>,
    pub errors: Vec<FileFailure>,
    pub elapsed_ms: f64,
    pub avg_ms_per_image: f64,
    pub workers: usize,
}

#[derive(Clone, Debug)]
pub struct BatchReport {
    pub summary: BatchSummary,
    /// Successful sheets in file name order.
    pub sheets: Vec<SheetResult>,
}

#[derive(Clone, Debug)]
pub struct BatchOptions {
    /// Fixed pool size; derived from the CPU count when `None`.
    pub workers: Option<usize>,
    pub max_workers: usize,
    pub output_dir: Option<PathBuf>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            workers: None,
            max_workers: 8,
            output_dir: None,
        }
    }
}

fn new_batch_id() -> String {
    format!("{:016x}", fastrand::u64(..))
}

fn output_error(path: &Path, err: impl ToString) -> SheetError {
    SheetError::Output {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

/// Write `<stem>.json`, `<stem>_annotated.png` and, when present,
/// `<stem>.csv` and `<stem>_align_debug.png` into `dir`.
pub fn write_sheet_outputs(dir: &Path, stem: &str, sheet: &GradedSheet) -> Result<(), SheetError> {
    let json_path = dir.join(format!("{stem}.json"));
    let json = serde_json::to_string_pretty(&sheet.result).map_err(|e| output_error(&json_path, e))?;
    fs::write(&json_path, json).map_err(|e| output_error(&json_path, e))?;

    let png_path = dir.join(format!("{stem}_annotated.png"));
    sheet
        .annotated
        .save(&png_path)
        .map_err(|e| output_error(&png_path, e))?;

    if let Some(score) = &sheet.result.score {
        let csv_path = dir.join(format!("{stem}.csv"));
        write_csv_path(score, &csv_path).map_err(|e| output_error(&csv_path, e))?;
    }
    if let Some(debug) = &sheet.alignment_debug {
        let debug_path = dir.join(format!("{stem}_align_debug.png"));
        debug.save(&debug_path).map_err(|e| output_error(&debug_path, e))?;
    }
    Ok(())
}

/// Grades many files in parallel with one shared pipeline.
pub struct BatchOrchestrator {
    pipeline: Arc<GradingPipeline>,
    options: BatchOptions,
}

impl BatchOrchestrator {
    pub fn new(pipeline: Arc<GradingPipeline>, options: BatchOptions) -> Self {
        Self { pipeline, options }
    }

    pub fn from_config(config: &GradingConfig) -> Result<Self, GradeError> {
        let pipeline = Arc::new(config.build_pipeline()?);
        Ok(Self::new(
            pipeline,
            BatchOptions {
                workers: config.workers,
                max_workers: config.max_workers,
                output_dir: config.output_dir.clone(),
            },
        ))
    }

    pub fn pipeline(&self) -> &Arc<GradingPipeline> {
        &self.pipeline
    }

    /// Pool size for `jobs` inputs: the explicit setting, else
    /// `min(cpus, jobs, max_workers)`, never below one.
    pub fn worker_count(&self, jobs: usize) -> usize {
        self.options
            .workers
            .unwrap_or_else(|| num_cpus::get().min(jobs).min(self.options.max_workers))
            .max(1)
    }

    fn process(&self, path: &Path) -> Result<SheetResult, SheetError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut sink = LogSink { source: name };
        let sheet = self.pipeline.grade_path(path, &mut sink)?;
        if let Some(dir) = &self.options.output_dir {
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| sheet.result.filename.clone());
            write_sheet_outputs(dir, &stem, &sheet)?;
        }
        Ok(sheet.result)
    }

    /// Grade every image in `dir`.
    pub fn run_dir(&self, dir: &Path) -> Result<BatchReport, GradeError> {
        let inputs = list_images(dir)?;
        if inputs.is_empty() {
            return Err(GradeError::Config(format!("no images found in {}", dir.display())));
        }
        self.run(&inputs)
    }

    /// Grade `inputs`. A failing image is recorded in the summary and does
    /// not stop the others.
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "info", skip_all, fields(images = inputs.len()))
    )]
    pub fn run(&self, inputs: &[PathBuf]) -> Result<BatchReport, GradeError> {
        let started = Instant::now();
        let workers = self.worker_count(inputs.len());
        if let Some(dir) = &self.options.output_dir {
            fs::create_dir_all(dir)?;
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("sheetgrade-{i}"))
            .build()
            .map_err(|e| GradeError::ThreadPool(e.to_string()))?;
        info!("grading {} images on {} workers", inputs.len(), workers);

        let outcomes: BTreeMap<String, Result<SheetResult, SheetError>> = pool.install(|| {
            inputs
                .par_iter()
                .map(|path| (path.display().to_string(), self.process(path)))
                .collect()
        });

        let mut sheets = Vec::new();
        let mut failed_files = Vec::new();
        let mut errors = Vec::new();
        for (file, outcome) in outcomes {
            match outcome {
                Ok(result) => sheets.push(result),
                Err(e) => {
                    error!("{file}: {e}");
                    if errors.len() < MAX_REPORTED_ERRORS {
                        errors.push(FileFailure {
                            file: file.clone(),
                            error: e.to_string(),
                        });
                    }
                    failed_files.push(file);
                }
            }
        }

        let elapsed_ms = started.elapsed().as_secs_f64() * 1e3;
        let total = inputs.len();
        let summary = BatchSummary {
            batch_id: new_batch_id(),
            total,
            successful: sheets.len(),
            failed: failed_files.len(),
            failed_files,
            errors,
            elapsed_ms,
            avg_ms_per_image: if total == 0 { 0.0 } else { elapsed_ms / total as f64 },
            workers,
        };
        info!(
            "batch {}: {}/{} graded in {:.0} ms",
            summary.batch_id, summary.successful, summary.total, summary.elapsed_ms
        );

        if let Some(dir) = &self.options.output_dir {
            let json = serde_json::to_string_pretty(&summary)?;
            fs::write(dir.join(SUMMARY_FILE), json)?;
        }
        Ok(BatchReport { summary, sheets })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_image_files_are_listed_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        for name in ["b.PNG", "a.jpg", "notes.txt", "c.tiff", "key.json"] {
            fs::write(dir.path().join(name), b"x").expect("write");
        }
        fs::create_dir(dir.path().join("d.png")).expect("mkdir");
        let names: Vec<String> = list_images(dir.path())
            .expect("list")
            .iter()
            .map(|p| p.file_name().expect("name").to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.jpg", "b.PNG", "c.tiff"]);
    }

    #[test]
    fn batch_ids_are_hex() {
        let id = new_batch_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}

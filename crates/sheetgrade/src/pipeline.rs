//! One sheet, start to finish.
//!
//! [`GradingPipeline`] owns everything that is loaded once per job (template,
//! classifier, optional aligner) and grades a single decoded image:
//! align, classify, read the identifying codes, group answers, score and
//! match the student. Progress is reported through an [`EventSink`].

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::{DynamicImage, RgbImage};
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::json;
use sheetgrade_align::AlignmentPreprocessor;
use sheetgrade_classify::BubbleClassifier;
use sheetgrade_core::{normalize_channels, resize_rgb, Template};
use sheetgrade_scoring::{
    match_student, score_answers, validate_code, AnswerGrouper, AnswerKey, CodeField,
    RecognitionFailure, ScoreBreakdown, ScoringRules, StudentDirectory, StudentMatch,
    UNKNOWN_CODE,
};

#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::annotate::annotate;
use crate::config::CodeSettings;
use crate::error::SheetError;
use crate::events::{EventSink, Status, StatusEvent};

/// Exam-specific data: which key to score against and whom to match.
#[derive(Clone, Debug, Default)]
pub struct ExamContext {
    pub answer_key: Option<Arc<AnswerKey>>,
    pub students: Option<Arc<StudentDirectory>>,
    /// Class filter for student matching; empty means every student.
    pub classes: Vec<String>,
}

/// Wall-clock budget for one sheet, checked between stages.
#[derive(Clone, Copy, Debug)]
pub struct Deadline {
    started: Instant,
    limit: Duration,
}

impl Deadline {
    pub fn start(limit: Duration) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn check(&self, stage: &'static str) -> Result<(), SheetError> {
        if self.started.elapsed() >= self.limit {
            return Err(SheetError::DeadlineExceeded {
                stage,
                limit_ms: self.limit.as_millis() as u64,
            });
        }
        Ok(())
    }
}

/// How the page was brought into template coordinates.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct AlignmentOutcome {
    pub aligned: bool,
    pub inlier_ratio: Option<f32>,
    /// Set when alignment was attempted and failed.
    pub error: Option<String>,
}

/// Machine-readable result of one graded sheet.
#[derive(Clone, Debug, Serialize)]
pub struct SheetResult {
    pub filename: String,
    pub sbd: String,
    pub ma_de: String,
    /// Grouped answers keyed by question id.
    pub answers: BTreeMap<String, String>,
    pub multi_marked: Vec<String>,
    pub alignment: AlignmentOutcome,
    pub score: Option<ScoreBreakdown>,
    pub student: Option<StudentMatch>,
    pub warnings: Vec<String>,
    pub elapsed_ms: f64,
}

/// Result plus the images produced along the way.
#[derive(Clone, Debug)]
pub struct GradedSheet {
    pub result: SheetResult,
    pub annotated: RgbImage,
    pub alignment_debug: Option<RgbImage>,
}

/// `complete` event carrying the result summary.
pub fn complete_event(sheet: &GradedSheet) -> StatusEvent {
    let r = &sheet.result;
    let message = match &r.score {
        Some(s) => format!("{} graded: {}/{}", r.filename, s.score, s.max_score),
        None => format!("{} recognized", r.filename),
    };
    StatusEvent::new(Status::Complete, message)
        .with_details(serde_json::to_value(r).unwrap_or_default())
}

fn failure_event(err: &SheetError) -> StatusEvent {
    match err {
        SheetError::Recognition(failure) => {
            StatusEvent::new(Status::RecognitionFailed, failure.to_string())
                .with_details(serde_json::to_value(failure).unwrap_or_default())
        }
        other => StatusEvent::new(Status::Error, other.to_string()),
    }
}

/// Grades decoded sheet images against one template.
///
/// Cheap to share across threads: everything heavy sits behind `Arc`.
pub struct GradingPipeline {
    template: Arc<Template>,
    classifier: BubbleClassifier,
    aligner: Option<Arc<AlignmentPreprocessor>>,
    grouper: AnswerGrouper,
    codes: CodeSettings,
    scoring: ScoringRules,
    deadline: Duration,
    exam: ExamContext,
    /// Bubbled columns per code; zero when the template has no such code.
    student_columns: usize,
    exam_columns: usize,
}

impl GradingPipeline {
    pub fn new(template: Arc<Template>, classifier: BubbleClassifier) -> Self {
        let grouper = AnswerGrouper::new(template.custom_labels.clone());
        let mut pipeline = Self {
            template,
            classifier,
            aligner: None,
            grouper,
            codes: CodeSettings::default(),
            scoring: ScoringRules::default(),
            deadline: Duration::from_secs(60),
            exam: ExamContext::default(),
            student_columns: 0,
            exam_columns: 0,
        };
        pipeline.refresh_code_fields();
        pipeline
    }

    fn code_columns(&self, prefix: &str) -> usize {
        if let Some(parts) = self.grouper.declared().get(prefix) {
            return parts.len();
        }
        let columns: BTreeSet<&str> = self
            .template
            .bubbles()
            .iter()
            .map(|b| b.qid.as_str())
            .filter(|q| {
                q.strip_prefix(prefix)
                    .and_then(|rest| rest.strip_prefix('_'))
                    .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
            })
            .collect();
        columns.len()
    }

    fn refresh_code_fields(&mut self) {
        self.student_columns = self.code_columns(&self.codes.student_prefix);
        self.exam_columns = self.code_columns(&self.codes.exam_code_prefix);
    }

    pub fn with_aligner(mut self, aligner: Arc<AlignmentPreprocessor>) -> Self {
        self.aligner = Some(aligner);
        self
    }

    pub fn with_codes(mut self, codes: CodeSettings) -> Self {
        self.codes = codes;
        self.refresh_code_fields();
        self
    }

    pub fn with_scoring(mut self, scoring: ScoringRules) -> Self {
        self.scoring = scoring;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_exam(mut self, exam: ExamContext) -> Self {
        self.exam = exam;
        self
    }

    pub fn template(&self) -> &Template {
        &self.template
    }

    pub fn exam(&self) -> &ExamContext {
        &self.exam
    }

    pub fn is_aligning(&self) -> bool {
        self.aligner.is_some()
    }

    /// Read, decode and grade one file with the pipeline's own exam data.
    pub fn grade_path(&self, path: &Path, sink: &mut dyn EventSink) -> Result<GradedSheet, SheetError> {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let decoded = fs::read(path)
            .map_err(|source| SheetError::Read {
                path: path.to_path_buf(),
                source,
            })
            .and_then(|bytes| image::load_from_memory(&bytes).map_err(SheetError::from));
        match decoded {
            Ok(img) => self.grade(&img, &filename, &self.exam, sink),
            Err(e) => {
                sink.emit(failure_event(&e));
                Err(e)
            }
        }
    }

    /// Grade one decoded image. Failures are also emitted as
    /// `recognition_failed` or `error` events before being returned.
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "info", skip_all, fields(file = filename))
    )]
    pub fn grade(
        &self,
        image: &DynamicImage,
        filename: &str,
        exam: &ExamContext,
        sink: &mut dyn EventSink,
    ) -> Result<GradedSheet, SheetError> {
        let res = self.grade_inner(image, filename, exam, sink);
        if let Err(e) = &res {
            sink.emit(failure_event(e));
        }
        res
    }

    fn bring_to_page(
        &self,
        rgb: &RgbImage,
        sink: &mut dyn EventSink,
        warnings: &mut Vec<String>,
    ) -> (RgbImage, AlignmentOutcome, Option<RgbImage>) {
        let (w, h) = self.template.page_size();
        let Some(aligner) = &self.aligner else {
            return (resize_rgb(rgb, w, h), AlignmentOutcome::default(), None);
        };

        sink.emit(StatusEvent::new(Status::Aligning, "aligning to reference"));
        match aligner.align(rgb) {
            Ok(aligned) => {
                debug!(
                    "aligned with {}/{} inliers ({:.2})",
                    aligned.inliers, aligned.matches, aligned.inlier_ratio
                );
                let outcome = AlignmentOutcome {
                    aligned: true,
                    inlier_ratio: Some(aligned.inlier_ratio),
                    error: None,
                };
                (aligned.image, outcome, aligned.debug)
            }
            Err(e) => {
                let message = format!("alignment failed, using the unaligned page: {e}");
                warn!("{message}");
                sink.emit(
                    StatusEvent::new(Status::Warning, message.clone())
                        .with_details(json!({ "inlier_ratio": e.inlier_ratio() })),
                );
                warnings.push(message);
                let outcome = AlignmentOutcome {
                    aligned: false,
                    inlier_ratio: e.inlier_ratio(),
                    error: Some(e.to_string()),
                };
                (resize_rgb(rgb, w, h), outcome, None)
            }
        }
    }

    fn read_code(
        &self,
        answers: &BTreeMap<String, String>,
        field: CodeField,
    ) -> Result<String, RecognitionFailure> {
        let (columns, prefix, length) = match field {
            CodeField::StudentNumber => (self.student_columns, &self.codes.student_prefix, None),
            CodeField::ExamCode => (
                self.exam_columns,
                &self.codes.exam_code_prefix,
                self.codes.exam_code_length,
            ),
        };
        if columns == 0 {
            return Ok(UNKNOWN_CODE.to_string());
        }
        // every bubbled column must carry a digit
        let length = length.or(Some(columns));
        let code = self.grouper.extract_code(answers, prefix);
        validate_code(field, &code, length)?;
        Ok(code)
    }

    fn grade_inner(
        &self,
        image: &DynamicImage,
        filename: &str,
        exam: &ExamContext,
        sink: &mut dyn EventSink,
    ) -> Result<GradedSheet, SheetError> {
        let deadline = Deadline::start(self.deadline);
        let mut warnings = Vec::new();
        sink.emit(StatusEvent::new(Status::Processing, format!("processing {filename}")));

        let rgb = normalize_channels(image);
        deadline.check("alignment")?;
        let (page, alignment, alignment_debug) = self.bring_to_page(&rgb, sink, &mut warnings);

        deadline.check("classification")?;
        let classification = self.classifier.classify(&page, self.template.bubbles())?;
        for qid in &classification.multi_marked {
            let message = format!("question {qid} has more than one mark");
            sink.emit(StatusEvent::new(Status::Warning, message.clone()));
            warnings.push(message);
        }

        deadline.check("recognition")?;
        let raw = &classification.answers;
        let sbd = self.read_code(raw, CodeField::StudentNumber)?;
        let ma_de = self.read_code(raw, CodeField::ExamCode)?;
        sink.emit(
            StatusEvent::new(Status::RecognitionSuccess, "codes recognized")
                .with_details(json!({ "sbd": sbd, "ma_de": ma_de })),
        );

        let answers = self.grouper.group(raw);
        let score = match &exam.answer_key {
            Some(key) => Some(score_answers(&answers, key.for_form(&ma_de)?, &self.scoring)),
            None => None,
        };

        let student = match &exam.students {
            Some(students) if sbd != UNKNOWN_CODE => {
                sink.emit(StatusEvent::new(Status::Matching, format!("matching student {sbd}")));
                let found = match_student(
                    &sbd,
                    students.enrolled_in(&exam.classes),
                    self.codes.recognition_length,
                );
                let problem = match &found {
                    None => Some(format!("no enrolled student matches {sbd}")),
                    Some(m) if m.is_ambiguous() => Some(format!(
                        "student number {sbd} is ambiguous; picked id {}",
                        m.student.id
                    )),
                    Some(_) => None,
                };
                if let Some(message) = problem {
                    sink.emit(StatusEvent::new(Status::Warning, message.clone()));
                    warnings.push(message);
                }
                found
            }
            _ => None,
        };

        let annotated = annotate(&page, &classification.filled, &self.grouper, score.as_ref());
        let elapsed_ms = deadline.elapsed().as_secs_f64() * 1e3;
        info!(
            "{filename}: sbd={sbd} ma_de={ma_de} {} answers in {elapsed_ms:.0} ms",
            answers.len()
        );

        Ok(GradedSheet {
            result: SheetResult {
                filename: filename.to_string(),
                sbd,
                ma_de,
                answers,
                multi_marked: classification.multi_marked,
                alignment,
                score,
                student,
                warnings,
                elapsed_ms,
            },
            annotated,
            alignment_debug,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_deadline_fails_at_the_first_check() {
        let d = Deadline::start(Duration::ZERO);
        match d.check("alignment") {
            Err(SheetError::DeadlineExceeded { stage, limit_ms }) => {
                assert_eq!(stage, "alignment");
                assert_eq!(limit_ms, 0);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(Deadline::start(Duration::from_secs(60)).check("x").is_ok());
    }

    #[test]
    fn recognition_failures_map_to_their_own_status() {
        let err = SheetError::Recognition(RecognitionFailure::Missing {
            field: CodeField::StudentNumber,
        });
        let ev = failure_event(&err);
        assert_eq!(ev.status, Status::RecognitionFailed);
        assert_eq!(ev.message, "student number was not recognized");

        let ev = failure_event(&SheetError::Frame("bad".into()));
        assert_eq!(ev.status, Status::Error);
    }
}

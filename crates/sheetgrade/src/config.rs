//! JSON job configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};
use sheetgrade_align::{AlignConfig, AlignmentPreprocessor, FeatureType};
use sheetgrade_classify::{
    BubbleClassifier, BubbleDetector, ClassifierConfig, DarknessDetector, OnnxConfig, OnnxDetector,
};
use sheetgrade_core::Template;
use sheetgrade_scoring::{AnswerKey, ScoringRules, StudentDirectory};

use crate::error::GradeError;
use crate::pipeline::{ExamContext, GradingPipeline};

/// Name of the template pre-processor that carries alignment options.
pub const ALIGNMENT_STEP: &str = "FeatureBasedAlignment";

/// Where the identifying codes live and how long they are.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CodeSettings {
    pub student_prefix: String,
    pub exam_code_prefix: String,
    /// Required exam code length, when known.
    pub exam_code_length: Option<usize>,
    /// Trailing digits compared when matching student numbers.
    pub recognition_length: usize,
}

impl Default for CodeSettings {
    fn default() -> Self {
        Self {
            student_prefix: "sbd".to_string(),
            exam_code_prefix: "made".to_string(),
            exam_code_length: None,
            recognition_length: 6,
        }
    }
}

/// Everything needed to build a [`GradingPipeline`] and run a batch.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GradingConfig {
    pub template: PathBuf,
    /// ONNX bubble model; without one the darkness detector is used.
    pub model: Option<PathBuf>,
    pub onnx: OnnxConfig,
    pub darkness: DarknessDetector,
    pub classifier: ClassifierConfig,
    pub auto_align: bool,
    /// Overrides the reference named in the template.
    pub align_reference: Option<PathBuf>,
    /// Overrides the feature type named in the template.
    pub align_method: Option<FeatureType>,
    pub align_debug: bool,
    /// Full alignment settings; replaces the template options when set.
    pub align: Option<AlignConfig>,
    pub answer_key: Option<PathBuf>,
    pub students: Option<PathBuf>,
    pub classes: Vec<String>,
    pub scoring: ScoringRules,
    pub codes: CodeSettings,
    pub deadline_secs: f64,
    pub workers: Option<usize>,
    pub max_workers: usize,
    pub output_dir: Option<PathBuf>,
}

impl Default for GradingConfig {
    fn default() -> Self {
        Self {
            template: PathBuf::new(),
            model: None,
            onnx: OnnxConfig::default(),
            darkness: DarknessDetector::default(),
            classifier: ClassifierConfig::default(),
            auto_align: false,
            align_reference: None,
            align_method: None,
            align_debug: false,
            align: None,
            answer_key: None,
            students: None,
            classes: Vec::new(),
            scoring: ScoringRules::default(),
            codes: CodeSettings::default(),
            deadline_secs: 60.0,
            workers: None,
            max_workers: 8,
            output_dir: None,
        }
    }
}

impl GradingConfig {
    /// Load a JSON config from disk.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, GradeError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Write this config to disk as pretty JSON.
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), GradeError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Per-sheet time limit. Negative values mean no time at all.
    pub fn deadline(&self) -> Result<Duration, GradeError> {
        if self.deadline_secs.is_nan() {
            return Err(GradeError::Config("deadline is not a number".into()));
        }
        Duration::try_from_secs_f64(self.deadline_secs.max(0.0)).map_err(|e| {
            GradeError::Config(format!("deadline of {} s is unusable: {e}", self.deadline_secs))
        })
    }

    pub fn validate(&self) -> Result<(), GradeError> {
        if self.template.as_os_str().is_empty() {
            return Err(GradeError::Config("no template given".into()));
        }
        self.deadline()?;
        if !(0.0..=1.0).contains(&self.classifier.confidence) {
            return Err(GradeError::Config(format!(
                "confidence {} is outside [0, 1]",
                self.classifier.confidence
            )));
        }
        if self.workers == Some(0) {
            return Err(GradeError::Config("workers must be at least 1".into()));
        }
        Ok(())
    }

    /// Alignment settings: explicit `align`, else the template step's
    /// options, with the method and debug overrides applied on top.
    pub fn resolve_align_config(&self, template: &Template) -> Result<AlignConfig, GradeError> {
        let mut cfg = match (&self.align, template.pre_processor(ALIGNMENT_STEP)) {
            (Some(cfg), _) => cfg.clone(),
            (None, Some(step)) => AlignConfig::from_options(&step.options)?,
            (None, None) => AlignConfig::default(),
        };
        if let Some(method) = self.align_method {
            cfg.feature_type = method;
        }
        cfg.debug |= self.align_debug;
        cfg.reference = match (&self.align_reference, &cfg.reference) {
            (Some(path), _) => Some(path.clone()),
            (None, Some(rel)) => Some(template.resolve_path(rel)),
            (None, None) => None,
        };
        Ok(cfg)
    }

    fn build_detector(&self) -> Result<Arc<dyn BubbleDetector>, GradeError> {
        Ok(match &self.model {
            Some(path) => Arc::new(OnnxDetector::load(path, self.onnx.clone())?),
            None => {
                info!("no bubble model configured; using ink darkness");
                Arc::new(self.darkness.clone())
            }
        })
    }

    fn build_exam(&self) -> Result<ExamContext, GradeError> {
        let answer_key = self
            .answer_key
            .as_ref()
            .map(AnswerKey::load)
            .transpose()?
            .map(Arc::new);
        let students = self
            .students
            .as_ref()
            .map(StudentDirectory::load)
            .transpose()?
            .map(Arc::new);
        Ok(ExamContext {
            answer_key,
            students,
            classes: self.classes.clone(),
        })
    }

    /// Load the template, model, aligner, key and students once.
    pub fn build_pipeline(&self) -> Result<GradingPipeline, GradeError> {
        self.validate()?;
        let template = Arc::new(Template::load_json(&self.template)?);
        info!(
            "template {}: {} blocks, {} bubbles",
            self.template.display(),
            template.field_blocks.len(),
            template.bubbles().len()
        );

        let classifier = BubbleClassifier::new(self.build_detector()?, self.classifier.clone());
        let mut pipeline = GradingPipeline::new(template.clone(), classifier)
            .with_codes(self.codes.clone())
            .with_scoring(self.scoring.clone())
            .with_deadline(self.deadline()?)
            .with_exam(self.build_exam()?);

        if self.auto_align {
            let cfg = self.resolve_align_config(&template)?;
            let reference = cfg.reference.clone().ok_or_else(|| {
                GradeError::Config("auto-align needs a reference image (-r or template option)".into())
            })?;
            let aligner = AlignmentPreprocessor::from_path(&reference, template.page_size(), cfg)?;
            info!(
                "alignment reference {}: {} keypoints",
                reference.display(),
                aligner.reference_keypoints()
            );
            pipeline = pipeline.with_aligner(Arc::new(aligner));
        }
        Ok(pipeline)
    }
}

//! Template descriptor parsing and bubble geometry.
//!
//! A template describes the canonical page: its size, the default bubble
//! size, and a list of field blocks. Every block is a regular grid whose
//! bubble positions are fully determined by its origin, gaps, label count
//! and the choice alphabet of its field type. Geometry is derived once at
//! load time and cached on the [`Template`].

use crate::image::PixelRect;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

/// Errors raised while loading a template. All of them are fatal for a job.
#[derive(thiserror::Error, Debug)]
pub enum TemplateLoadError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("template is missing required key `{0}`")]
    MissingKey(&'static str),
    #[error("field block `{block}` is missing required key `{key}`")]
    MissingBlockKey { block: String, key: &'static str },
    #[error("field block `{block}` has an invalid `{key}`: {reason}")]
    InvalidValue {
        block: String,
        key: &'static str,
        reason: String,
    },
    #[error("field block `{block}` uses unknown field type `{field_type}`")]
    UnknownFieldType { block: String, field_type: String },
    #[error(
        "field block `{block}` declares {rows}x{cols} bubbles but its labels and choices span {expected_rows}x{expected_cols}"
    )]
    GridMismatch {
        block: String,
        rows: usize,
        cols: usize,
        expected_rows: usize,
        expected_cols: usize,
    },
    #[error("bubble ({qid}, {choice}) is defined more than once (block `{block}`)")]
    DuplicateBubble {
        block: String,
        qid: String,
        choice: String,
    },
    #[error("bubble ({first}) overlaps bubble ({second})")]
    Overlap { first: String, second: String },
    #[error("invalid field label range `{0}`")]
    BadLabelRange(String),
    #[error("custom label `{name}` references unknown field label `{label}`")]
    UnknownCustomLabel { name: String, label: String },
}

/// Layout direction of a field block.
///
/// - `Horizontal`: one label per row, choices run across columns.
/// - `Vertical`: one label per column, choices run down rows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Horizontal,
    Vertical,
}

/// Closed set of supported field types, resolved once at load time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    #[serde(rename = "QTYPE_MCQ4")]
    Mcq4,
    #[serde(rename = "QTYPE_MCQ5")]
    Mcq5,
    #[serde(rename = "QTYPE_INT")]
    Int,
    #[serde(rename = "QTYPE_INT_FROM_1")]
    IntFrom1,
    #[serde(rename = "QTYPE_TF")]
    TrueFalse,
}

impl FieldType {
    /// Resolve a descriptor name. Accepts both `QTYPE_MCQ4` and `MCQ4` forms.
    pub fn parse(name: &str) -> Option<Self> {
        let upper = name.trim().to_ascii_uppercase();
        let short = upper.strip_prefix("QTYPE_").unwrap_or(&upper);
        match short {
            "MCQ4" => Some(Self::Mcq4),
            "MCQ5" => Some(Self::Mcq5),
            "INT" => Some(Self::Int),
            "INT_FROM_1" => Some(Self::IntFrom1),
            "TF" | "TRUE_FALSE" => Some(Self::TrueFalse),
            _ => None,
        }
    }

    /// Choice labels in traversal order.
    pub fn choices(self) -> &'static [&'static str] {
        match self {
            Self::Mcq4 => &["A", "B", "C", "D"],
            Self::Mcq5 => &["A", "B", "C", "D", "E"],
            Self::Int => &["0", "1", "2", "3", "4", "5", "6", "7", "8", "9"],
            Self::IntFrom1 => &["1", "2", "3", "4", "5", "6", "7", "8", "9", "0"],
            Self::TrueFalse => &["T", "F"],
        }
    }

    pub fn direction(self) -> Direction {
        match self {
            Self::Mcq4 | Self::Mcq5 | Self::TrueFalse => Direction::Horizontal,
            Self::Int | Self::IntFrom1 => Direction::Vertical,
        }
    }
}

/// One bubble in canonical template coordinates (top-left corner + size).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BubblePoint {
    pub x: f32,
    pub y: f32,
    pub qid: String,
    pub choice: String,
    pub width: f32,
    pub height: f32,
}

impl BubblePoint {
    /// Bounding box clipped to an image of `img_w x img_h` pixels.
    ///
    /// Returns `None` for degenerate (zero-area) crops.
    pub fn clipped_rect(&self, img_w: u32, img_h: u32) -> Option<PixelRect> {
        PixelRect::clipped(self.x, self.y, self.width, self.height, img_w, img_h)
    }

    fn overlaps(&self, other: &BubblePoint) -> bool {
        let ix = (self.x + self.width).min(other.x + other.width) - self.x.max(other.x);
        let iy = (self.y + self.height).min(other.y + other.height) - self.y.max(other.y);
        ix > 1e-3 && iy > 1e-3
    }

    fn describe(&self) -> String {
        format!("{}, {} @ {:.1},{:.1}", self.qid, self.choice, self.x, self.y)
    }
}

/// A rectangular grid of bubbles sharing layout parameters.
#[derive(Clone, Debug, Serialize)]
pub struct FieldBlock {
    pub name: String,
    pub field_type: FieldType,
    pub origin: [f32; 2],
    pub field_labels: Vec<String>,
    pub rows: usize,
    pub cols: usize,
    pub bubbles_gap: f32,
    pub labels_gap: f32,
    pub bubble_dimensions: [f32; 2],
    /// Derived block extent `[width, height]`.
    pub dimensions: [f32; 2],
}

impl FieldBlock {
    /// Emit every bubble of the block, labels outer, choices inner.
    pub fn bubbles(&self) -> Vec<BubblePoint> {
        let choices = self.field_type.choices();
        let [bw, bh] = self.bubble_dimensions;
        let mut out = Vec::with_capacity(self.field_labels.len() * choices.len());
        for (li, label) in self.field_labels.iter().enumerate() {
            for (ci, choice) in choices.iter().enumerate() {
                let (dx, dy) = match self.field_type.direction() {
                    Direction::Horizontal => {
                        (ci as f32 * self.bubbles_gap, li as f32 * self.labels_gap)
                    }
                    Direction::Vertical => {
                        (li as f32 * self.labels_gap, ci as f32 * self.bubbles_gap)
                    }
                };
                out.push(BubblePoint {
                    x: self.origin[0] + dx,
                    y: self.origin[1] + dy,
                    qid: label.clone(),
                    choice: (*choice).to_string(),
                    width: bw,
                    height: bh,
                });
            }
        }
        out
    }
}

/// Declared pre-processing step (`preProcessors` entry).
///
/// Options are kept as raw JSON; the consuming crate interprets them.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PreProcessorSpec {
    pub name: String,
    #[serde(default)]
    pub options: Value,
}

/// Bubble size used when neither the template nor a block sets one.
pub const DEFAULT_BUBBLE_DIMENSIONS: [f32; 2] = [10.0, 10.0];

/// Parsed, validated and immutable template.
#[derive(Clone, Debug)]
pub struct Template {
    pub page_dimensions: [f32; 2],
    pub bubble_dimensions: [f32; 2],
    pub field_blocks: Vec<FieldBlock>,
    /// Composite field name -> ordered sub-field labels.
    pub custom_labels: BTreeMap<String, Vec<String>>,
    pub pre_processors: Vec<PreProcessorSpec>,
    base_dir: Option<PathBuf>,
    bubbles: Vec<BubblePoint>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTemplate {
    page_dimensions: Option<[f32; 2]>,
    bubble_dimensions: Option<[f32; 2]>,
    #[serde(default)]
    custom_labels: BTreeMap<String, Vec<String>>,
    field_blocks: Option<Map<String, Value>>,
    #[serde(default)]
    pre_processors: Vec<PreProcessorSpec>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFieldBlock {
    field_type: Option<String>,
    origin: Option<[f32; 2]>,
    field_labels: Option<Vec<String>>,
    rows: Option<usize>,
    cols: Option<usize>,
    bubbles_gap: Option<f32>,
    labels_gap: Option<f32>,
    bubble_dimensions: Option<[f32; 2]>,
}

impl Template {
    /// Load a template descriptor from disk.
    ///
    /// Relative paths inside the template (e.g. an alignment reference) are
    /// resolved against the template's directory.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, TemplateLoadError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)?;
        let mut template = Self::from_json_str(&raw)?;
        template.base_dir = path.parent().map(Path::to_path_buf);
        Ok(template)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, TemplateLoadError> {
        Self::from_value(serde_json::from_str(raw)?)
    }

    pub fn from_value(value: Value) -> Result<Self, TemplateLoadError> {
        let raw: RawTemplate = serde_json::from_value(value)?;
        let page_dimensions = raw
            .page_dimensions
            .ok_or(TemplateLoadError::MissingKey("pageDimensions"))?;
        let bubble_dimensions = raw.bubble_dimensions.unwrap_or(DEFAULT_BUBBLE_DIMENSIONS);
        let raw_blocks = raw
            .field_blocks
            .ok_or(TemplateLoadError::MissingKey("fieldBlocks"))?;

        let mut field_blocks = Vec::with_capacity(raw_blocks.len());
        for (name, value) in raw_blocks {
            let block: RawFieldBlock = serde_json::from_value(value)?;
            field_blocks.push(build_block(name, block, bubble_dimensions)?);
        }

        let bubbles = derive_bubbles(&field_blocks)?;
        check_custom_labels(&raw.custom_labels, &field_blocks)?;

        let [pw, ph] = page_dimensions;
        if let Some(outside) = bubbles
            .iter()
            .find(|b| b.x < 0.0 || b.y < 0.0 || b.x + b.width > pw || b.y + b.height > ph)
        {
            log::warn!(
                "bubble ({}) lies outside the {}x{} page",
                outside.describe(),
                pw,
                ph
            );
        }

        log::debug!(
            "template loaded: {} blocks, {} bubbles",
            field_blocks.len(),
            bubbles.len()
        );

        Ok(Self {
            page_dimensions,
            bubble_dimensions,
            field_blocks,
            custom_labels: raw.custom_labels,
            pre_processors: raw.pre_processors,
            base_dir: None,
            bubbles,
        })
    }

    /// All bubbles of the template, block by block in declaration order.
    #[inline]
    pub fn bubbles(&self) -> &[BubblePoint] {
        &self.bubbles
    }

    /// Page size in whole pixels.
    pub fn page_size(&self) -> (u32, u32) {
        (
            self.page_dimensions[0].round().max(1.0) as u32,
            self.page_dimensions[1].round().max(1.0) as u32,
        )
    }

    /// First pre-processor with the given name (case-insensitive).
    pub fn pre_processor(&self, name: &str) -> Option<&PreProcessorSpec> {
        self.pre_processors
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    /// Resolve a path mentioned inside the template.
    pub fn resolve_path(&self, rel: impl AsRef<Path>) -> PathBuf {
        let rel = rel.as_ref();
        match &self.base_dir {
            Some(dir) if rel.is_relative() => dir.join(rel),
            _ => rel.to_path_buf(),
        }
    }
}

fn build_block(
    name: String,
    raw: RawFieldBlock,
    default_bubble: [f32; 2],
) -> Result<FieldBlock, TemplateLoadError> {
    let type_name = raw
        .field_type
        .ok_or_else(|| missing(&name, "fieldType"))?;
    let field_type =
        FieldType::parse(&type_name).ok_or_else(|| TemplateLoadError::UnknownFieldType {
            block: name.clone(),
            field_type: type_name.clone(),
        })?;
    let origin = raw.origin.ok_or_else(|| missing(&name, "origin"))?;
    let labels = raw
        .field_labels
        .ok_or_else(|| missing(&name, "fieldLabels"))?;
    let field_labels = expand_labels(&labels)?;
    if field_labels.is_empty() {
        return Err(TemplateLoadError::InvalidValue {
            block: name,
            key: "fieldLabels",
            reason: "no labels".into(),
        });
    }

    let n_choices = field_type.choices().len();
    let (expected_rows, expected_cols) = match field_type.direction() {
        Direction::Horizontal => (field_labels.len(), n_choices),
        Direction::Vertical => (n_choices, field_labels.len()),
    };
    let rows = raw.rows.unwrap_or(expected_rows);
    let cols = raw.cols.unwrap_or(expected_cols);
    if rows != expected_rows || cols != expected_cols {
        return Err(TemplateLoadError::GridMismatch {
            block: name,
            rows,
            cols,
            expected_rows,
            expected_cols,
        });
    }

    let bubbles_gap = gap_or_zero(&name, "bubblesGap", raw.bubbles_gap, n_choices)?;
    let labels_gap = gap_or_zero(&name, "labelsGap", raw.labels_gap, field_labels.len())?;
    let bubble_dimensions = raw.bubble_dimensions.unwrap_or(default_bubble);
    if bubble_dimensions.iter().any(|d| !d.is_finite() || *d <= 0.0) {
        return Err(TemplateLoadError::InvalidValue {
            block: name,
            key: "bubbleDimensions",
            reason: "must be positive".into(),
        });
    }

    let [bw, bh] = bubble_dimensions;
    let dimensions = match field_type.direction() {
        Direction::Horizontal => [
            (cols - 1) as f32 * bubbles_gap + bw,
            (rows - 1) as f32 * labels_gap + bh,
        ],
        Direction::Vertical => [
            (cols - 1) as f32 * labels_gap + bw,
            (rows - 1) as f32 * bubbles_gap + bh,
        ],
    };

    Ok(FieldBlock {
        name,
        field_type,
        origin,
        field_labels,
        rows,
        cols,
        bubbles_gap,
        labels_gap,
        bubble_dimensions,
        dimensions,
    })
}

fn missing(block: &str, key: &'static str) -> TemplateLoadError {
    TemplateLoadError::MissingBlockKey {
        block: block.to_string(),
        key,
    }
}

/// A gap only matters when there is more than one step along its axis.
fn gap_or_zero(
    block: &str,
    key: &'static str,
    gap: Option<f32>,
    steps: usize,
) -> Result<f32, TemplateLoadError> {
    match gap {
        Some(g) if g.is_finite() && g >= 0.0 => Ok(g),
        Some(g) => Err(TemplateLoadError::InvalidValue {
            block: block.to_string(),
            key,
            reason: format!("{g} is not a valid gap"),
        }),
        None if steps <= 1 => Ok(0.0),
        None => Err(missing(block, key)),
    }
}

/// Expand `q1..20` style ranges; plain labels pass through.
fn expand_labels(labels: &[String]) -> Result<Vec<String>, TemplateLoadError> {
    let mut out = Vec::with_capacity(labels.len());
    for label in labels {
        let Some((start, end)) = label.split_once("..") else {
            out.push(label.clone());
            continue;
        };
        let bad = || TemplateLoadError::BadLabelRange(label.clone());
        let digits_at = start
            .find(|c: char| c.is_ascii_digit())
            .ok_or_else(bad)?;
        let (prefix, first) = start.split_at(digits_at);
        let first: u32 = first.parse().map_err(|_| bad())?;
        let last: u32 = end.trim().parse().map_err(|_| bad())?;
        if last < first {
            return Err(bad());
        }
        out.extend((first..=last).map(|n| format!("{prefix}{n}")));
    }
    Ok(out)
}

fn derive_bubbles(blocks: &[FieldBlock]) -> Result<Vec<BubblePoint>, TemplateLoadError> {
    let mut seen = HashSet::new();
    let mut bubbles: Vec<BubblePoint> = Vec::new();
    for block in blocks {
        for bubble in block.bubbles() {
            if !seen.insert((bubble.qid.clone(), bubble.choice.clone())) {
                return Err(TemplateLoadError::DuplicateBubble {
                    block: block.name.clone(),
                    qid: bubble.qid,
                    choice: bubble.choice,
                });
            }
            if let Some(other) = bubbles.iter().find(|b| b.overlaps(&bubble)) {
                return Err(TemplateLoadError::Overlap {
                    first: other.describe(),
                    second: bubble.describe(),
                });
            }
            bubbles.push(bubble);
        }
    }
    Ok(bubbles)
}

fn check_custom_labels(
    custom: &BTreeMap<String, Vec<String>>,
    blocks: &[FieldBlock],
) -> Result<(), TemplateLoadError> {
    let known: HashSet<&str> = blocks
        .iter()
        .flat_map(|b| b.field_labels.iter().map(String::as_str))
        .collect();
    for (name, parts) in custom {
        if let Some(label) = parts.iter().find(|p| !known.contains(p.as_str())) {
            return Err(TemplateLoadError::UnknownCustomLabel {
                name: name.clone(),
                label: label.clone(),
            });
        }
    }
    Ok(())
}

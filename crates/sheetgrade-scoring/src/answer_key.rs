//! Answer keys, one per exam form.
//!
//! Accepted JSON layouts:
//!
//! ```json
//! {"forms": {"101": {"answers": {"1": "A"}, "points": {"1": 0.5}}}}
//! {"101": {"1": "A", "2": "C"}, "102": {"1": "B"}}
//! {"1": "A", "2": "C"}
//! ```
//!
//! The last one is a single key shared by every form. CSV keys use the
//! columns `form,question,answer[,points]`; an empty `form` cell adds the
//! row to the shared key.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ScoringError, ScoringResult};

/// Correct answers (and optional per-question points) for one form.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FormKey {
    pub answers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub points: BTreeMap<String, f64>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AnswerKey {
    forms: BTreeMap<String, FormKey>,
    shared: Option<FormKey>,
}

fn answer_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(if *b { "T" } else { "F" }.to_string()),
        _ => None,
    }
}

fn answers_from(obj: &Map<String, Value>, context: &str) -> ScoringResult<BTreeMap<String, String>> {
    obj.iter()
        .map(|(q, v)| {
            answer_text(v)
                .map(|a| (q.trim().to_string(), a))
                .ok_or_else(|| ScoringError::InvalidKey(format!("{context}: answer for `{q}` is not text")))
        })
        .collect()
}

fn form_from(value: &Value, context: &str) -> ScoringResult<FormKey> {
    let obj = value
        .as_object()
        .ok_or_else(|| ScoringError::InvalidKey(format!("{context}: expected an object")))?;
    match obj.get("answers") {
        Some(Value::Object(answers)) => {
            let points = match obj.get("points") {
                Some(p) => serde_json::from_value(p.clone())?,
                None => BTreeMap::new(),
            };
            Ok(FormKey {
                answers: answers_from(answers, context)?,
                points,
            })
        }
        _ => Ok(FormKey {
            answers: answers_from(obj, context)?,
            points: BTreeMap::new(),
        }),
    }
}

impl AnswerKey {
    pub fn new(forms: BTreeMap<String, FormKey>) -> Self {
        Self {
            forms,
            shared: None,
        }
    }

    /// A single key used for every form code.
    pub fn shared(key: FormKey) -> Self {
        Self {
            forms: BTreeMap::new(),
            shared: Some(key),
        }
    }

    /// Load by extension: `.json` or `.csv`.
    pub fn load(path: impl AsRef<Path>) -> ScoringResult<Self> {
        let path = path.as_ref();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        let key = match ext.as_deref() {
            Some("json") => {
                let mut raw = String::new();
                File::open(path)?.read_to_string(&mut raw)?;
                Self::from_json_str(&raw)?
            }
            Some("csv") => Self::from_csv_reader(File::open(path)?)?,
            _ => return Err(ScoringError::UnsupportedFormat(path.to_path_buf())),
        };
        debug!(
            "answer key {}: {} forms{}",
            path.display(),
            key.forms.len(),
            if key.shared.is_some() { " + shared" } else { "" }
        );
        Ok(key)
    }

    pub fn from_json_str(raw: &str) -> ScoringResult<Self> {
        Self::from_json_value(&serde_json::from_str(raw)?)
    }

    pub fn from_json_value(value: &Value) -> ScoringResult<Self> {
        let root = value
            .as_object()
            .ok_or_else(|| ScoringError::InvalidKey("top level must be an object".into()))?;

        if let Some(forms) = root.get("forms") {
            let forms = forms
                .as_object()
                .ok_or_else(|| ScoringError::InvalidKey("`forms` must be an object".into()))?;
            let forms = forms
                .iter()
                .map(|(code, v)| Ok((code.trim().to_string(), form_from(v, code)?)))
                .collect::<ScoringResult<_>>()?;
            return Ok(Self::new(forms));
        }

        if root.values().all(|v| answer_text(v).is_some()) {
            return Ok(Self::shared(FormKey {
                answers: answers_from(root, "shared key")?,
                points: BTreeMap::new(),
            }));
        }

        let forms = root
            .iter()
            .map(|(code, v)| Ok((code.trim().to_string(), form_from(v, code)?)))
            .collect::<ScoringResult<_>>()?;
        Ok(Self::new(forms))
    }

    pub fn from_csv_reader<R: Read>(reader: R) -> ScoringResult<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .flexible(true)
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut key = Self::default();
        for (line, record) in rdr.records().enumerate() {
            let record = record?;
            if record.len() < 3 {
                return Err(ScoringError::InvalidKey(format!(
                    "row {} has {} columns, expected form,question,answer[,points]",
                    line + 2,
                    record.len()
                )));
            }
            let (form, question, answer) = (&record[0], &record[1], &record[2]);
            let target = if form.is_empty() {
                key.shared.get_or_insert_with(FormKey::default)
            } else {
                key.forms.entry(form.to_string()).or_default()
            };
            target.answers.insert(question.to_string(), answer.to_string());
            if let Some(points) = record.get(3).filter(|p| !p.is_empty()) {
                let points = points.parse::<f64>().map_err(|_| {
                    ScoringError::InvalidKey(format!("row {}: points `{points}` is not a number", line + 2))
                })?;
                target.points.insert(question.to_string(), points);
            }
        }
        Ok(key)
    }

    /// Key for an exam form code; falls back to the shared key.
    pub fn for_form(&self, code: &str) -> ScoringResult<&FormKey> {
        self.forms
            .get(code.trim())
            .or(self.shared.as_ref())
            .ok_or_else(|| ScoringError::NoKeyForForm(code.to_string()))
    }

    pub fn form_codes(&self) -> impl Iterator<Item = &str> {
        self.forms.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.forms.is_empty() && self.shared.is_none()
    }
}

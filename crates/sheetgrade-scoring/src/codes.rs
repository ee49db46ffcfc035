//! Identifier codes and composite answers.
//!
//! A code such as the student number is bubbled one digit per column; the
//! classifier reports each column as its own question (`sbd_1`, `sbd_2`, ...).
//! Multi-column answers work the same way (`q21_col1`, `q21_col2`). This
//! module joins those columns back together.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use log::debug;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Returned when no column of a code was recognized.
pub const UNKNOWN_CODE: &str = "unknown";

static COLUMN_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<base>.+)_col(?P<index>\d+)$").expect("static regex")
});

fn indexed_suffix(key: &str, prefix: &str) -> Option<u32> {
    key.strip_prefix(prefix)?
        .strip_prefix('_')?
        .parse::<u32>()
        .ok()
}

/// Join every `<prefix>_<n>` answer in ascending `n`, or [`UNKNOWN_CODE`].
pub fn extract_code(answers: &BTreeMap<String, String>, prefix: &str) -> String {
    let mut parts: Vec<(u32, &str)> = answers
        .iter()
        .filter_map(|(k, v)| indexed_suffix(k, prefix).map(|i| (i, v.as_str())))
        .collect();
    if parts.is_empty() {
        return UNKNOWN_CODE.to_string();
    }
    parts.sort_by_key(|(i, _)| *i);
    parts.into_iter().map(|(_, v)| v).collect()
}

/// Merge `<base>_col<n>` keys into `<base>`, columns in ascending `n`.
///
/// Other keys pass through unchanged; applying it twice changes nothing.
pub fn group_answers(answers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    let mut columns: BTreeMap<String, Vec<(u32, &str)>> = BTreeMap::new();

    for (key, value) in answers {
        match COLUMN_KEY.captures(key) {
            Some(caps) => {
                let index = caps["index"].parse::<u32>().unwrap_or(u32::MAX);
                columns
                    .entry(caps["base"].to_string())
                    .or_default()
                    .push((index, value));
            }
            None => {
                out.insert(key.clone(), value.clone());
            }
        }
    }

    for (base, mut cols) in columns {
        cols.sort_by_key(|(i, _)| *i);
        let joined: String = cols.into_iter().map(|(_, v)| v).collect();
        if out.insert(base.clone(), joined).is_some() {
            debug!("composite `{base}` replaced a plain answer with the same id");
        }
    }
    out
}

/// Grouping driven by the template's declared composites, with pattern
/// inference for everything the template leaves undeclared.
#[derive(Clone, Debug, Default)]
pub struct AnswerGrouper {
    declared: BTreeMap<String, Vec<String>>,
}

impl AnswerGrouper {
    pub fn new(declared: BTreeMap<String, Vec<String>>) -> Self {
        Self { declared }
    }

    pub fn declared(&self) -> &BTreeMap<String, Vec<String>> {
        &self.declared
    }

    /// Join the declared sub-fields of `name` in declaration order. `None`
    /// when `name` is not declared or none of its parts were answered.
    fn lookup(&self, answers: &BTreeMap<String, String>, name: &str) -> Option<String> {
        let parts = self.declared.get(name)?;
        let mut any = false;
        let joined = parts
            .iter()
            .filter_map(|p| answers.get(p))
            .inspect(|_| any = true)
            .map(String::as_str)
            .collect::<String>();
        any.then_some(joined)
    }

    pub fn group(&self, answers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut rest = answers.clone();
        let mut grouped = BTreeMap::new();
        for (name, parts) in &self.declared {
            if let Some(value) = self.lookup(answers, name) {
                grouped.insert(name.clone(), value);
            }
            for part in parts {
                rest.remove(part);
            }
        }
        // declared composites take precedence over inferred ones
        for (key, value) in group_answers(&rest) {
            grouped.entry(key).or_insert(value);
        }
        grouped
    }

    /// Question id that raw answer `qid` ends up under after [`Self::group`].
    pub fn group_key(&self, qid: &str) -> String {
        if let Some((name, _)) = self
            .declared
            .iter()
            .find(|(_, parts)| parts.iter().any(|p| p == qid))
        {
            return name.clone();
        }
        COLUMN_KEY
            .captures(qid)
            .map(|caps| caps["base"].to_string())
            .unwrap_or_else(|| qid.to_string())
    }

    /// True when the template defines any bubble for code `prefix`.
    pub fn defines_code(&self, qids: impl IntoIterator<Item = impl AsRef<str>>, prefix: &str) -> bool {
        self.declared.contains_key(prefix)
            || qids
                .into_iter()
                .any(|q| indexed_suffix(q.as_ref(), prefix).is_some())
    }

    /// Code for `prefix`: declared composite when there is one, otherwise
    /// the `<prefix>_<n>` convention.
    pub fn extract_code(&self, answers: &BTreeMap<String, String>, prefix: &str) -> String {
        if self.declared.contains_key(prefix) {
            return self
                .lookup(answers, prefix)
                .unwrap_or_else(|| UNKNOWN_CODE.to_string());
        }
        extract_code(answers, prefix)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeField {
    StudentNumber,
    ExamCode,
}

impl fmt::Display for CodeField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::StudentNumber => "student number",
            Self::ExamCode => "exam code",
        })
    }
}

/// Why an extracted code cannot be used.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecognitionFailure {
    #[error("{field} was not recognized")]
    Missing { field: CodeField },
    #[error("{field} `{code}` contains non-digit marks")]
    NotNumeric { field: CodeField, code: String },
    #[error("{field} `{code}` has {len} digits, expected {expected}")]
    WrongLength {
        field: CodeField,
        code: String,
        len: usize,
        expected: usize,
    },
}

/// Accept a code that is present, numeric and, when `expected_len` is set,
/// exactly that long.
pub fn validate_code(
    field: CodeField,
    code: &str,
    expected_len: Option<usize>,
) -> Result<(), RecognitionFailure> {
    let code = code.trim();
    if code.is_empty() || code == UNKNOWN_CODE {
        return Err(RecognitionFailure::Missing { field });
    }
    if !code.chars().all(|c| c.is_ascii_digit()) {
        return Err(RecognitionFailure::NotNumeric {
            field,
            code: code.to_string(),
        });
    }
    match expected_len {
        Some(expected) if code.len() != expected => Err(RecognitionFailure::WrongLength {
            field,
            code: code.to_string(),
            len: code.len(),
            expected,
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn code_digits_join_in_numeric_order() {
        let a = map(&[("sbd_10", "9"), ("sbd_2", "1"), ("sbd_1", "0"), ("q1", "A")]);
        assert_eq!(extract_code(&a, "sbd"), "019");
        assert_eq!(extract_code(&a, "made"), UNKNOWN_CODE);
        // prefix must be followed by `_<digits>`
        let b = map(&[("sbdx_1", "4"), ("sbd_x", "5")]);
        assert_eq!(extract_code(&b, "sbd"), UNKNOWN_CODE);
    }

    #[test]
    fn columns_group_and_grouping_is_idempotent() {
        let a = map(&[
            ("q1", "A"),
            ("q21_col2", "5"),
            ("q21_col1", "1"),
            ("q21_col10", "0"),
        ]);
        let once = group_answers(&a);
        assert_eq!(once, map(&[("q1", "A"), ("q21", "150")]));
        assert_eq!(group_answers(&once), once);
    }

    #[test]
    fn declared_composites_win_over_inference() {
        let mut declared = BTreeMap::new();
        declared.insert(
            "q21".to_string(),
            vec!["q21_col2".to_string(), "q21_col1".to_string()],
        );
        let grouper = AnswerGrouper::new(declared);
        let a = map(&[("q21_col1", "1"), ("q21_col2", "2"), ("q22_col1", "7"), ("q1", "C")]);
        let g = grouper.group(&a);
        // declaration order, not column order
        assert_eq!(g["q21"], "21");
        assert_eq!(g["q22"], "7");
        assert_eq!(g["q1"], "C");
        assert_eq!(grouper.group(&g), g);
    }

    #[test]
    fn declared_code_lookup() {
        let mut declared = BTreeMap::new();
        declared.insert("made".to_string(), vec!["m1".into(), "m2".into(), "m3".into()]);
        let grouper = AnswerGrouper::new(declared);
        assert_eq!(
            grouper.extract_code(&map(&[("m1", "1"), ("m2", "0"), ("m3", "2")]), "made"),
            "102"
        );
        assert_eq!(grouper.extract_code(&map(&[]), "made"), UNKNOWN_CODE);
        assert_eq!(grouper.extract_code(&map(&[("sbd_1", "3")]), "sbd"), "3");
        assert_eq!(grouper.group_key("m2"), "made");
        assert_eq!(grouper.group_key("q4_col2"), "q4");
        assert_eq!(grouper.group_key("q4"), "q4");
        assert!(grouper.defines_code(["q1"], "made"));
        assert!(grouper.defines_code(["q1", "sbd_1"], "sbd"));
        assert!(!grouper.defines_code(["q1"], "sbd"));
    }

    #[test]
    fn code_validation() {
        assert!(validate_code(CodeField::StudentNumber, "012345", Some(6)).is_ok());
        assert!(validate_code(CodeField::ExamCode, "101", None).is_ok());
        assert_eq!(
            validate_code(CodeField::ExamCode, UNKNOWN_CODE, None),
            Err(RecognitionFailure::Missing {
                field: CodeField::ExamCode
            })
        );
        assert!(matches!(
            validate_code(CodeField::StudentNumber, "01A3", None),
            Err(RecognitionFailure::NotNumeric { .. })
        ));
        let err = validate_code(CodeField::StudentNumber, "123", Some(6)).expect_err("short");
        assert_eq!(err.to_string(), "student number `123` has 3 digits, expected 6");
    }
}

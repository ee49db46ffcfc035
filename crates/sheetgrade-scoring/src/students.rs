use std::fs::File;
use std::io::Read;
use std::path::Path;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::{ScoringError, ScoringResult};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Student {
    pub id: u64,
    pub school_code: String,
    pub name: String,
    #[serde(default)]
    pub class_id: Option<String>,
}

/// Students available for matching, usually filtered to an exam's classes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StudentDirectory {
    students: Vec<Student>,
}

impl StudentDirectory {
    pub fn new(students: Vec<Student>) -> Self {
        Self { students }
    }

    /// `.json` (array of students) or `.csv` (`id,school_code,name,class_id`).
    pub fn load(path: impl AsRef<Path>) -> ScoringResult<Self> {
        let path = path.as_ref();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("json") => {
                let mut raw = String::new();
                File::open(path)?.read_to_string(&mut raw)?;
                Ok(serde_json::from_str(&raw)?)
            }
            Some("csv") => Self::from_csv_reader(File::open(path)?),
            _ => Err(ScoringError::UnsupportedFormat(path.to_path_buf())),
        }
    }

    pub fn from_csv_reader<R: Read>(reader: R) -> ScoringResult<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);
        let mut students = Vec::new();
        for (line, row) in rdr.deserialize::<Student>().enumerate() {
            let mut student = row.map_err(|e| ScoringError::InvalidStudents(format!("row {}: {e}", line + 2)))?;
            if student.class_id.as_deref() == Some("") {
                student.class_id = None;
            }
            students.push(student);
        }
        Ok(Self::new(students))
    }

    pub fn len(&self) -> usize {
        self.students.len()
    }

    pub fn is_empty(&self) -> bool {
        self.students.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Student> {
        self.students.iter()
    }

    /// Students in any of `classes`; everyone when `classes` is empty.
    pub fn enrolled_in<'a>(&'a self, classes: &'a [String]) -> impl Iterator<Item = &'a Student> + 'a {
        self.students.iter().filter(move |s| {
            classes.is_empty()
                || s.class_id
                    .as_deref()
                    .is_some_and(|c| classes.iter().any(|wanted| wanted == c))
        })
    }
}

/// Matched student plus any other students that matched equally well.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StudentMatch {
    pub student: Student,
    /// Ids of the other candidates; non-empty means the match was ambiguous.
    pub ambiguous_with: Vec<u64>,
}

impl StudentMatch {
    pub fn is_ambiguous(&self) -> bool {
        !self.ambiguous_with.is_empty()
    }
}

fn last_digits(s: &str, n: usize) -> Option<String> {
    let digits: Vec<char> = s.chars().filter(|c| c.is_ascii_digit()).collect();
    (digits.len() >= n).then(|| digits[digits.len() - n..].iter().collect())
}

/// Match a recognized student number by its last `length` digits.
///
/// Ties go to the lowest student id; the others are reported in
/// [`StudentMatch::ambiguous_with`]. A code shorter than `length` matches
/// nobody.
pub fn match_student<'a>(
    code: &str,
    candidates: impl IntoIterator<Item = &'a Student>,
    length: usize,
) -> Option<StudentMatch> {
    if length == 0 {
        return None;
    }
    let wanted = last_digits(code, length)?;
    let mut hits: Vec<&Student> = candidates
        .into_iter()
        .filter(|s| last_digits(&s.school_code, length).as_deref() == Some(wanted.as_str()))
        .collect();
    hits.sort_by_key(|s| s.id);

    let (first, rest) = hits.split_first()?;
    let ambiguous_with: Vec<u64> = rest.iter().map(|s| s.id).collect();
    if !ambiguous_with.is_empty() {
        warn!(
            "student number {code} matches {} students; picked id {} over {:?}",
            hits.len(),
            first.id,
            ambiguous_with
        );
    }
    Some(StudentMatch {
        student: (*first).clone(),
        ambiguous_with,
    })
}

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::answer_key::FormKey;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringRules {
    /// Shared out evenly over questions without explicit points.
    pub total_points: f64,
    /// Decimal places kept in aggregated scores.
    pub decimals: u32,
}

impl Default for ScoringRules {
    fn default() -> Self {
        Self {
            total_points: 10.0,
            decimals: 2,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Correct,
    Wrong,
    Blank,
}

impl Outcome {
    pub fn label(self) -> &'static str {
        match self {
            Self::Correct => "Correct",
            Self::Wrong => "Wrong",
            Self::Blank => "Blank",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuestionScore {
    pub question: String,
    pub student_answer: Option<String>,
    pub correct_answer: String,
    pub outcome: Outcome,
    pub points_possible: f64,
    pub points_awarded: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub questions: Vec<QuestionScore>,
    pub correct: usize,
    pub wrong: usize,
    pub blank: usize,
    pub score: f64,
    pub max_score: f64,
}

impl ScoreBreakdown {
    pub fn total_questions(&self) -> usize {
        self.questions.len()
    }

    pub fn outcome_of(&self, question: &str) -> Option<Outcome> {
        self.questions
            .iter()
            .find(|q| q.question == question)
            .map(|q| q.outcome)
    }
}

pub fn round_to(value: f64, decimals: u32) -> f64 {
    let f = 10f64.powi(decimals as i32);
    (value * f).round() / f
}

/// Compare ids so that embedded numbers sort by value: `q2 < q10`.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let (mut a, mut b) = (a, b);
    loop {
        match (a.is_empty(), b.is_empty()) {
            (true, true) => return Ordering::Equal,
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            _ => {}
        }
        let a_digit = a.starts_with(|c: char| c.is_ascii_digit());
        let b_digit = b.starts_with(|c: char| c.is_ascii_digit());
        let split = |s: &str, digits: bool| {
            s.find(|c: char| c.is_ascii_digit() != digits)
                .unwrap_or(s.len())
        };
        let ia = split(a, a_digit);
        let ib = split(b, b_digit);
        let (ca, cb) = (&a[..ia], &b[..ib]);

        let ord = if a_digit && b_digit {
            let (ta, tb) = (ca.trim_start_matches('0'), cb.trim_start_matches('0'));
            ta.len().cmp(&tb.len()).then_with(|| ta.cmp(tb)).then_with(|| ca.len().cmp(&cb.len()))
        } else {
            ca.cmp(cb)
        };
        if ord != Ordering::Equal {
            return ord;
        }
        a = &a[ia..];
        b = &b[ib..];
    }
}

fn normalized(answer: &str) -> String {
    answer.trim().to_uppercase()
}

/// Grade `answers` against one form key.
///
/// Only questions present in the key are graded. Keys with an empty correct
/// answer are skipped. A question without explicit points is worth
/// `total_points / questions`.
#[cfg_attr(
    feature = "tracing",
    instrument(level = "debug", skip_all, fields(questions = key.answers.len()))
)]
pub fn score_answers(
    answers: &BTreeMap<String, String>,
    key: &FormKey,
    rules: &ScoringRules,
) -> ScoreBreakdown {
    let mut graded: Vec<(&String, &String)> = key
        .answers
        .iter()
        .filter(|(_, correct)| !correct.trim().is_empty())
        .collect();
    graded.sort_by(|a, b| natural_cmp(a.0, b.0));

    let even_share = if graded.is_empty() {
        0.0
    } else {
        rules.total_points / graded.len() as f64
    };

    let mut out = ScoreBreakdown::default();
    let mut score = 0.0;
    let mut max_score = 0.0;
    for (question, correct) in graded {
        let possible = key.points.get(question).copied().unwrap_or(even_share);
        let student = answers
            .get(question)
            .map(|a| a.trim())
            .filter(|a| !a.is_empty());
        let outcome = match student {
            None => Outcome::Blank,
            Some(a) if normalized(a) == normalized(correct) => Outcome::Correct,
            Some(_) => Outcome::Wrong,
        };
        let awarded = if outcome == Outcome::Correct { possible } else { 0.0 };
        match outcome {
            Outcome::Correct => out.correct += 1,
            Outcome::Wrong => out.wrong += 1,
            Outcome::Blank => out.blank += 1,
        }
        score += awarded;
        max_score += possible;
        out.questions.push(QuestionScore {
            question: question.clone(),
            student_answer: student.map(str::to_string),
            correct_answer: correct.trim().to_string(),
            outcome,
            points_possible: round_to(possible, rules.decimals),
            points_awarded: round_to(awarded, rules.decimals),
        });
    }
    out.score = round_to(score, rules.decimals);
    out.max_score = round_to(max_score, rules.decimals);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn key(pairs: &[(&str, &str)]) -> FormKey {
        FormKey {
            answers: pairs
                .iter()
                .map(|(q, a)| (q.to_string(), a.to_string()))
                .collect(),
            points: BTreeMap::new(),
        }
    }

    fn answers(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(q, a)| (q.to_string(), a.to_string()))
            .collect()
    }

    #[test]
    fn natural_ordering() {
        let mut ids = vec!["10", "2", "q10", "q9", "1", "q1_b", "02"];
        ids.sort_by(|a, b| natural_cmp(a, b));
        assert_eq!(ids, vec!["1", "2", "02", "10", "q1_b", "q9", "q10"]);
    }

    #[test]
    fn even_split_with_blank_and_case_insensitive_match() {
        let k = key(&[("1", "A"), ("2", "B"), ("3", "C"), ("4", "D")]);
        let a = answers(&[("1", " a "), ("2", "C"), ("4", "")]);
        let s = score_answers(&a, &k, &ScoringRules::default());

        assert_eq!((s.correct, s.wrong, s.blank), (1, 1, 2));
        assert_relative_eq!(s.score, 2.5);
        assert_relative_eq!(s.max_score, 10.0);
        assert_eq!(s.outcome_of("3"), Some(Outcome::Blank));
        assert_eq!(s.outcome_of("4"), Some(Outcome::Blank));
        assert_eq!(s.questions[0].student_answer.as_deref(), Some("a"));
    }

    #[test]
    fn partial_point_map_falls_back_to_even_share() {
        let mut k = key(&[("1", "A"), ("2", "B"), ("3", "C")]);
        k.points.insert("1".into(), 5.0);
        let a = answers(&[("1", "A"), ("2", "B"), ("3", "C")]);
        let s = score_answers(&a, &k, &ScoringRules { total_points: 9.0, decimals: 2 });
        assert_relative_eq!(s.questions[0].points_possible, 5.0);
        assert_relative_eq!(s.questions[1].points_possible, 3.0);
        assert_relative_eq!(s.score, 11.0);
    }

    #[test]
    fn aggregates_are_rounded() {
        let k = key(&[("1", "A"), ("2", "B"), ("3", "C")]);
        let a = answers(&[("1", "A")]);
        let s = score_answers(&a, &k, &ScoringRules::default());
        assert_relative_eq!(s.score, 3.33);
        assert_relative_eq!(s.max_score, 10.0);
    }

    #[test]
    fn extra_student_answers_are_ignored_and_empty_key_entries_skipped() {
        let k = key(&[("1", "A"), ("2", " ")]);
        let a = answers(&[("1", "B"), ("99", "A")]);
        let s = score_answers(&a, &k, &ScoringRules::default());
        assert_eq!(s.total_questions(), 1);
        assert_eq!(s.outcome_of("1"), Some(Outcome::Wrong));
        assert_relative_eq!(s.score, 0.0);
    }
}

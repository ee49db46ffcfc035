use std::fs::File;
use std::io::Write;
use std::path::Path;

use crate::error::ScoringResult;
use crate::scoring::ScoreBreakdown;

pub const CSV_HEADER: [&str; 4] = ["Question", "StudentAnswer", "CorrectAnswer", "Result"];

/// One row per graded question followed by a `Total` row with the score.
pub fn write_csv<W: Write>(breakdown: &ScoreBreakdown, writer: W) -> ScoringResult<()> {
    let mut wtr = csv::Writer::from_writer(writer);
    wtr.write_record(CSV_HEADER)?;
    for q in &breakdown.questions {
        wtr.write_record([
            q.question.as_str(),
            q.student_answer.as_deref().unwrap_or(""),
            q.correct_answer.as_str(),
            q.outcome.label(),
        ])?;
    }
    let total = format!("{}/{}", breakdown.score, breakdown.max_score);
    wtr.write_record(["Total", "", "", total.as_str()])?;
    wtr.flush()?;
    Ok(())
}

pub fn write_csv_path(breakdown: &ScoreBreakdown, path: impl AsRef<Path>) -> ScoringResult<()> {
    write_csv(breakdown, File::create(path)?)
}

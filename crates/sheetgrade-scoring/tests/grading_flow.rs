use std::collections::BTreeMap;
use std::fs;

use approx::assert_relative_eq;
use sheetgrade_scoring::{
    match_student, score_answers, validate_code, write_csv_path, AnswerGrouper, AnswerKey,
    CodeField, Outcome, ScoringError, ScoringRules, StudentDirectory,
};

fn recognized() -> BTreeMap<String, String> {
    [
        ("sbd_1", "1"),
        ("sbd_2", "2"),
        ("sbd_3", "3"),
        ("sbd_4", "4"),
        ("sbd_5", "5"),
        ("sbd_6", "6"),
        ("made_1", "1"),
        ("made_2", "0"),
        ("made_3", "2"),
        ("1", "A"),
        ("2", "C"),
        ("3", "AB"),
        ("4_col1", "1"),
        ("4_col2", "5"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

#[test]
fn recognized_sheet_is_graded_and_exported() {
    let dir = tempfile::tempdir().expect("tempdir");
    let key_path = dir.path().join("key.json");
    fs::write(
        &key_path,
        r#"{"forms": {"102": {"answers": {"1": "A", "2": "B", "3": "A", "4": "15", "5": "D"}}}}"#,
    )
    .expect("write key");
    let students_path = dir.path().join("students.json");
    fs::write(
        &students_path,
        r#"[{"id": 7, "school_code": "HS123456", "name": "Lan", "class_id": "12A1"},
            {"id": 8, "school_code": "HS654321", "name": "Minh", "class_id": "12A2"}]"#,
    )
    .expect("write students");

    let answers = recognized();
    let grouper = AnswerGrouper::default();
    let student_number = grouper.extract_code(&answers, "sbd");
    let exam_code = grouper.extract_code(&answers, "made");
    assert_eq!(student_number, "123456");
    assert_eq!(exam_code, "102");
    assert!(validate_code(CodeField::StudentNumber, &student_number, Some(6)).is_ok());
    assert!(validate_code(CodeField::ExamCode, &exam_code, None).is_ok());

    let key = AnswerKey::load(&key_path).expect("key");
    let grouped = grouper.group(&answers);
    let breakdown = score_answers(
        &grouped,
        key.for_form(&exam_code).expect("form"),
        &ScoringRules::default(),
    );
    assert_eq!((breakdown.correct, breakdown.wrong, breakdown.blank), (2, 2, 1));
    assert_eq!(breakdown.outcome_of("4"), Some(Outcome::Correct));
    assert_eq!(breakdown.outcome_of("3"), Some(Outcome::Wrong));
    assert_relative_eq!(breakdown.score, 4.0);

    let students = StudentDirectory::load(&students_path).expect("students");
    let classes = vec!["12A1".to_string()];
    let matched = match_student(&student_number, students.enrolled_in(&classes), 6).expect("match");
    assert_eq!(matched.student.name, "Lan");

    let csv_path = dir.path().join("result.csv");
    write_csv_path(&breakdown, &csv_path).expect("csv");
    let text = fs::read_to_string(&csv_path).expect("read csv");
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 1 + 5 + 1);
    assert_eq!(lines[4], "4,15,15,Correct");
    assert_eq!(lines[6], "Total,,,4/10");
}

#[test]
fn unknown_form_and_file_types_are_errors() {
    let dir = tempfile::tempdir().expect("tempdir");
    let key_path = dir.path().join("key.csv");
    fs::write(&key_path, "form,question,answer\n101,1,A\n").expect("write");
    let key = AnswerKey::load(&key_path).expect("key");
    assert!(matches!(key.for_form("102"), Err(ScoringError::NoKeyForForm(_))));

    let xlsx = dir.path().join("key.xlsx");
    fs::write(&xlsx, b"PK").expect("write");
    assert!(matches!(AnswerKey::load(&xlsx), Err(ScoringError::UnsupportedFormat(_))));
    assert!(matches!(AnswerKey::load(dir.path().join("missing.json")), Err(ScoringError::Io(_))));
}

mod common;

use std::sync::Arc;
use std::time::Duration;

use approx::assert_relative_eq;
use image::{DynamicImage, Rgb, RgbImage};
use sheetgrade::align::{AlignConfig, AlignmentPreprocessor};
use sheetgrade::scoring::{CodeField, Outcome, RecognitionFailure, ScoringError};
use sheetgrade::{SheetError, Status, StatusEvent, CORRECT_COLOR, WRONG_COLOR};

use common::*;

fn grade(
    pipeline: &sheetgrade::GradingPipeline,
    img: RgbImage,
) -> (Result<sheetgrade::GradedSheet, SheetError>, Vec<StatusEvent>) {
    let mut events = Vec::new();
    let mut sink = |e: StatusEvent| events.push(e);
    let res = pipeline.grade(
        &DynamicImage::ImageRgb8(img),
        "sheet.png",
        pipeline.exam(),
        &mut sink,
    );
    (res, events)
}

fn statuses(events: &[StatusEvent]) -> Vec<Status> {
    events.iter().map(|e| e.status).collect()
}

#[test]
fn sheet_is_recognized_scored_and_matched() {
    let pipeline = pipeline();
    let (res, events) = grade(&pipeline, graded_sheet(pipeline.template()));
    let sheet = res.expect("graded");
    let r = &sheet.result;

    assert_eq!(r.sbd, "123456");
    assert_eq!(r.ma_de, "102");
    assert_eq!(r.answers.get("1").map(String::as_str), Some("A"));
    assert_eq!(r.answers.get("5").map(String::as_str), Some("AB"));
    assert!(!r.answers.contains_key("4"));
    assert_eq!(r.multi_marked, vec!["5".to_string()]);
    assert!(!r.alignment.aligned);

    let score = r.score.as_ref().expect("score");
    assert_eq!((score.correct, score.wrong, score.blank), (2, 2, 1));
    assert_eq!(score.outcome_of("3"), Some(Outcome::Wrong));
    assert_relative_eq!(score.score, 4.0);
    assert_relative_eq!(score.max_score, 10.0);

    let student = r.student.as_ref().expect("student");
    assert_eq!(student.student.id, 7);
    assert!(!student.is_ambiguous());

    assert_eq!(
        statuses(&events),
        vec![
            Status::Processing,
            Status::Warning,
            Status::RecognitionSuccess,
            Status::Matching,
        ]
    );
    assert_eq!(events[2].details["sbd"], "123456");
    assert_eq!(r.warnings.len(), 1);

    // q1 choice A at (200, 20) is right, q3 choice D at (272, 68) is wrong
    assert_eq!(*sheet.annotated.get_pixel(200, 20), CORRECT_COLOR);
    assert_eq!(*sheet.annotated.get_pixel(272, 68), WRONG_COLOR);
    assert_eq!(sheet.annotated.dimensions(), PAGE);

    let done = sheetgrade::complete_event(&sheet);
    assert_eq!(done.status, Status::Complete);
    assert_eq!(done.details["ma_de"], "102");
}

#[test]
fn grading_is_deterministic() {
    let pipeline = pipeline();
    let img = graded_sheet(pipeline.template());
    let (a, _) = grade(&pipeline, img.clone());
    let (b, _) = grade(&pipeline, img);
    let (a, b) = (a.expect("a"), b.expect("b"));
    assert_eq!(a.result.answers, b.result.answers);
    assert_eq!(a.result.score, b.result.score);
    assert_eq!(a.annotated, b.annotated);
}

#[test]
fn missing_student_number_stops_the_sheet() {
    let pipeline = pipeline();
    let img = sheet(pipeline.template(), &marks("", "102", &[("1", "A")]));
    let (res, events) = grade(&pipeline, img);
    assert!(matches!(
        res,
        Err(SheetError::Recognition(RecognitionFailure::Missing {
            field: CodeField::StudentNumber
        }))
    ));
    assert_eq!(statuses(&events), vec![Status::Processing, Status::RecognitionFailed]);
}

#[test]
fn partially_bubbled_code_is_rejected() {
    let pipeline = pipeline();
    let img = sheet(pipeline.template(), &marks("12345", "102", &[]));
    let (res, _) = grade(&pipeline, img);
    match res {
        Err(SheetError::Recognition(RecognitionFailure::WrongLength { len, expected, .. })) => {
            assert_eq!((len, expected), (5, 6));
        }
        other => panic!("unexpected {:?}", other.map(|s| s.result)),
    }
}

#[test]
fn unknown_exam_code_is_a_scoring_error() {
    let pipeline = pipeline();
    let img = sheet(pipeline.template(), &marks("123456", "999", &[("1", "A")]));
    let (res, events) = grade(&pipeline, img);
    assert!(matches!(
        res,
        Err(SheetError::Scoring(ScoringError::NoKeyForForm(ref code))) if code == "999"
    ));
    assert_eq!(events.last().map(|e| e.status), Some(Status::Error));
}

#[test]
fn unmatched_student_is_only_a_warning() {
    let pipeline = pipeline();
    let img = sheet(pipeline.template(), &marks("000000", "102", &[("1", "A")]));
    let (res, events) = grade(&pipeline, img);
    let sheet = res.expect("graded");
    assert!(sheet.result.student.is_none());
    assert_eq!(events.last().map(|e| e.status), Some(Status::Warning));
    assert!(sheet.result.warnings[0].contains("000000"));
}

#[test]
fn exhausted_deadline_fails_before_alignment() {
    let pipeline = pipeline().with_deadline(Duration::ZERO);
    let (res, events) = grade(&pipeline, graded_sheet(pipeline.template()));
    assert!(matches!(
        res,
        Err(SheetError::DeadlineExceeded {
            stage: "alignment",
            ..
        })
    ));
    assert_eq!(events.last().map(|e| e.status), Some(Status::Error));
}

#[test]
fn failed_alignment_falls_back_to_the_unaligned_page() {
    let mut rng = fastrand::Rng::with_seed(7);
    let cells: Vec<u8> = (0..40 * 33).map(|_| rng.u8(..)).collect();
    let reference = RgbImage::from_fn(PAGE.0, PAGE.1, |x, y| {
        let v = cells[((y / 8) * 40 + x / 8) as usize];
        Rgb([v, v, v])
    });
    let aligner = AlignmentPreprocessor::new(&reference, PAGE, AlignConfig::default()).expect("reference");
    let pipeline = pipeline().with_aligner(Arc::new(aligner));
    assert!(pipeline.is_aligning());

    // a featureless capture: alignment fails, recognition then finds no codes
    let blank = RgbImage::from_pixel(PAGE.0, PAGE.1, Rgb([240, 240, 236]));
    let (res, events) = grade(&pipeline, blank);
    assert!(matches!(res, Err(SheetError::Recognition(_))));
    assert_eq!(
        statuses(&events),
        vec![
            Status::Processing,
            Status::Aligning,
            Status::Warning,
            Status::RecognitionFailed,
        ]
    );
    assert!(events[2].message.contains("alignment failed"));
}

#[test]
fn corrupt_file_is_a_decode_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("broken.png");
    std::fs::write(&path, b"definitely not a png").expect("write");
    let pipeline = pipeline();
    let mut events = Vec::new();
    let mut sink = |e: StatusEvent| events.push(e);
    let res = pipeline.grade_path(&path, &mut sink);
    assert!(matches!(res, Err(SheetError::Decode(_))));
    assert_eq!(statuses(&events), vec![Status::Error]);

    let missing = pipeline.grade_path(&dir.path().join("nope.png"), &mut |_e: StatusEvent| {});
    assert!(matches!(missing, Err(SheetError::Read { .. })));
}

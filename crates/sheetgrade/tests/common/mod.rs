//! Synthetic sheets shared by the integration tests.
#![allow(dead_code)]

use std::io::Cursor;
use std::sync::Arc;

use image::{ImageFormat, Rgb, RgbImage};
use sheetgrade::classify::{BubbleClassifier, BubbleDetector, ClassifierConfig, DarknessDetector};
use sheetgrade::core::Template;
use sheetgrade::scoring::{AnswerKey, StudentDirectory};
use sheetgrade::{ExamContext, GradingPipeline};

pub const PAGE: (u32, u32) = (320, 260);

/// Six student-number columns, three exam-code columns and five MCQ4
/// questions.
pub const TEMPLATE: &str = r#"{
    "pageDimensions": [320, 260],
    "bubbleDimensions": [14, 14],
    "fieldBlocks": {
        "student": {
            "fieldType": "QTYPE_INT",
            "origin": [20, 20],
            "fieldLabels": ["sbd_1..6"],
            "bubblesGap": 18,
            "labelsGap": 18
        },
        "exam": {
            "fieldType": "QTYPE_INT",
            "origin": [140, 20],
            "fieldLabels": ["made_1..3"],
            "bubblesGap": 18,
            "labelsGap": 18
        },
        "answers": {
            "fieldType": "QTYPE_MCQ4",
            "origin": [200, 20],
            "fieldLabels": ["1..5"],
            "bubblesGap": 24,
            "labelsGap": 24
        }
    }
}"#;

pub const KEY: &str =
    r#"{"forms": {"102": {"answers": {"1": "A", "2": "B", "3": "C", "4": "D", "5": "A"}}}}"#;

pub const STUDENTS: &str = r#"[
    {"id": 7, "school_code": "HS123456", "name": "Lan", "class_id": "12A1"},
    {"id": 8, "school_code": "HS654321", "name": "Minh", "class_id": "12A2"}
]"#;

pub fn template() -> Template {
    Template::from_json_str(TEMPLATE).expect("template")
}

/// Marks for a student number, an exam code and question answers.
pub fn marks(sbd: &str, made: &str, answers: &[(&str, &str)]) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for (i, d) in sbd.chars().enumerate() {
        out.push((format!("sbd_{}", i + 1), d.to_string()));
    }
    for (i, d) in made.chars().enumerate() {
        out.push((format!("made_{}", i + 1), d.to_string()));
    }
    for (q, c) in answers {
        for choice in c.chars() {
            out.push((q.to_string(), choice.to_string()));
        }
    }
    out
}

/// Page-sized sheet with the given bubbles inked.
pub fn sheet(template: &Template, marks: &[(String, String)]) -> RgbImage {
    let mut img = RgbImage::from_pixel(PAGE.0, PAGE.1, Rgb([240, 240, 236]));
    for b in template.bubbles() {
        if marks.iter().any(|(q, c)| *q == b.qid && *c == b.choice) {
            for y in b.y as u32 + 2..(b.y + b.height) as u32 - 2 {
                for x in b.x as u32 + 2..(b.x + b.width) as u32 - 2 {
                    img.put_pixel(x, y, Rgb([20, 20, 30]));
                }
            }
        }
    }
    img
}

/// The standard test sheet: student 123456, form 102, q3 wrong, q4 blank,
/// q5 double-marked.
pub fn graded_sheet(template: &Template) -> RgbImage {
    sheet(
        template,
        &marks("123456", "102", &[("1", "A"), ("2", "B"), ("3", "D"), ("5", "AB")]),
    )
}

pub fn png_bytes(img: &RgbImage) -> Vec<u8> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .expect("png");
    buf
}

pub fn exam() -> ExamContext {
    ExamContext {
        answer_key: Some(Arc::new(AnswerKey::from_json_str(KEY).expect("key"))),
        students: Some(Arc::new(
            serde_json::from_str::<StudentDirectory>(STUDENTS).expect("students"),
        )),
        classes: Vec::new(),
    }
}

pub fn pipeline_with(detector: Arc<dyn BubbleDetector>) -> GradingPipeline {
    let classifier = BubbleClassifier::new(detector, ClassifierConfig::default());
    GradingPipeline::new(Arc::new(template()), classifier).with_exam(exam())
}

pub fn pipeline() -> GradingPipeline {
    pipeline_with(Arc::new(DarknessDetector::default()))
}

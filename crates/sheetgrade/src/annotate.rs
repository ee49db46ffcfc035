//! Result overlay: a box around every filled bubble.

use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use sheetgrade_classify::FilledBubble;
use sheetgrade_scoring::{AnswerGrouper, Outcome, ScoreBreakdown};

pub const CORRECT_COLOR: Rgb<u8> = Rgb([0, 200, 0]);
pub const WRONG_COLOR: Rgb<u8> = Rgb([220, 0, 0]);

/// Box width in pixels.
const STROKE: i32 = 2;

fn color_for(bubble: &FilledBubble, grouper: &AnswerGrouper, score: Option<&ScoreBreakdown>) -> Rgb<u8> {
    let question = grouper.group_key(&bubble.qid);
    match score.and_then(|s| s.outcome_of(&question)) {
        Some(Outcome::Wrong) => WRONG_COLOR,
        // correct, not in the key, or nothing to score against
        _ => CORRECT_COLOR,
    }
}

/// Copy of `page` with each filled bubble outlined: red when its question
/// was answered wrong, green otherwise.
pub fn annotate(
    page: &RgbImage,
    filled: &[FilledBubble],
    grouper: &AnswerGrouper,
    score: Option<&ScoreBreakdown>,
) -> RgbImage {
    let mut out = page.clone();
    for bubble in filled {
        let r = bubble.rect;
        if r.width == 0 || r.height == 0 {
            continue;
        }
        let color = color_for(bubble, grouper, score);
        for inset in 0..STROKE {
            let w = r.width as i32 - 2 * inset;
            let h = r.height as i32 - 2 * inset;
            if w <= 0 || h <= 0 {
                break;
            }
            let rect = Rect::at(r.x as i32 + inset, r.y as i32 + inset).of_size(w as u32, h as u32);
            draw_hollow_rect_mut(&mut out, rect, color);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use sheetgrade_core::PixelRect;
    use sheetgrade_scoring::{score_answers, FormKey, ScoringRules};
    use std::collections::BTreeMap;

    fn bubble(qid: &str, choice: &str, x: u32) -> FilledBubble {
        FilledBubble {
            qid: qid.into(),
            choice: choice.into(),
            rect: PixelRect {
                x,
                y: 10,
                width: 12,
                height: 12,
            },
            confidence: 0.9,
        }
    }

    #[test]
    fn wrong_answers_are_red_everything_else_green() {
        let page = RgbImage::from_pixel(100, 40, Rgb([255, 255, 255]));
        let filled = vec![bubble("1", "A", 10), bubble("2", "C", 40), bubble("9", "B", 70)];
        let mut key = FormKey::default();
        key.answers.insert("1".into(), "A".into());
        key.answers.insert("2".into(), "B".into());
        let answers: BTreeMap<String, String> = [("1", "A"), ("2", "C"), ("9", "B")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let score = score_answers(&answers, &key, &ScoringRules::default());
        let grouper = AnswerGrouper::default();

        let out = annotate(&page, &filled, &grouper, Some(&score));
        assert_eq!(*out.get_pixel(10, 10), CORRECT_COLOR);
        assert_eq!(*out.get_pixel(41, 11), WRONG_COLOR);
        // question 9 is not in the key
        assert_eq!(*out.get_pixel(81, 21), CORRECT_COLOR);
        // interior untouched
        assert_eq!(*out.get_pixel(16, 16), Rgb([255, 255, 255]));

        let unscored = annotate(&page, &filled, &grouper, None);
        assert_eq!(*unscored.get_pixel(40, 10), CORRECT_COLOR);
    }
}

use nalgebra::Point2;
use serde::{Deserialize, Serialize};
use sheetgrade_core::{estimate_homography, homography_from_4pt, Homography};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RansacParams {
    pub max_iterations: usize,
    /// Reprojection error, in pixels, below which a match counts as inlier.
    pub threshold_px: f32,
    pub confidence: f64,
    pub seed: u64,
}

impl Default for RansacParams {
    fn default() -> Self {
        Self {
            max_iterations: 2000,
            threshold_px: 3.0,
            confidence: 0.995,
            seed: 0x5eed,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RansacFit {
    pub homography: Homography,
    pub inliers: Vec<bool>,
    pub inlier_count: usize,
}

impl RansacFit {
    pub fn inlier_ratio(&self) -> f32 {
        if self.inliers.is_empty() {
            0.0
        } else {
            self.inlier_count as f32 / self.inliers.len() as f32
        }
    }
}

fn triangle_area2(a: Point2<f32>, b: Point2<f32>, c: Point2<f32>) -> f32 {
    ((b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x)).abs()
}

/// True when any three of the four points are (nearly) collinear.
fn degenerate(p: &[Point2<f32>; 4]) -> bool {
    const MIN_AREA2: f32 = 1.0;
    [(0, 1, 2), (0, 1, 3), (0, 2, 3), (1, 2, 3)]
        .iter()
        .any(|&(i, j, k)| triangle_area2(p[i], p[j], p[k]) < MIN_AREA2)
}

fn score(h: &Homography, src: &[Point2<f32>], dst: &[Point2<f32>], thr_sq: f32) -> (Vec<bool>, usize) {
    let mask: Vec<bool> = src
        .iter()
        .zip(dst)
        .map(|(&s, &d)| h.transfer_error_sq(s, d) < thr_sq)
        .collect();
    let count = mask.iter().filter(|&&m| m).count();
    (mask, count)
}

fn adaptive_iterations(inlier_ratio: f64, confidence: f64, cap: usize) -> usize {
    let w4 = inlier_ratio.powi(4);
    if w4 >= 1.0 - f64::EPSILON {
        return 1;
    }
    if w4 <= f64::EPSILON {
        return cap;
    }
    let k = (1.0 - confidence).ln() / (1.0 - w4).ln();
    if k.is_finite() {
        (k.ceil() as usize).clamp(1, cap)
    } else {
        cap
    }
}

/// Robust `dst ~ H * src` from putative correspondences.
///
/// Minimal four-point samples drawn with a seeded generator, so the same
/// input always yields the same model. The winning consensus set is refit
/// with the least-squares DLT. Returns `None` when no sample gets at least
/// four inliers.
pub fn ransac_homography(
    src: &[Point2<f32>],
    dst: &[Point2<f32>],
    params: &RansacParams,
) -> Option<RansacFit> {
    let n = src.len();
    if n != dst.len() || n < 4 {
        return None;
    }

    let thr_sq = params.threshold_px * params.threshold_px;
    let mut rng = fastrand::Rng::with_seed(params.seed);
    let mut best: Option<(Homography, Vec<bool>, usize)> = None;
    let mut budget = params.max_iterations.max(1);
    let mut iter = 0;

    while iter < budget {
        iter += 1;

        let mut idx = [0usize; 4];
        let mut k = 0;
        while k < 4 {
            let candidate = rng.usize(0..n);
            if !idx[..k].contains(&candidate) {
                idx[k] = candidate;
                k += 1;
            }
        }
        let s = idx.map(|i| src[i]);
        let d = idx.map(|i| dst[i]);
        if degenerate(&s) || degenerate(&d) {
            continue;
        }
        let Some(h) = homography_from_4pt(&s, &d) else {
            continue;
        };

        let (mask, count) = score(&h, src, dst, thr_sq);
        if best.as_ref().is_none_or(|(_, _, c)| count > *c) {
            budget = adaptive_iterations(count as f64 / n as f64, params.confidence, params.max_iterations.max(1));
            best = Some((h, mask, count));
        }
    }

    let (mut homography, mut inliers, mut inlier_count) = best?;
    if inlier_count < 4 {
        return None;
    }

    let (s_in, d_in): (Vec<_>, Vec<_>) = src
        .iter()
        .zip(dst)
        .zip(&inliers)
        .filter(|(_, &m)| m)
        .map(|((&s, &d), _)| (s, d))
        .unzip();
    if let Some(refit) = estimate_homography(&s_in, &d_in) {
        let (mask, count) = score(&refit, src, dst, thr_sq);
        if count >= inlier_count {
            homography = refit;
            inliers = mask;
            inlier_count = count;
        }
    }

    Some(RansacFit {
        homography,
        inliers,
        inlier_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use nalgebra::Matrix3;

    fn truth() -> Homography {
        Homography::new(Matrix3::new(
            1.02, 0.03, -12.0, //
            -0.01, 0.98, 7.5, //
            0.00005, -0.00003, 1.0,
        ))
    }

    fn grid() -> Vec<Point2<f32>> {
        (0..8)
            .flat_map(|y| (0..10).map(move |x| Point2::new(20.0 + x as f32 * 31.0, 15.0 + y as f32 * 27.0)))
            .collect()
    }

    #[test]
    fn recovers_model_despite_outliers() {
        let h = truth();
        let src = grid();
        let mut dst: Vec<Point2<f32>> = src.iter().map(|&p| h.apply(p)).collect();
        let mut rng = fastrand::Rng::with_seed(7);
        // corrupt every third correspondence
        for (i, p) in dst.iter_mut().enumerate() {
            if i % 3 == 0 {
                *p = Point2::new(rng.f32() * 300.0, rng.f32() * 200.0);
            }
        }

        let fit = ransac_homography(&src, &dst, &RansacParams::default()).expect("fit");
        let expected_inliers = src.len() - src.len().div_ceil(3);
        assert!(fit.inlier_count >= expected_inliers, "{} inliers", fit.inlier_count);
        assert!(fit.inlier_ratio() > 0.6);
        for p in [Point2::new(100.0_f32, 100.0), Point2::new(250.0, 40.0)] {
            let a = fit.homography.apply(p);
            let b = h.apply(p);
            assert_abs_diff_eq!(a.x, b.x, epsilon = 0.1);
            assert_abs_diff_eq!(a.y, b.y, epsilon = 0.1);
        }
    }

    #[test]
    fn same_seed_same_result() {
        let h = truth();
        let src = grid();
        let mut dst: Vec<Point2<f32>> = src.iter().map(|&p| h.apply(p)).collect();
        dst[3] = Point2::new(0.0, 0.0);
        let params = RansacParams::default();
        let a = ransac_homography(&src, &dst, &params).expect("fit");
        let b = ransac_homography(&src, &dst, &params).expect("fit");
        assert_eq!(a.inliers, b.inliers);
        assert_eq!(a.homography, b.homography);
        assert!(!a.inliers[3]);
    }

    #[test]
    fn too_few_or_collinear_points_fail() {
        let line: Vec<Point2<f32>> = (0..10).map(|i| Point2::new(i as f32, 2.0 * i as f32)).collect();
        assert!(ransac_homography(&line, &line, &RansacParams::default()).is_none());
        assert!(ransac_homography(&line[..3], &line[..3], &RansacParams::default()).is_none());
    }

    #[test]
    fn iteration_budget_shrinks_with_inlier_ratio() {
        assert_eq!(adaptive_iterations(1.0, 0.99, 500), 1);
        assert_eq!(adaptive_iterations(0.0, 0.99, 500), 500);
        assert!(adaptive_iterations(0.9, 0.99, 500) < adaptive_iterations(0.5, 0.99, 500));
    }
}

use crate::image::sample_bilinear_rgb;
use ::image::RgbImage;
use nalgebra::{DMatrix, Matrix3, Point2, SMatrix, SVector, Vector3};
use serde::{Deserialize, Serialize};

/// Planar projective transform, `dst ~ H * src`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Homography {
    pub h: Matrix3<f64>,
}

impl Homography {
    pub fn new(h: Matrix3<f64>) -> Self {
        Self { h }
    }

    /// Map a point, dividing out the projective scale.
    #[inline]
    pub fn apply(&self, p: Point2<f32>) -> Point2<f32> {
        let q = self.h * Vector3::new(f64::from(p.x), f64::from(p.y), 1.0);
        Point2::new((q.x / q.z) as f32, (q.y / q.z) as f32)
    }

    pub fn inverse(&self) -> Option<Self> {
        let inv = self.h.try_inverse()?;
        Some(Self::new(inv))
    }

    pub fn is_finite(&self) -> bool {
        self.h.iter().all(|v| v.is_finite())
    }

    /// Squared distance between `H * src` and `dst`.
    #[inline]
    pub fn transfer_error_sq(&self, src: Point2<f32>, dst: Point2<f32>) -> f32 {
        let p = self.apply(src);
        let (dx, dy) = (p.x - dst.x, p.y - dst.y);
        let e = dx * dx + dy * dy;
        if e.is_finite() {
            e
        } else {
            f32::INFINITY
        }
    }
}

/// Similarity that moves the centroid of `pts` to the origin and scales the
/// mean radius to sqrt(2). Returns the conditioned points and the transform.
fn condition(pts: &[Point2<f32>]) -> (Vec<[f64; 2]>, Matrix3<f64>) {
    let n = pts.len() as f64;
    let (sx, sy) = pts
        .iter()
        .fold((0.0, 0.0), |(ax, ay), p| (ax + p.x as f64, ay + p.y as f64));
    let (cx, cy) = (sx / n, sy / n);
    let radius = pts
        .iter()
        .map(|p| (p.x as f64 - cx).hypot(p.y as f64 - cy))
        .sum::<f64>()
        / n;
    let k = if radius > 1e-12 {
        std::f64::consts::SQRT_2 / radius
    } else {
        1.0
    };

    let conditioned = pts
        .iter()
        .map(|p| [k * (p.x as f64 - cx), k * (p.y as f64 - cy)])
        .collect();
    let t = Matrix3::new(k, 0.0, -k * cx, 0.0, k, -k * cy, 0.0, 0.0, 1.0);
    (conditioned, t)
}

/// Undo the conditioning and scale so `h[2][2] == 1`.
fn decondition(
    hn: Matrix3<f64>,
    t_src: Matrix3<f64>,
    t_dst: Matrix3<f64>,
) -> Option<Homography> {
    let h = t_dst.try_inverse()? * hn * t_src;
    let w = h[(2, 2)];
    if w.abs() < 1e-12 {
        return None;
    }
    let h = Homography::new(h / w);
    h.is_finite().then_some(h)
}

/// The two DLT constraint rows contributed by one correspondence.
fn dlt_rows([x, y]: [f64; 2], [u, v]: [f64; 2]) -> [[f64; 9]; 2] {
    [
        [-x, -y, -1.0, 0.0, 0.0, 0.0, u * x, u * y, u],
        [0.0, 0.0, 0.0, -x, -y, -1.0, v * x, v * y, v],
    ]
}

/// Least-squares DLT estimate of H such that `dst ~ H * src`.
///
/// Needs at least four correspondences; exactly four uses the closed form.
pub fn estimate_homography(src: &[Point2<f32>], dst: &[Point2<f32>]) -> Option<Homography> {
    if src.len() != dst.len() || src.len() < 4 {
        return None;
    }
    if let (Ok(s), Ok(d)) = (
        <&[Point2<f32>; 4]>::try_from(src),
        <&[Point2<f32>; 4]>::try_from(dst),
    ) {
        return homography_from_4pt(s, d);
    }

    let (sn, t_src) = condition(src);
    let (dn, t_dst) = condition(dst);

    let mut a = DMatrix::<f64>::zeros(2 * src.len(), 9);
    for (i, (&s, &d)) in sn.iter().zip(&dn).enumerate() {
        for (r, row) in dlt_rows(s, d).iter().enumerate() {
            for (c, &value) in row.iter().enumerate() {
                a[(2 * i + r, c)] = value;
            }
        }
    }

    // null vector of A: last row of V^T
    let vt = a.svd(false, true).v_t?;
    let h = vt.row(vt.nrows().checked_sub(1)?);
    let hn = Matrix3::from_iterator(h.iter().copied()).transpose();

    decondition(hn, t_src, t_dst)
}

/// Closed-form H such that `dst ~ H * src` from four correspondences.
///
/// Fixes `h33 = 1` and solves the remaining 8x8 system. Corner order must be
/// consistent between `src` and `dst`.
pub fn homography_from_4pt(src: &[Point2<f32>; 4], dst: &[Point2<f32>; 4]) -> Option<Homography> {
    let (sn, t_src) = condition(src);
    let (dn, t_dst) = condition(dst);

    let mut a = SMatrix::<f64, 8, 8>::zeros();
    let mut b = SVector::<f64, 8>::zeros();
    for (i, (&s, &d)) in sn.iter().zip(&dn).enumerate() {
        // move the h33 column to the right-hand side
        for (r, row) in dlt_rows(s, d).iter().enumerate() {
            for c in 0..8 {
                a[(2 * i + r, c)] = row[c];
            }
            b[2 * i + r] = -row[8];
        }
    }

    let x = a.lu().solve(&b)?;
    let hn = Matrix3::new(x[0], x[1], x[2], x[3], x[4], x[5], x[6], x[7], 1.0);

    decondition(hn, t_src, t_dst)
}

/// Warp into the reference frame: every output pixel is mapped through
/// `h_src_from_dst` and sampled bilinearly. Uncovered pixels become white,
/// the colour of blank paper.
pub fn warp_perspective_rgb(
    src: &RgbImage,
    h_src_from_dst: Homography,
    out_w: u32,
    out_h: u32,
) -> RgbImage {
    RgbImage::from_fn(out_w, out_h, |x, y| {
        let p = h_src_from_dst.apply(Point2::new(x as f32 + 0.5, y as f32 + 0.5));
        sample_bilinear_rgb(src, p.x - 0.5, p.y - 0.5, [255; 3])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ::image::Rgb;
    use approx::assert_abs_diff_eq;

    /// A phone photo of an A4 page: slight rotation, keystone, offset.
    fn photo_of_page() -> Homography {
        Homography::new(Matrix3::new(
            0.92, -0.04, 35.0, //
            0.03, 0.88, 52.0, //
            0.00011, 0.00006, 1.0,
        ))
    }

    fn page_corners() -> [Point2<f32>; 4] {
        [
            Point2::new(0.0, 0.0),
            Point2::new(1240.0, 0.0),
            Point2::new(1240.0, 1754.0),
            Point2::new(0.0, 1754.0),
        ]
    }

    fn assert_near(a: Point2<f32>, b: Point2<f32>, tol: f32) {
        assert_abs_diff_eq!(a.x, b.x, epsilon = tol);
        assert_abs_diff_eq!(a.y, b.y, epsilon = tol);
    }

    #[test]
    fn inverse_maps_photo_back_to_page() {
        let h = photo_of_page();
        let back = h.inverse().expect("invertible");
        for p in page_corners() {
            let q = back.apply(h.apply(p));
            assert_near(q, p, 1e-2);
        }
    }

    #[test]
    fn corners_alone_recover_the_photo_transform() {
        let truth = photo_of_page();
        let page = page_corners();
        let photo = page.map(|p| truth.apply(p));
        let h = homography_from_4pt(&page, &photo).expect("solvable");
        let bubble = Point2::new(310.0, 905.0);
        assert_near(h.apply(bubble), truth.apply(bubble), 1e-2);
    }

    #[test]
    fn many_matches_recover_the_photo_transform() {
        let truth = photo_of_page();
        let page: Vec<Point2<f32>> = (0..4)
            .flat_map(|row| (0..5).map(move |col| Point2::new(col as f32 * 300.0, row as f32 * 550.0)))
            .collect();
        let photo: Vec<Point2<f32>> = page.iter().map(|&p| truth.apply(p)).collect();

        let h = estimate_homography(&page, &photo).expect("estimate");
        let bubble = Point2::new(610.0, 1200.0);
        assert_near(h.apply(bubble), truth.apply(bubble), 0.05);
        assert!(h.transfer_error_sq(page[7], photo[7]) < 1e-3);
    }

    #[test]
    fn too_few_or_unpaired_points_are_rejected() {
        let corners = page_corners();
        assert!(estimate_homography(&corners[..3], &corners[..3]).is_none());
        assert!(estimate_homography(&corners, &corners[..3]).is_none());
        assert!(estimate_homography(&corners, &corners).is_some());
    }

    #[test]
    fn warp_fills_uncovered_area_with_paper_white() {
        let mut photo = RgbImage::from_pixel(30, 30, Rgb([255, 255, 255]));
        photo.put_pixel(15, 9, Rgb([0, 0, 0]));
        // page (x, y) reads photo (x + 5, y + 4)
        let h = Homography::new(Matrix3::new(1.0, 0.0, 5.0, 0.0, 1.0, 4.0, 0.0, 0.0, 1.0));
        let page = warp_perspective_rgb(&photo, h, 30, 30);
        assert_eq!(page.get_pixel(10, 5).0, [0, 0, 0]);
        assert_eq!(page.get_pixel(28, 28).0, [255, 255, 255]);
    }
}

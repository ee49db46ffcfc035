//! Keypoints and descriptors.
//!
//! Keypoints come from FAST-9 on a lightly blurred gray image, thinned by a
//! grid non-maximum suppression. Descriptors are either 256-bit binary
//! intensity tests (compared with Hamming distance) or a normalised patch
//! vector (compared with L2 distance).

use image::GrayImage;
use imageproc::corners::corners_fast9;
use imageproc::filter::gaussian_blur_f32;
use nalgebra::Point2;
use serde::{Deserialize, Serialize};

/// Half-size of the square patch every descriptor reads.
pub const PATCH_RADIUS: i32 = 12;

const BINARY_TESTS: usize = 256;
const BINARY_WORDS: usize = BINARY_TESTS / 64;
const PATTERN_SEED: u64 = 0x0b5e_55ed;

const FLOAT_CELLS: i32 = 6;
const FLOAT_CELL_SIZE: i32 = 4;

/// Detector/descriptor preset requested by the template.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FeatureType {
    #[default]
    #[serde(alias = "orb")]
    Orb,
    #[serde(alias = "sift")]
    Sift,
    #[serde(alias = "akaze")]
    Akaze,
}

impl FeatureType {
    /// Case-insensitive parse of `ORB`, `SIFT` or `AKAZE`.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "ORB" => Some(Self::Orb),
            "SIFT" => Some(Self::Sift),
            "AKAZE" => Some(Self::Akaze),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Orb => "ORB",
            Self::Sift => "SIFT",
            Self::Akaze => "AKAZE",
        }
    }

    /// Extraction parameters for this preset.
    pub fn params(self, max_features: usize) -> ExtractorParams {
        match self {
            Self::Orb => ExtractorParams {
                blur_sigma: 1.2,
                fast_threshold: 20,
                nms_cell: 4,
                max_features,
                descriptor: DescriptorKind::Binary,
            },
            Self::Akaze => ExtractorParams {
                blur_sigma: 2.0,
                fast_threshold: 12,
                nms_cell: 6,
                max_features,
                descriptor: DescriptorKind::Binary,
            },
            Self::Sift => ExtractorParams {
                blur_sigma: 1.0,
                fast_threshold: 15,
                nms_cell: 4,
                max_features,
                descriptor: DescriptorKind::Float,
            },
        }
    }
}

impl std::fmt::Display for FeatureType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescriptorKind {
    Binary,
    Float,
}

#[derive(Clone, Debug)]
pub struct ExtractorParams {
    pub blur_sigma: f32,
    pub fast_threshold: u8,
    /// Side of the suppression grid cell, in pixels.
    pub nms_cell: u32,
    pub max_features: usize,
    pub descriptor: DescriptorKind,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Keypoint {
    pub position: Point2<f32>,
    pub score: f32,
}

#[derive(Clone, Debug)]
pub enum Descriptors {
    Binary(Vec<[u64; BINARY_WORDS]>),
    Float(Vec<Vec<f32>>),
}

impl Descriptors {
    pub fn len(&self) -> usize {
        match self {
            Self::Binary(d) => d.len(),
            Self::Float(d) => d.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keypoints with one descriptor each, index-aligned.
#[derive(Clone, Debug)]
pub struct Features {
    pub keypoints: Vec<Keypoint>,
    pub descriptors: Descriptors,
}

impl Features {
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }

    pub fn positions(&self) -> impl Iterator<Item = Point2<f32>> + '_ {
        self.keypoints.iter().map(|k| k.position)
    }
}

/// Anything that turns a gray image into matchable features.
///
/// Implementations are shared between worker threads, so `extract` must not
/// need exclusive access.
pub trait FeatureExtractor: Send + Sync {
    fn extract(&self, gray: &GrayImage) -> Features;
}

/// FAST keypoints plus either binary tests or a patch vector.
#[derive(Clone, Debug)]
pub struct FastExtractor {
    params: ExtractorParams,
    pattern: Vec<[(i32, i32); 2]>,
}

impl FastExtractor {
    pub fn new(params: ExtractorParams) -> Self {
        Self {
            params,
            pattern: sampling_pattern(),
        }
    }

    pub fn for_type(feature_type: FeatureType, max_features: usize) -> Self {
        Self::new(feature_type.params(max_features))
    }

    pub fn params(&self) -> &ExtractorParams {
        &self.params
    }

    fn detect(&self, smooth: &GrayImage) -> Vec<Keypoint> {
        let (w, h) = smooth.dimensions();
        let margin = PATCH_RADIUS as u32 + 1;
        if w <= 2 * margin || h <= 2 * margin {
            return Vec::new();
        }

        let mut corners: Vec<_> = corners_fast9(smooth, self.params.fast_threshold)
            .into_iter()
            .filter(|c| c.x >= margin && c.y >= margin && c.x < w - margin && c.y < h - margin)
            .collect();
        corners.sort_by(|a, b| b.score.total_cmp(&a.score));

        // strongest corner per grid cell
        let cell = self.params.nms_cell.max(1);
        let grid_w = w.div_ceil(cell) as usize;
        let mut taken = vec![false; grid_w * h.div_ceil(cell) as usize];
        let mut out = Vec::with_capacity(self.params.max_features.min(corners.len()));
        for c in corners {
            let idx = (c.y / cell) as usize * grid_w + (c.x / cell) as usize;
            if taken[idx] {
                continue;
            }
            taken[idx] = true;
            out.push(Keypoint {
                position: Point2::new(c.x as f32, c.y as f32),
                score: c.score,
            });
            if out.len() >= self.params.max_features {
                break;
            }
        }
        out
    }
}

impl FeatureExtractor for FastExtractor {
    fn extract(&self, gray: &GrayImage) -> Features {
        let smooth = if self.params.blur_sigma > 0.0 {
            gaussian_blur_f32(gray, self.params.blur_sigma)
        } else {
            gray.clone()
        };
        let keypoints = self.detect(&smooth);
        let descriptors = match self.params.descriptor {
            DescriptorKind::Binary => Descriptors::Binary(
                keypoints
                    .iter()
                    .map(|k| binary_descriptor(&smooth, k.position, &self.pattern))
                    .collect(),
            ),
            DescriptorKind::Float => Descriptors::Float(
                keypoints
                    .iter()
                    .map(|k| patch_descriptor(&smooth, k.position))
                    .collect(),
            ),
        };
        Features {
            keypoints,
            descriptors,
        }
    }
}

/// Fixed pseudo-random pairs inside the patch; the same seed on both sides
/// keeps reference and query descriptors comparable.
fn sampling_pattern() -> Vec<[(i32, i32); 2]> {
    let mut rng = fastrand::Rng::with_seed(PATTERN_SEED);
    let r = PATCH_RADIUS;
    (0..BINARY_TESTS)
        .map(|_| {
            [
                (rng.i32(-r..=r), rng.i32(-r..=r)),
                (rng.i32(-r..=r), rng.i32(-r..=r)),
            ]
        })
        .collect()
}

#[inline]
fn pixel(img: &GrayImage, x: i32, y: i32) -> u8 {
    let cx = x.clamp(0, img.width() as i32 - 1) as u32;
    let cy = y.clamp(0, img.height() as i32 - 1) as u32;
    img.get_pixel(cx, cy)[0]
}

fn binary_descriptor(
    img: &GrayImage,
    at: Point2<f32>,
    pattern: &[[(i32, i32); 2]],
) -> [u64; BINARY_WORDS] {
    let (cx, cy) = (at.x as i32, at.y as i32);
    let mut bits = [0u64; BINARY_WORDS];
    for (i, [(ax, ay), (bx, by)]) in pattern.iter().enumerate() {
        if pixel(img, cx + ax, cy + ay) < pixel(img, cx + bx, cy + by) {
            bits[i / 64] |= 1 << (i % 64);
        }
    }
    bits
}

/// Cell means over a square patch, zero-mean and unit length so uniform
/// brightness changes do not move the descriptor.
fn patch_descriptor(img: &GrayImage, at: Point2<f32>) -> Vec<f32> {
    let (cx, cy) = (at.x as i32, at.y as i32);
    let half = FLOAT_CELLS * FLOAT_CELL_SIZE / 2;
    let mut out = Vec::with_capacity((FLOAT_CELLS * FLOAT_CELLS) as usize);
    for gy in 0..FLOAT_CELLS {
        for gx in 0..FLOAT_CELLS {
            let x0 = cx - half + gx * FLOAT_CELL_SIZE;
            let y0 = cy - half + gy * FLOAT_CELL_SIZE;
            let mut sum = 0u32;
            for y in y0..y0 + FLOAT_CELL_SIZE {
                for x in x0..x0 + FLOAT_CELL_SIZE {
                    sum += u32::from(pixel(img, x, y));
                }
            }
            out.push(sum as f32 / (FLOAT_CELL_SIZE * FLOAT_CELL_SIZE) as f32);
        }
    }

    let mean = out.iter().sum::<f32>() / out.len() as f32;
    out.iter_mut().for_each(|v| *v -= mean);
    let norm = out.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 1e-6 {
        out.iter_mut().for_each(|v| *v /= norm);
    }
    out
}

#[inline]
pub fn hamming(a: &[u64; BINARY_WORDS], b: &[u64; BINARY_WORDS]) -> u32 {
    a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum()
}

#[inline]
pub fn l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

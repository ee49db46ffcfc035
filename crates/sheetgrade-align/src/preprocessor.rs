use std::path::{Path, PathBuf};

use image::{GrayImage, Rgb, RgbImage};
use imageproc::drawing::{draw_cross_mut, draw_line_segment_mut};
use log::debug;
use nalgebra::Point2;
use serde::{Deserialize, Serialize};
use sheetgrade_core::{resize_rgb, to_gray, warp_perspective_rgb, Homography};

#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::features::{FastExtractor, FeatureExtractor, FeatureType, Features};
use crate::matching::{keep_best, match_features};
use crate::ransac::{ransac_homography, RansacParams};

/// Alignment settings. Field names follow the template's
/// `FeatureBasedAlignment` options so the same JSON block deserializes here.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AlignConfig {
    /// Reference image, relative to the template directory.
    pub reference: Option<PathBuf>,
    pub feature_type: FeatureType,
    pub max_features: usize,
    /// Fraction of matches, best first, fed to RANSAC.
    pub good_match_percent: f32,
    /// Resize the reference to the page frame before detection. When off,
    /// detection runs at native size and keypoints are scaled afterwards.
    pub resize_template: bool,
    pub min_keypoints: usize,
    pub min_inliers: usize,
    pub ransac: RansacParams,
    /// Render a side-by-side keypoint/match image with every alignment.
    pub debug: bool,
}

impl Default for AlignConfig {
    fn default() -> Self {
        Self {
            reference: None,
            feature_type: FeatureType::Orb,
            max_features: 500,
            good_match_percent: 0.20,
            resize_template: true,
            min_keypoints: 10,
            min_inliers: 6,
            ransac: RansacParams::default(),
            debug: false,
        }
    }
}

impl AlignConfig {
    /// Read the options object of a template pre-processor entry.
    pub fn from_options(options: &serde_json::Value) -> Result<Self, AlignmentError> {
        if options.is_null() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_value(options.clone())?)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum AlignmentError {
    #[error("too few keypoints in input: found {found}, need {required}")]
    TooFewKeypoints { found: usize, required: usize },
    #[error("too few keypoints in reference image: found {found}, need {required}")]
    FeaturelessReference { found: usize, required: usize },
    #[error("too few matches: {found}")]
    TooFewMatches { found: usize },
    #[error("homography estimation failed (inlier ratio {inlier_ratio:.2})")]
    HomographyFailed { inlier_ratio: f32 },
    #[error("invalid alignment options: {0}")]
    Options(#[from] serde_json::Error),
    #[error("failed to read reference image {path}: {source}")]
    Reference {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

impl AlignmentError {
    /// Inlier ratio of the best model, when estimation got that far.
    pub fn inlier_ratio(&self) -> Option<f32> {
        match self {
            Self::HomographyFailed { inlier_ratio } => Some(*inlier_ratio),
            _ => None,
        }
    }
}

/// Input warped into the page frame.
#[derive(Clone, Debug)]
pub struct AlignedImage {
    pub image: RgbImage,
    /// Maps the page-sized input onto the reference frame.
    pub homography: Homography,
    pub matches: usize,
    pub inliers: usize,
    pub inlier_ratio: f32,
    pub debug: Option<RgbImage>,
}

/// Feature-based aligner, built once per job and shared by workers.
pub struct AlignmentPreprocessor {
    config: AlignConfig,
    page: (u32, u32),
    extractor: Box<dyn FeatureExtractor>,
    reference: Features,
    reference_gray: Option<GrayImage>,
}

impl std::fmt::Debug for AlignmentPreprocessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignmentPreprocessor")
            .field("config", &self.config)
            .field("page", &self.page)
            .field("reference_keypoints", &self.reference.len())
            .finish()
    }
}

impl AlignmentPreprocessor {
    pub fn new(reference: &RgbImage, page: (u32, u32), config: AlignConfig) -> Result<Self, AlignmentError> {
        let extractor = FastExtractor::for_type(config.feature_type, config.max_features);
        Self::with_extractor(reference, page, config, Box::new(extractor))
    }

    pub fn from_path(path: &Path, page: (u32, u32), config: AlignConfig) -> Result<Self, AlignmentError> {
        let reference = image::open(path)
            .map_err(|source| AlignmentError::Reference {
                path: path.to_path_buf(),
                source,
            })?
            .to_rgb8();
        Self::new(&reference, page, config)
    }

    /// Use a custom extractor instead of the preset for `config.feature_type`.
    pub fn with_extractor(
        reference: &RgbImage,
        page: (u32, u32),
        config: AlignConfig,
        extractor: Box<dyn FeatureExtractor>,
    ) -> Result<Self, AlignmentError> {
        let (page_w, page_h) = page;
        let reference_page = resize_rgb(reference, page_w, page_h);
        let reference_gray = to_gray(&reference_page);

        let features = if config.resize_template {
            extractor.extract(&reference_gray)
        } else {
            let mut native = extractor.extract(&to_gray(reference));
            let sx = page_w as f32 / reference.width().max(1) as f32;
            let sy = page_h as f32 / reference.height().max(1) as f32;
            for kp in &mut native.keypoints {
                kp.position = Point2::new(kp.position.x * sx, kp.position.y * sy);
            }
            native
        };

        if features.len() < config.min_keypoints {
            return Err(AlignmentError::FeaturelessReference {
                found: features.len(),
                required: config.min_keypoints,
            });
        }
        debug!(
            "alignment reference: {} keypoints ({})",
            features.len(),
            config.feature_type
        );

        let reference_gray = config.debug.then_some(reference_gray);
        Ok(Self {
            config,
            page,
            extractor,
            reference: features,
            reference_gray,
        })
    }

    pub fn config(&self) -> &AlignConfig {
        &self.config
    }

    pub fn page_size(&self) -> (u32, u32) {
        self.page
    }

    pub fn reference_keypoints(&self) -> usize {
        self.reference.len()
    }

    /// Align `image` onto the reference. The input is first resized to the
    /// page frame, so the result always has page dimensions.
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "debug", skip_all, fields(w = image.width(), h = image.height()))
    )]
    pub fn align(&self, image: &RgbImage) -> Result<AlignedImage, AlignmentError> {
        let (page_w, page_h) = self.page;
        let scaled = resize_rgb(image, page_w, page_h);
        let gray = to_gray(&scaled);

        let features = self.extractor.extract(&gray);
        if features.len() < self.config.min_keypoints {
            return Err(AlignmentError::TooFewKeypoints {
                found: features.len(),
                required: self.config.min_keypoints,
            });
        }

        let matches = keep_best(
            match_features(&features, &self.reference),
            self.config.good_match_percent,
            4,
        );
        if matches.len() < 4 {
            return Err(AlignmentError::TooFewMatches {
                found: matches.len(),
            });
        }

        let src: Vec<Point2<f32>> = matches
            .iter()
            .map(|m| features.keypoints[m.query].position)
            .collect();
        let dst: Vec<Point2<f32>> = matches
            .iter()
            .map(|m| self.reference.keypoints[m.train].position)
            .collect();

        let fit = ransac_homography(&src, &dst, &self.config.ransac)
            .ok_or(AlignmentError::HomographyFailed { inlier_ratio: 0.0 })?;
        let inlier_ratio = fit.inlier_ratio();
        if fit.inlier_count < self.config.min_inliers {
            return Err(AlignmentError::HomographyFailed { inlier_ratio });
        }
        let page_from_input = fit.homography;
        let input_from_page = page_from_input
            .inverse()
            .filter(Homography::is_finite)
            .ok_or(AlignmentError::HomographyFailed { inlier_ratio })?;

        debug!(
            "aligned: {} keypoints, {} matches, {} inliers ({:.2})",
            features.len(),
            matches.len(),
            fit.inlier_count,
            inlier_ratio
        );

        let debug_image = self.reference_gray.as_ref().map(|reference| {
            let pairs: Vec<(Point2<f32>, Point2<f32>)> = src
                .iter()
                .zip(&dst)
                .zip(&fit.inliers)
                .filter(|(_, &inlier)| inlier)
                .map(|((&s, &d), _)| (d, s))
                .collect();
            render_debug(reference, &self.reference, &gray, &features, &pairs)
        });

        Ok(AlignedImage {
            image: warp_perspective_rgb(&scaled, input_from_page, page_w, page_h),
            homography: page_from_input,
            matches: matches.len(),
            inliers: fit.inlier_count,
            inlier_ratio,
            debug: debug_image,
        })
    }
}

const REFERENCE_COLOR: Rgb<u8> = Rgb([40, 90, 255]);
const INPUT_COLOR: Rgb<u8> = Rgb([255, 140, 0]);
const MATCH_COLOR: Rgb<u8> = Rgb([0, 200, 0]);

/// Reference on the left, input on the right, inlier matches joined by lines.
fn render_debug(
    reference: &GrayImage,
    reference_features: &Features,
    input: &GrayImage,
    input_features: &Features,
    inlier_pairs: &[(Point2<f32>, Point2<f32>)],
) -> RgbImage {
    let offset = reference.width();
    let height = reference.height().max(input.height());
    let mut canvas = RgbImage::from_pixel(offset + input.width(), height, Rgb([255, 255, 255]));
    for (x, y, p) in reference.enumerate_pixels() {
        canvas.put_pixel(x, y, Rgb([p[0]; 3]));
    }
    for (x, y, p) in input.enumerate_pixels() {
        canvas.put_pixel(offset + x, y, Rgb([p[0]; 3]));
    }

    for p in reference_features.positions() {
        draw_cross_mut(&mut canvas, REFERENCE_COLOR, p.x as i32, p.y as i32);
    }
    for p in input_features.positions() {
        draw_cross_mut(&mut canvas, INPUT_COLOR, (p.x + offset as f32) as i32, p.y as i32);
    }
    for (r, i) in inlier_pairs {
        draw_line_segment_mut(&mut canvas, (r.x, r.y), (i.x + offset as f32, i.y), MATCH_COLOR);
    }
    canvas
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use serde_json::json;

    #[test]
    fn options_use_template_key_names() {
        let cfg = AlignConfig::from_options(&json!({
            "reference": "ref.jpg",
            "featureType": "AKAZE",
            "maxFeatures": 800,
            "goodMatchPercent": 0.3,
            "resizeTemplate": false
        }))
        .expect("options");
        assert_eq!(cfg.reference.as_deref(), Some(Path::new("ref.jpg")));
        assert_eq!(cfg.feature_type, FeatureType::Akaze);
        assert_eq!(cfg.max_features, 800);
        assert!(!cfg.resize_template);
        assert_eq!(cfg.min_keypoints, 10);
    }

    #[test]
    fn null_options_mean_defaults_and_bad_types_fail() {
        let cfg = AlignConfig::from_options(&serde_json::Value::Null).expect("defaults");
        assert_relative_eq!(cfg.good_match_percent, 0.2);
        assert!(matches!(
            AlignConfig::from_options(&json!({"maxFeatures": "many"})),
            Err(AlignmentError::Options(_))
        ));
    }

    #[test]
    fn only_homography_failures_carry_a_ratio() {
        assert_eq!(
            AlignmentError::HomographyFailed { inlier_ratio: 0.25 }.inlier_ratio(),
            Some(0.25)
        );
        assert_eq!(
            AlignmentError::TooFewKeypoints { found: 3, required: 10 }.inlier_ratio(),
            None
        );
    }
}

//! Feature-based alignment of captured answer sheets.
//!
//! A reference scan of the blank sheet is analysed once; every input photo is
//! then matched against it and warped into the template page frame.
//!
//! ```no_run
//! use sheetgrade_align::{AlignConfig, AlignmentPreprocessor};
//!
//! let reference = image::open("reference.png").unwrap().to_rgb8();
//! let aligner = AlignmentPreprocessor::new(&reference, (1240, 1754), AlignConfig::default()).unwrap();
//! let photo = image::open("scan_001.jpg").unwrap().to_rgb8();
//! match aligner.align(&photo) {
//!     Ok(aligned) => println!("inliers: {:.2}", aligned.inlier_ratio),
//!     Err(err) => eprintln!("alignment failed: {err}"),
//! }
//! ```

mod features;
mod matching;
mod preprocessor;
mod ransac;

pub use features::{
    DescriptorKind, Descriptors, ExtractorParams, FastExtractor, FeatureExtractor, FeatureType,
    Features, Keypoint, PATCH_RADIUS,
};
pub use matching::{keep_best, match_features, FeatureMatch};
pub use preprocessor::{AlignConfig, AlignedImage, AlignmentError, AlignmentPreprocessor};
pub use ransac::{ransac_homography, RansacFit, RansacParams};

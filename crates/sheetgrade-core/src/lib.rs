//! Core types and utilities for answer-sheet grading.
//!
//! This crate is intentionally small: template parsing and bubble geometry,
//! planar homographies, and a handful of image helpers. It does *not* know
//! about feature detectors, inference backends or scoring.

mod homography;
mod image;
mod logger;
mod template;

pub use homography::{estimate_homography, homography_from_4pt, warp_perspective_rgb, Homography};
pub use image::{
    crop_rgb, normalize_channels, resize_rgb, sample_bilinear_rgb, to_gray, PixelRect,
};
pub use template::{
    BubblePoint, Direction, FieldBlock, FieldType, PreProcessorSpec, Template, TemplateLoadError,
    DEFAULT_BUBBLE_DIMENSIONS,
};

#[cfg(feature = "tracing")]
pub use logger::init_tracing;

pub use logger::{init_with_level, level_from_verbosity};

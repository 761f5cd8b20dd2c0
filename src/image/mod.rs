//! Image pre- and post-processing around the chrominance predictor.

mod finalize;
mod prepare;

pub use finalize::finalize;
pub use prepare::{prepare, PreparedImage};

use ndarray::Array4;

/// Normalized luminance in NCHW format (1, 1, height, width), values in [-1, 1].
pub type LuminanceTensor = Array4<f32>;

/// Normalized chrominance in NCHW format (1, 2, height, width).
pub type ChrominanceTensor = Array4<f32>;

/// Default square resolution the network runs at.
pub const DEFAULT_IMAGE_SIZE: u32 = 256;

/// Scale between Lab a/b values and the network's chrominance units.
pub const CHROMA_SCALE: f32 = 128.0;

/// Half of the Lab lightness range.
const LIGHTNESS_HALF_RANGE: f32 = 50.0;

/// Map L in [0, 100] to [-1, 1].
#[inline]
#[must_use]
pub fn normalize_luminance(l: f32) -> f32 {
    l / LIGHTNESS_HALF_RANGE - 1.0
}

/// Map normalized luminance in [-1, 1] back to L in [0, 100].
#[inline]
#[must_use]
pub fn denormalize_luminance(value: f32) -> f32 {
    (value + 1.0) * LIGHTNESS_HALF_RANGE
}

/// Map a Lab a/b value to network units.
#[inline]
#[must_use]
pub fn normalize_chrominance(ab: f32) -> f32 {
    ab / CHROMA_SCALE
}

/// Map network chrominance units back to a Lab a/b value.
#[inline]
#[must_use]
pub fn denormalize_chrominance(value: f32) -> f32 {
    value * CHROMA_SCALE
}

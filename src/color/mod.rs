//! CIE Lab colorspace conversion.

mod lab;

pub use lab::{image_to_lab, lab_to_rgb, lab_to_rgb_image, rgb_to_lab};

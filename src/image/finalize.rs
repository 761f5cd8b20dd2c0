//! Output reconstruction and PNG encoding.

use std::io::Cursor;

use image::{imageops::FilterType, ImageFormat};
use ndarray::{s, Array3};

use crate::color::lab_to_rgb_image;
use crate::error::{Error, Result};

use super::{denormalize_chrominance, denormalize_luminance, ChrominanceTensor, LuminanceTensor};

/// Recombine luminance and predicted chrominance into a PNG.
///
/// The tensors are:
/// 1. Denormalized to Lab ranges (`(L + 1) * 50`, `ab * 128`)
/// 2. Converted to RGB, clipped to [0, 1] and scaled to 8 bits
/// 3. Resized to `original_size` using Lanczos3
/// 4. Encoded as PNG
///
/// # Arguments
///
/// * `luminance` - Normalized L tensor (1, 1, H, W)
/// * `chrominance` - Normalized ab tensor (1, 2, H, W)
/// * `original_size` - Width and height of the output image
///
/// # Errors
///
/// Returns an error if the tensors disagree in shape or the PNG cannot be encoded.
pub fn finalize(
    luminance: &LuminanceTensor,
    chrominance: &ChrominanceTensor,
    original_size: (u32, u32),
) -> Result<Vec<u8>> {
    let lab = to_lab(luminance, chrominance)?;
    let rgb = lab_to_rgb_image(&lab);

    let (width, height) = original_size;
    let resized = if rgb.dimensions() == original_size {
        rgb
    } else {
        image::imageops::resize(&rgb, width, height, FilterType::Lanczos3)
    };

    let mut bytes = Vec::new();
    resized
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .map_err(|source| Error::Encode { source })?;

    Ok(bytes)
}

/// Stack denormalized L and ab into a planar (3, H, W) Lab array.
fn to_lab(luminance: &LuminanceTensor, chrominance: &ChrominanceTensor) -> Result<Array3<f32>> {
    let (l_batch, l_channels, height, width) = luminance.dim();
    let (ab_batch, ab_channels, ab_height, ab_width) = chrominance.dim();

    if l_batch != 1 || l_channels != 1 {
        return Err(Error::ShapeMismatch {
            expected: "luminance (1, 1, H, W)".to_string(),
            actual: format!("{:?}", luminance.shape()),
        });
    }

    if ab_batch != 1 || ab_channels != 2 || (ab_height, ab_width) != (height, width) {
        return Err(Error::ShapeMismatch {
            expected: format!("chrominance (1, 2, {height}, {width})"),
            actual: format!("{:?}", chrominance.shape()),
        });
    }

    let mut lab = Array3::<f32>::zeros((3, height, width));
    lab.slice_mut(s![0, .., ..])
        .assign(&luminance.slice(s![0, 0, .., ..]).mapv(denormalize_luminance));
    lab.slice_mut(s![1..3, .., ..])
        .assign(&chrominance.slice(s![0, .., .., ..]).mapv(denormalize_chrominance));

    Ok(lab)
}

//! Input decoding and luminance extraction.

use image::{imageops::FilterType, DynamicImage, GenericImageView, ImageError, RgbImage};
use ndarray::{s, Array4};

use crate::color::image_to_lab;
use crate::error::{Error, Result};

use super::{normalize_luminance, LuminanceTensor};

/// A decoded input reduced to what the network and the postprocessor need.
#[derive(Debug, Clone)]
pub struct PreparedImage {
    /// Normalized L channel at the inference resolution, shape (1, 1, size, size).
    pub luminance: LuminanceTensor,
    /// Width and height of the input, restored on output.
    pub original_size: (u32, u32),
}

/// Decode an image and extract its normalized luminance.
///
/// The image is:
/// 1. Decoded from the raw bytes and coerced to 8-bit RGB
/// 2. Resized to `size`x`size` using Lanczos3
/// 3. Converted to Lab
/// 4. Reduced to its L channel, normalized with `L / 50 - 1`
/// 5. Returned as NCHW tensor (1, 1, size, size)
///
/// # Errors
///
/// Returns [`Error::Decode`] if the bytes are not an image,
/// [`Error::UnsupportedFormat`] if the format or color mode cannot be decoded,
/// and [`Error::UnsupportedDimensions`] for empty images.
pub fn prepare(bytes: &[u8], size: u32) -> Result<PreparedImage> {
    let img = decode(bytes)?;

    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        return Err(Error::UnsupportedDimensions {
            width,
            height,
            reason: "image has no pixels".to_string(),
        });
    }

    tracing::debug!("Decoded {width}x{height} {:?} input", img.color());

    let rgb = img.to_rgb8();
    let luminance = rgb_to_luminance(&rgb, size);

    Ok(PreparedImage {
        luminance,
        original_size: (width, height),
    })
}

fn decode(bytes: &[u8]) -> Result<DynamicImage> {
    let format = image::guess_format(bytes).map_err(|source| Error::Decode { source })?;

    image::load_from_memory_with_format(bytes, format).map_err(|source| match source {
        ImageError::Unsupported(err) => Error::UnsupportedFormat {
            reason: err.to_string(),
        },
        source => Error::Decode { source },
    })
}

/// Resize an RGB image and turn its lightness into a normalized tensor.
fn rgb_to_luminance(rgb: &RgbImage, size: u32) -> LuminanceTensor {
    let resized = image::imageops::resize(rgb, size, size, FilterType::Lanczos3);
    let lab = image_to_lab(&resized);

    let (_, height, width) = lab.dim();
    let mut tensor = Array4::<f32>::zeros((1, 1, height, width));
    tensor
        .slice_mut(s![0, 0, .., ..])
        .assign(&lab.slice(s![0, .., ..]).mapv(normalize_luminance));

    tensor
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use image::{ImageFormat, Luma, Rgb};

    use super::*;

    fn encode_png(img: DynamicImage) -> Vec<u8> {
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    #[test]
    fn test_tensor_shape() {
        let bytes = encode_png(DynamicImage::new_rgb8(100, 60));
        let prepared = prepare(&bytes, 32).unwrap();

        assert_eq!(prepared.luminance.shape(), &[1, 1, 32, 32]);
        assert_eq!(prepared.original_size, (100, 60));
    }

    #[test]
    fn test_normalization_range() {
        let bytes = encode_png(DynamicImage::new_rgb8(20, 20));
        let prepared = prepare(&bytes, 16).unwrap();

        // Black image should be all -1.0
        for &v in &prepared.luminance {
            assert!((v + 1.0).abs() < 1e-4);
        }

        let white = RgbImage::from_pixel(20, 20, Rgb([255, 255, 255]));
        let prepared = prepare(&encode_png(DynamicImage::ImageRgb8(white)), 16).unwrap();
        for &v in &prepared.luminance {
            assert!((v - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn test_grayscale_input_is_coerced() {
        let gray = image::GrayImage::from_pixel(12, 9, Luma([128]));
        let prepared = prepare(&encode_png(DynamicImage::ImageLuma8(gray)), 16).unwrap();

        assert_eq!(prepared.original_size, (12, 9));
        let expected = normalize_luminance(53.585);
        for &v in &prepared.luminance {
            assert!((v - expected).abs() < 1e-2, "got {v}, expected {expected}");
        }
    }

    #[test]
    fn test_garbage_bytes_fail_to_decode() {
        let err = prepare(b"definitely not an image", 16).unwrap_err();
        assert!(matches!(err, Error::Decode { .. }), "got {err:?}");
        assert!(err.is_client_error());
    }

    #[test]
    fn test_recognized_but_disabled_format_is_unsupported() {
        // QOI header: sniffed by magic bytes, but no QOI decoder is built in
        let err = prepare(b"qoif\0\0\0\x04\0\0\0\x04\x03\0garbage", 16).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat { .. }), "got {err:?}");
        assert!(err.is_client_error());
    }

    #[test]
    fn test_truncated_png_fails_to_decode() {
        let bytes = encode_png(DynamicImage::new_rgb8(30, 30));
        let err = prepare(&bytes[..bytes.len() / 2], 16).unwrap_err();
        assert!(err.is_client_error(), "got {err:?}");
    }
}

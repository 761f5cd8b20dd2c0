//! sRGB <-> CIE Lab (D65) conversion.
//!
//! Constants follow the floating-point Lab convention the network was trained
//! against: sRGB gamma, the Rec. 709 primaries matrix, and a D65 white point of
//! `(0.950456, 1.0, 1.088754)`. L is in [0, 100], a and b roughly in [-128, 127].

use image::{Rgb, RgbImage};
use ndarray::Array3;

/// D65 reference white, X component.
const WHITE_X: f32 = 0.950_456;
/// D65 reference white, Z component.
const WHITE_Z: f32 = 1.088_754;

/// Linear sRGB -> XYZ.
const RGB_TO_XYZ: [[f32; 3]; 3] = [
    [0.412_453, 0.357_580, 0.180_423],
    [0.212_671, 0.715_160, 0.072_169],
    [0.019_334, 0.119_193, 0.950_227],
];

/// XYZ -> linear sRGB.
const XYZ_TO_RGB: [[f32; 3]; 3] = [
    [3.240_479, -1.537_150, -0.498_535],
    [-0.969_256, 1.875_991, 0.041_556],
    [0.055_648, -0.204_043, 1.057_311],
];

/// Ratio below which the cube root is replaced by its linear approximation.
const EPSILON: f32 = 0.008_856;
/// Slope of the linear branch of `f`.
const KAPPA_SLOPE: f32 = 7.787;
/// Slope of the linear branch of L.
const KAPPA_L: f32 = 903.3;
const OFFSET: f32 = 16.0 / 116.0;
/// `f(EPSILON)`, the point where the inverse switches branches.
const F_THRESHOLD: f32 = 6.0 / 29.0;
/// `KAPPA_L * EPSILON`.
const L_THRESHOLD: f32 = 7.999_6;

#[inline]
fn srgb_to_linear(c: f32) -> f32 {
    if c <= 0.040_45 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

#[inline]
fn linear_to_srgb(c: f32) -> f32 {
    if c <= 0.003_130_8 {
        12.92 * c
    } else {
        1.055_f32.mul_add(c.powf(1.0 / 2.4), -0.055)
    }
}

#[inline]
fn lab_f(t: f32) -> f32 {
    if t > EPSILON {
        t.cbrt()
    } else {
        KAPPA_SLOPE.mul_add(t, OFFSET)
    }
}

#[inline]
fn lab_f_inv(f: f32) -> f32 {
    if f > F_THRESHOLD {
        f * f * f
    } else {
        (f - OFFSET) / KAPPA_SLOPE
    }
}

#[inline]
fn mat_mul(m: &[[f32; 3]; 3], v: [f32; 3]) -> [f32; 3] {
    [
        m[0][0].mul_add(v[0], m[0][1].mul_add(v[1], m[0][2] * v[2])),
        m[1][0].mul_add(v[0], m[1][1].mul_add(v[1], m[1][2] * v[2])),
        m[2][0].mul_add(v[0], m[2][1].mul_add(v[1], m[2][2] * v[2])),
    ]
}

/// Convert an sRGB triple with channels in [0, 1] to Lab.
///
/// Channels outside [0, 1] are clamped first, so the function is total.
#[must_use]
pub fn rgb_to_lab(rgb: [f32; 3]) -> [f32; 3] {
    let linear = rgb.map(|c| srgb_to_linear(c.clamp(0.0, 1.0)));
    let [x, y, z] = mat_mul(&RGB_TO_XYZ, linear);

    let fx = lab_f(x / WHITE_X);
    let fy = lab_f(y);
    let fz = lab_f(z / WHITE_Z);

    let l = if y > EPSILON {
        116.0_f32.mul_add(y.cbrt(), -16.0)
    } else {
        KAPPA_L * y
    };

    [l, 500.0 * (fx - fy), 200.0 * (fy - fz)]
}

/// Convert a Lab triple to sRGB, clipping every channel to [0, 1].
///
/// Out-of-gamut colors are clamped rather than wrapped.
#[must_use]
pub fn lab_to_rgb(lab: [f32; 3]) -> [f32; 3] {
    let [l, a, b] = lab;

    let (y, fy) = if l <= L_THRESHOLD {
        let y = l / KAPPA_L;
        (y, KAPPA_SLOPE.mul_add(y, OFFSET))
    } else {
        let fy = (l + 16.0) / 116.0;
        (fy * fy * fy, fy)
    };

    let x = lab_f_inv(fy + a / 500.0) * WHITE_X;
    let z = lab_f_inv(fy - b / 200.0) * WHITE_Z;

    // Clamp in linear space: gamma is monotone with fixed points 0 and 1, and
    // powf on a negative base would yield NaN.
    mat_mul(&XYZ_TO_RGB, [x, y, z]).map(|c| linear_to_srgb(c.clamp(0.0, 1.0)).clamp(0.0, 1.0))
}

/// Convert an RGB image to a planar (3, H, W) Lab array.
#[must_use]
pub fn image_to_lab(img: &RgbImage) -> Array3<f32> {
    let (width, height) = img.dimensions();
    let mut lab = Array3::<f32>::zeros((3, height as usize, width as usize));

    for (x, y, pixel) in img.enumerate_pixels() {
        let rgb = pixel.0.map(|c| f32::from(c) / 255.0);
        let [l, a, b] = rgb_to_lab(rgb);
        let (y, x) = (y as usize, x as usize);
        lab[[0, y, x]] = l;
        lab[[1, y, x]] = a;
        lab[[2, y, x]] = b;
    }

    lab
}

/// Convert a planar (3, H, W) Lab array to an 8-bit RGB image.
///
/// Channel values are scaled by 255 and truncated.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn lab_to_rgb_image(lab: &Array3<f32>) -> RgbImage {
    let (_, height, width) = lab.dim();

    // Safe: dimensions originate from a u32-sized image
    RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let (y, x) = (y as usize, x as usize);
        let rgb = lab_to_rgb([lab[[0, y, x]], lab[[1, y, x]], lab[[2, y, x]]]);
        // Safe: lab_to_rgb clips to [0, 1]
        Rgb(rgb.map(|c| (c * 255.0) as u8))
    })
}

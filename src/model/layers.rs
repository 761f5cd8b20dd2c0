//! Inference-only building blocks operating on (channels, height, width) arrays.

use ndarray::linalg::general_mat_mul;
use ndarray::{
    concatenate, s, Array1, Array2, Array3, Array4, ArrayD, ArrayView3, Axis, Ix1, Ix4, Zip,
};

use crate::error::{Error, Result};

use super::params::{Init, ParameterSource};

/// Normalization epsilon used by the trained network.
const BATCH_NORM_EPS: f32 = 1e-5;

/// A learned tensor together with its parameter name, as stored in a checkpoint.
pub type NamedTensor = (String, ArrayD<f32>);

fn shape_error(err: &ndarray::ShapeError) -> Error {
    Error::Inference {
        reason: err.to_string(),
    }
}

fn channel_mismatch(layer: &str, expected: usize, actual: usize) -> Error {
    Error::ShapeMismatch {
        expected: format!("{expected} input channels for {layer}"),
        actual: format!("{actual} channels"),
    }
}

/// Copy a (C, H, W) view into a contiguous (C, H * W) matrix.
fn flatten_spatial(view: ArrayView3<'_, f32>) -> Result<Array2<f32>> {
    let (channels, height, width) = view.dim();
    let mut flat = Array3::<f32>::zeros((channels, height, width));
    flat.assign(&view);
    flat.into_shape_with_order((channels, height * width))
        .map_err(|e| shape_error(&e))
}

fn load4(
    source: &mut impl ParameterSource,
    name: &str,
    shape: [usize; 4],
    init: Init,
) -> Result<Array4<f32>> {
    source
        .tensor(name, &shape, init)?
        .into_dimensionality::<Ix4>()
        .map_err(|e| shape_error(&e))
}

fn load1(
    source: &mut impl ParameterSource,
    name: &str,
    len: usize,
    init: Init,
) -> Result<Array1<f32>> {
    source
        .tensor(name, &[len], init)?
        .into_dimensionality::<Ix1>()
        .map_err(|e| shape_error(&e))
}

/// Square 2-D convolution with stride 1 and "same" zero padding.
#[derive(Debug, Clone)]
pub struct Conv2d {
    /// (out, in, k, k)
    weight: Array4<f32>,
    bias: Option<Array1<f32>>,
}

impl Conv2d {
    /// Load a `kernel`x`kernel` convolution named `prefix`.
    ///
    /// # Errors
    ///
    /// Returns an error if the source cannot supply the parameters.
    pub fn load(
        source: &mut impl ParameterSource,
        prefix: &str,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        with_bias: bool,
    ) -> Result<Self> {
        let fan_in = in_channels * kernel * kernel;
        let weight = load4(
            source,
            &format!("{prefix}.weight"),
            [out_channels, in_channels, kernel, kernel],
            Init::Uniform { fan_in },
        )?;
        let bias = if with_bias {
            Some(load1(source, &format!("{prefix}.bias"), out_channels, Init::Uniform { fan_in })?)
        } else {
            None
        };
        Ok(Self { weight, bias })
    }

    #[must_use]
    pub fn in_channels(&self) -> usize {
        self.weight.dim().1
    }

    #[must_use]
    pub fn out_channels(&self) -> usize {
        self.weight.dim().0
    }

    /// Convolve `input`, keeping its spatial size.
    ///
    /// Each kernel tap is one matrix product of the (out, in) tap weights with
    /// the correspondingly shifted input.
    ///
    /// # Errors
    ///
    /// Returns an error if the input channel count does not match the weights.
    pub fn forward(&self, input: &Array3<f32>) -> Result<Array3<f32>> {
        let (channels, height, width) = input.dim();
        if channels != self.in_channels() {
            return Err(channel_mismatch("conv2d", self.in_channels(), channels));
        }

        let kernel = self.weight.dim().2;
        let pad = kernel / 2;
        let mut out = Array2::<f32>::zeros((self.out_channels(), height * width));

        if kernel == 1 {
            let cols = flatten_spatial(input.view())?;
            let taps = self.weight.slice(s![.., .., 0, 0]);
            general_mat_mul(1.0, &taps, &cols, 0.0, &mut out);
        } else {
            let mut padded = Array3::<f32>::zeros((channels, height + 2 * pad, width + 2 * pad));
            padded
                .slice_mut(s![.., pad..pad + height, pad..pad + width])
                .assign(input);

            for ky in 0..kernel {
                for kx in 0..kernel {
                    let cols =
                        flatten_spatial(padded.slice(s![.., ky..ky + height, kx..kx + width]))?;
                    let taps = self.weight.slice(s![.., .., ky, kx]);
                    general_mat_mul(1.0, &taps, &cols, 1.0, &mut out);
                }
            }
        }

        if let Some(bias) = &self.bias {
            out += &bias.view().insert_axis(Axis(1));
        }

        out.into_shape_with_order((self.out_channels(), height, width))
            .map_err(|e| shape_error(&e))
    }

    pub(crate) fn export(&self, prefix: &str, out: &mut Vec<NamedTensor>) {
        out.push((format!("{prefix}.weight"), self.weight.clone().into_dyn()));
        if let Some(bias) = &self.bias {
            out.push((format!("{prefix}.bias"), bias.clone().into_dyn()));
        }
    }
}

/// Batch normalization with frozen running statistics.
#[derive(Debug, Clone)]
pub struct BatchNorm2d {
    weight: Array1<f32>,
    bias: Array1<f32>,
    running_mean: Array1<f32>,
    running_var: Array1<f32>,
    /// `weight / sqrt(running_var + eps)`
    scale: Array1<f32>,
    /// `bias - running_mean * scale`
    shift: Array1<f32>,
}

impl BatchNorm2d {
    /// Load the normalization named `prefix` over `channels` channels.
    ///
    /// # Errors
    ///
    /// Returns an error if the source cannot supply the parameters.
    pub fn load(source: &mut impl ParameterSource, prefix: &str, channels: usize) -> Result<Self> {
        let weight = load1(source, &format!("{prefix}.weight"), channels, Init::Ones)?;
        let bias = load1(source, &format!("{prefix}.bias"), channels, Init::Zeros)?;
        let running_mean = load1(source, &format!("{prefix}.running_mean"), channels, Init::Zeros)?;
        let running_var = load1(source, &format!("{prefix}.running_var"), channels, Init::Ones)?;

        let scale = Zip::from(&weight)
            .and(&running_var)
            .map_collect(|&w, &v| w / (v + BATCH_NORM_EPS).sqrt());
        let shift = Zip::from(&bias)
            .and(&running_mean)
            .and(&scale)
            .map_collect(|&b, &m, &s| m.mul_add(-s, b));

        Ok(Self {
            weight,
            bias,
            running_mean,
            running_var,
            scale,
            shift,
        })
    }

    /// Normalize `input` in place.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel count does not match.
    pub fn forward_inplace(&self, input: &mut Array3<f32>) -> Result<()> {
        let channels = input.dim().0;
        if channels != self.scale.len() {
            return Err(channel_mismatch("batch norm", self.scale.len(), channels));
        }

        for ((mut plane, &scale), &shift) in input
            .outer_iter_mut()
            .zip(self.scale.iter())
            .zip(self.shift.iter())
        {
            plane.mapv_inplace(|v| v.mul_add(scale, shift));
        }
        Ok(())
    }

    pub(crate) fn export(&self, prefix: &str, out: &mut Vec<NamedTensor>) {
        out.push((format!("{prefix}.weight"), self.weight.clone().into_dyn()));
        out.push((format!("{prefix}.bias"), self.bias.clone().into_dyn()));
        out.push((format!("{prefix}.running_mean"), self.running_mean.clone().into_dyn()));
        out.push((format!("{prefix}.running_var"), self.running_var.clone().into_dyn()));
    }
}

/// 2x2 transposed convolution with stride 2, doubling the spatial size.
#[derive(Debug, Clone)]
pub struct ConvTranspose2d {
    /// (in, out, 2, 2)
    weight: Array4<f32>,
    bias: Array1<f32>,
}

impl ConvTranspose2d {
    /// Load the upsampling layer named `prefix`.
    ///
    /// # Errors
    ///
    /// Returns an error if the source cannot supply the parameters.
    pub fn load(
        source: &mut impl ParameterSource,
        prefix: &str,
        in_channels: usize,
        out_channels: usize,
    ) -> Result<Self> {
        // Fan-in is taken over dim 1 of the (in, out, k, k) weight, as in the trained network.
        let fan_in = out_channels * 4;
        let weight = load4(
            source,
            &format!("{prefix}.weight"),
            [in_channels, out_channels, 2, 2],
            Init::Uniform { fan_in },
        )?;
        let bias = load1(
            source,
            &format!("{prefix}.bias"),
            out_channels,
            Init::Uniform { fan_in },
        )?;
        Ok(Self { weight, bias })
    }

    /// Upsample `input` from (in, H, W) to (out, 2H, 2W).
    ///
    /// Stride equals kernel size, so every output pixel receives exactly one tap.
    ///
    /// # Errors
    ///
    /// Returns an error if the input channel count does not match the weights.
    pub fn forward(&self, input: &Array3<f32>) -> Result<Array3<f32>> {
        let (channels, height, width) = input.dim();
        let (in_channels, out_channels, _, _) = self.weight.dim();
        if channels != in_channels {
            return Err(channel_mismatch("transposed conv", in_channels, channels));
        }

        let cols = flatten_spatial(input.view())?;
        let mut out = Array3::<f32>::zeros((out_channels, height * 2, width * 2));
        let mut tap = Array2::<f32>::zeros((out_channels, height * width));

        for dy in 0..2 {
            for dx in 0..2 {
                let taps = self.weight.slice(s![.., .., dy, dx]).reversed_axes();
                general_mat_mul(1.0, &taps, &cols, 0.0, &mut tap);
                let plane = tap
                    .view()
                    .into_shape_with_order((out_channels, height, width))
                    .map_err(|e| shape_error(&e))?;
                out.slice_mut(s![.., dy..;2, dx..;2]).assign(&plane);
            }
        }

        for (mut plane, &b) in out.outer_iter_mut().zip(self.bias.iter()) {
            plane += b;
        }

        Ok(out)
    }

    pub(crate) fn export(&self, prefix: &str, out: &mut Vec<NamedTensor>) {
        out.push((format!("{prefix}.weight"), self.weight.clone().into_dyn()));
        out.push((format!("{prefix}.bias"), self.bias.clone().into_dyn()));
    }
}

/// Rectified linear activation, in place.
pub fn relu_inplace(input: &mut Array3<f32>) {
    input.mapv_inplace(|v| v.max(0.0));
}

/// 2x2 max pooling with stride 2. Odd trailing rows and columns are dropped.
#[must_use]
pub fn max_pool2x2(input: &Array3<f32>) -> Array3<f32> {
    let (channels, height, width) = input.dim();
    let (out_h, out_w) = (height / 2, width / 2);
    let (h2, w2) = (out_h * 2, out_w * 2);

    let mut out = Array3::<f32>::zeros((channels, out_h, out_w));
    if out_h == 0 || out_w == 0 {
        return out;
    }

    Zip::from(&mut out)
        .and(input.slice(s![.., 0..h2;2, 0..w2;2]))
        .and(input.slice(s![.., 0..h2;2, 1..w2;2]))
        .and(input.slice(s![.., 1..h2;2, 0..w2;2]))
        .and(input.slice(s![.., 1..h2;2, 1..w2;2]))
        .for_each(|o, &a, &b, &c, &d| *o = a.max(b).max(c.max(d)));
    out
}

/// Place `input` centered in a (C, height, width) frame.
///
/// The extra row or column of an odd difference goes to the bottom or right.
/// A negative difference crops instead of padding.
#[must_use]
#[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
pub fn pad_to(input: &Array3<f32>, height: usize, width: usize) -> Array3<f32> {
    let (channels, in_h, in_w) = input.dim();
    if (in_h, in_w) == (height, width) {
        return input.clone();
    }

    // (src_start, dst_start, len) along one axis
    let span = |src: usize, dst: usize| {
        let before = (dst as isize - src as isize).div_euclid(2);
        let src_start = (-before).max(0) as usize;
        let dst_start = before.max(0) as usize;
        let len = (src - src_start.min(src)).min(dst - dst_start.min(dst));
        (src_start, dst_start, len)
    };
    let (sy, dy, len_y) = span(in_h, height);
    let (sx, dx, len_x) = span(in_w, width);

    let mut out = Array3::<f32>::zeros((channels, height, width));
    out.slice_mut(s![.., dy..dy + len_y, dx..dx + len_x])
        .assign(&input.slice(s![.., sy..sy + len_y, sx..sx + len_x]));
    out
}

/// Stack `skip` and `upsampled` along the channel axis, skip first.
///
/// # Errors
///
/// Returns an error if the spatial sizes differ.
pub fn concat_channels(skip: &Array3<f32>, upsampled: &Array3<f32>) -> Result<Array3<f32>> {
    concatenate(Axis(0), &[skip.view(), upsampled.view()]).map_err(|_| Error::ShapeMismatch {
        expected: format!("spatial size {:?}", &skip.shape()[1..]),
        actual: format!("{:?}", &upsampled.shape()[1..]),
    })
}

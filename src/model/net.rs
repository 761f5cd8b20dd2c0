//! U-shaped encoder-decoder predicting Lab chrominance from luminance.

use ndarray::{Array3, Array4};

use crate::error::{Error, Result};
use crate::image::{ChrominanceTensor, LuminanceTensor};

use super::layers::{
    concat_channels, max_pool2x2, pad_to, relu_inplace, BatchNorm2d, Conv2d, ConvTranspose2d,
    NamedTensor,
};
use super::params::{ParameterSource, RandomSource};

/// Number of encoder (and decoder) stages.
pub const DEPTH: usize = 4;

/// Default width of the first encoder stage.
pub const DEFAULT_BASE_CHANNELS: usize = 64;

/// Overall downsampling factor of the encoder.
pub const DOWNSAMPLE_FACTOR: usize = 1 << DEPTH;

/// Predicted chrominance channels (a, b).
const OUT_CHANNELS: usize = 2;

/// Input luminance channels.
const IN_CHANNELS: usize = 1;

/// Two rounds of 3x3 convolution, batch normalization and ReLU.
#[derive(Debug, Clone)]
pub struct ConvBlock {
    conv1: Conv2d,
    norm1: BatchNorm2d,
    conv2: Conv2d,
    norm2: BatchNorm2d,
}

impl ConvBlock {
    /// Load the block named `prefix` (`<prefix>.block.{0,1,3,4}.*`).
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
        Ok(Self {
            conv1: Conv2d::load(
                source,
                &format!("{prefix}.block.0"),
                in_channels,
                out_channels,
                3,
                false,
            )?,
            norm1: BatchNorm2d::load(source, &format!("{prefix}.block.1"), out_channels)?,
            conv2: Conv2d::load(
                source,
                &format!("{prefix}.block.3"),
                out_channels,
                out_channels,
                3,
                false,
            )?,
            norm2: BatchNorm2d::load(source, &format!("{prefix}.block.4"), out_channels)?,
        })
    }

    /// Apply the block; spatial size is unchanged.
    ///
    /// # Errors
    ///
    /// Returns an error if the input channel count does not match.
    pub fn forward(&self, input: &Array3<f32>) -> Result<Array3<f32>> {
        let mut x = self.conv1.forward(input)?;
        self.norm1.forward_inplace(&mut x)?;
        relu_inplace(&mut x);

        let mut x = self.conv2.forward(&x)?;
        self.norm2.forward_inplace(&mut x)?;
        relu_inplace(&mut x);
        Ok(x)
    }

    fn export(&self, prefix: &str, out: &mut Vec<NamedTensor>) {
        self.conv1.export(&format!("{prefix}.block.0"), out);
        self.norm1.export(&format!("{prefix}.block.1"), out);
        self.conv2.export(&format!("{prefix}.block.3"), out);
        self.norm2.export(&format!("{prefix}.block.4"), out);
    }
}

/// Decoder stage: upsample, align with the skip tensor, concatenate, fuse.
#[derive(Debug, Clone)]
pub struct UpBlock {
    up: ConvTranspose2d,
    conv: ConvBlock,
}

impl UpBlock {
    /// Load the stage named `prefix` (`<prefix>.up.*`, `<prefix>.conv.*`).
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
        Ok(Self {
            up: ConvTranspose2d::load(source, &format!("{prefix}.up"), in_channels, out_channels)?,
            conv: ConvBlock::load(
                source,
                &format!("{prefix}.conv"),
                out_channels * 2,
                out_channels,
            )?,
        })
    }

    /// Upsample `input` and fuse it with `skip`.
    ///
    /// Odd skip sizes leave the upsampled map one pixel short; it is padded to
    /// the skip size before concatenation.
    ///
    /// # Errors
    ///
    /// Returns an error if channel counts do not match.
    pub fn forward(&self, input: &Array3<f32>, skip: &Array3<f32>) -> Result<Array3<f32>> {
        let upsampled = self.up.forward(input)?;
        let (_, skip_h, skip_w) = skip.dim();
        let upsampled = pad_to(&upsampled, skip_h, skip_w);
        let merged = concat_channels(skip, &upsampled)?;
        self.conv.forward(&merged)
    }

    fn export(&self, prefix: &str, out: &mut Vec<NamedTensor>) {
        self.up.export(&format!("{prefix}.up"), out);
        self.conv.export(&format!("{prefix}.conv"), out);
    }
}

/// The chrominance predictor.
///
/// Parameters are immutable once built, so one instance can serve any number
/// of concurrent [`ColorizationNet::predict`] calls.
#[derive(Debug, Clone)]
pub struct ColorizationNet {
    base_channels: usize,
    encoder: [ConvBlock; DEPTH],
    bottleneck: ConvBlock,
    /// Deepest stage first.
    decoder: [UpBlock; DEPTH],
    head: Conv2d,
}

/// Parameter name of encoder stage `i` (0-based, shallowest first).
fn encoder_name(i: usize) -> String {
    format!("enc{}", i + 1)
}

/// Parameter name of decoder stage `i` (0-based, deepest first).
fn decoder_name(i: usize) -> String {
    format!("up{}", DEPTH - i)
}

impl ColorizationNet {
    /// Build the network from named parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if `base_channels` is zero or any parameter is missing
    /// or misshapen.
    pub fn load(source: &mut impl ParameterSource, base_channels: usize) -> Result<Self> {
        if base_channels == 0 {
            return Err(Error::InvalidParameter {
                name: "base_channels".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }

        let width = |stage: usize| base_channels << stage;

        let encoder = [
            ConvBlock::load(source, &encoder_name(0), IN_CHANNELS, width(0))?,
            ConvBlock::load(source, &encoder_name(1), width(0), width(1))?,
            ConvBlock::load(source, &encoder_name(2), width(1), width(2))?,
            ConvBlock::load(source, &encoder_name(3), width(2), width(3))?,
        ];
        let bottleneck = ConvBlock::load(source, "bottleneck", width(3), width(4))?;
        let decoder = [
            UpBlock::load(source, &decoder_name(0), width(4), width(3))?,
            UpBlock::load(source, &decoder_name(1), width(3), width(2))?,
            UpBlock::load(source, &decoder_name(2), width(2), width(1))?,
            UpBlock::load(source, &decoder_name(3), width(1), width(0))?,
        ];
        let head = Conv2d::load(source, "out_conv", width(0), OUT_CHANNELS, 1, true)?;

        Ok(Self {
            base_channels,
            encoder,
            bottleneck,
            decoder,
            head,
        })
    }

    /// Build an untrained network.
    ///
    /// # Errors
    ///
    /// Returns an error if `base_channels` is zero.
    pub fn random(base_channels: usize, seed: Option<u64>) -> Result<Self> {
        Self::load(&mut RandomSource::new(seed), base_channels)
    }

    #[must_use]
    pub const fn base_channels(&self) -> usize {
        self.base_channels
    }

    /// Predict normalized chrominance for a batch of normalized luminance maps.
    ///
    /// # Arguments
    ///
    /// * `luminance` - Tensor in NCHW format (N, 1, H, W), H and W at least 16
    ///
    /// # Returns
    ///
    /// Tensor in NCHW format (N, 2, H, W), raw regression output.
    ///
    /// # Errors
    ///
    /// Returns an error if the input shape is unusable or the computation
    /// produces non-finite values.
    pub fn predict(&self, luminance: &LuminanceTensor) -> Result<ChrominanceTensor> {
        let (batch, channels, height, width) = luminance.dim();

        if channels != IN_CHANNELS {
            return Err(Error::ShapeMismatch {
                expected: format!("(N, {IN_CHANNELS}, H, W)"),
                actual: format!("{:?}", luminance.shape()),
            });
        }

        if height < DOWNSAMPLE_FACTOR || width < DOWNSAMPLE_FACTOR {
            return Err(Error::ShapeMismatch {
                expected: format!(
                    "spatial size of at least {DOWNSAMPLE_FACTOR}x{DOWNSAMPLE_FACTOR}"
                ),
                actual: format!("{height}x{width}"),
            });
        }

        let mut out = Array4::<f32>::zeros((batch, OUT_CHANNELS, height, width));
        for (input, mut output) in luminance.outer_iter().zip(out.outer_iter_mut()) {
            let ab = self.forward(&input.to_owned())?;
            output.assign(&ab);
        }

        if out.iter().any(|v| !v.is_finite()) {
            return Err(Error::Inference {
                reason: "network produced non-finite chrominance".to_string(),
            });
        }

        Ok(out)
    }

    /// Run one (1, H, W) luminance map through the network.
    fn forward(&self, input: &Array3<f32>) -> Result<Array3<f32>> {
        let mut skips: Vec<Array3<f32>> = Vec::with_capacity(DEPTH);
        let mut x = input.clone();

        for stage in &self.encoder {
            let features = stage.forward(&x)?;
            x = max_pool2x2(&features);
            skips.push(features);
        }

        x = self.bottleneck.forward(&x)?;

        for (stage, skip) in self.decoder.iter().zip(skips.iter().rev()) {
            x = stage.forward(&x, skip)?;
        }

        self.head.forward(&x)
    }

    /// Every parameter under its checkpoint name, in module order.
    #[must_use]
    pub fn named_tensors(&self) -> Vec<NamedTensor> {
        let mut out = Vec::new();
        for (i, stage) in self.encoder.iter().enumerate() {
            stage.export(&encoder_name(i), &mut out);
        }
        self.bottleneck.export("bottleneck", &mut out);
        for (i, stage) in self.decoder.iter().enumerate() {
            stage.export(&decoder_name(i), &mut out);
        }
        self.head.export("out_conv", &mut out);
        out
    }
}

//! Main pipeline: bytes in, colorized PNG bytes out.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::error::{Error, Result};
use crate::image::{self, ChrominanceTensor, LuminanceTensor, PreparedImage, DEFAULT_IMAGE_SIZE};
use crate::model::{
    load_checkpoint, ColorizationNet, LoadPolicy, LoadStatus, DEFAULT_BASE_CHANNELS,
    DOWNSAMPLE_FACTOR,
};

/// Checkpoint path used when none is configured.
pub const DEFAULT_CHECKPOINT: &str = "colorization_sdae_unet_best.safetensors";

/// Configuration for the colorization pipeline.
#[derive(Debug, Clone)]
pub struct Config {
    /// Square resolution the network runs at.
    pub image_size: u32,

    /// Width of the first encoder stage; must match the checkpoint.
    pub base_channels: usize,

    /// Path to the safetensors checkpoint.
    pub checkpoint: PathBuf,

    /// Whether an unusable checkpoint aborts startup.
    pub load_policy: LoadPolicy,

    /// Seed for untrained parameters when no checkpoint loads. None for random.
    pub seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            image_size: DEFAULT_IMAGE_SIZE,
            base_channels: DEFAULT_BASE_CHANNELS,
            checkpoint: PathBuf::from(DEFAULT_CHECKPOINT),
            load_policy: LoadPolicy::default(),
            seed: None,
        }
    }
}

impl Config {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any parameter is out of valid range.
    pub fn validate(&self) -> Result<()> {
        validate_image_size(self.image_size)?;

        if self.base_channels == 0 {
            return Err(Error::InvalidParameter {
                name: "base_channels".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

fn validate_image_size(image_size: u32) -> Result<()> {
    if (image_size as usize) < DOWNSAMPLE_FACTOR {
        return Err(Error::InvalidParameter {
            name: "image_size".to_string(),
            reason: format!("must be at least {DOWNSAMPLE_FACTOR}"),
        });
    }
    Ok(())
}

/// Colorizes images with a network loaded once and shared by every call.
///
/// Cloning is cheap; clones share the same parameters.
#[derive(Debug, Clone)]
pub struct Colorizer {
    net: Arc<ColorizationNet>,
    status: Arc<LoadStatus>,
    image_size: u32,
}

impl Colorizer {
    /// Create a colorizer, loading the configured checkpoint.
    ///
    /// A missing checkpoint never fails; see [`load_checkpoint`] for the
    /// handling of unusable ones.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, or if the checkpoint
    /// is unusable under [`LoadPolicy::Strict`].
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        tracing::info!("Initializing colorizer with config: {config:?}");

        let loaded = load_checkpoint(
            &config.checkpoint,
            config.base_channels,
            config.load_policy,
            config.seed,
        )?;

        Self::with_model(loaded.net, loaded.status, config.image_size)
    }

    /// Create a colorizer around an already built network.
    ///
    /// # Errors
    ///
    /// Returns an error if `image_size` is too small for the network.
    pub fn with_model(net: ColorizationNet, status: LoadStatus, image_size: u32) -> Result<Self> {
        validate_image_size(image_size)?;

        Ok(Self {
            net: Arc::new(net),
            status: Arc::new(status),
            image_size,
        })
    }

    /// How the parameters were obtained.
    #[must_use]
    pub fn status(&self) -> &LoadStatus {
        &self.status
    }

    /// Whether trained parameters are in use.
    #[must_use]
    pub fn model_loaded(&self) -> bool {
        self.status.is_loaded()
    }

    #[must_use]
    pub const fn image_size(&self) -> u32 {
        self.image_size
    }

    /// Decode `bytes` and extract normalized luminance at the inference resolution.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a usable image.
    pub fn prepare(&self, bytes: &[u8]) -> Result<PreparedImage> {
        image::prepare(bytes, self.image_size)
    }

    /// Predict normalized chrominance for normalized luminance.
    ///
    /// # Errors
    ///
    /// Returns an error if the forward computation fails.
    pub fn predict(&self, luminance: &LuminanceTensor) -> Result<ChrominanceTensor> {
        self.net.predict(luminance)
    }

    /// Colorize an encoded image and return PNG bytes of the same dimensions.
    ///
    /// # Errors
    ///
    /// Returns an error if decoding, inference or encoding fails.
    pub fn colorize(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        let started = Instant::now();

        let prepared = self.prepare(bytes)?;
        let chrominance = self.predict(&prepared.luminance)?;
        let png = image::finalize(&prepared.luminance, &chrominance, prepared.original_size)?;

        let (width, height) = prepared.original_size;
        tracing::debug!(
            "Colorized {width}x{height} image in {} ms",
            started.elapsed().as_millis()
        );

        Ok(png)
    }

    /// Colorize the image at `input_path` and write a PNG to `output_path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be read or written, or if
    /// colorization fails.
    pub fn process<P: AsRef<Path>, Q: AsRef<Path>>(
        &self,
        input_path: P,
        output_path: Q,
    ) -> Result<()> {
        let input_path = input_path.as_ref();
        let output_path = output_path.as_ref();

        tracing::info!("Processing image: {}", input_path.display());
        let bytes = fs::read(input_path)?;

        let png = self.colorize(&bytes)?;

        tracing::info!("Saving output to: {}", output_path.display());
        fs::write(output_path, png)?;

        Ok(())
    }
}

//! Sources of named layer parameters.

use ndarray::{ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::Result;

/// How a parameter is initialized when no trained value is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Init {
    /// `U(-1/sqrt(fan_in), 1/sqrt(fan_in))`, the default for convolution weights and biases.
    Uniform { fan_in: usize },
    /// All ones (normalization scale, running variance).
    Ones,
    /// All zeros (normalization shift, running mean).
    Zeros,
}

/// Supplies a tensor for every named parameter of the network.
///
/// Layers request their parameters by their full dotted name (for example
/// `enc1.block.0.weight`) together with the expected shape.
pub trait ParameterSource {
    /// Fetch the tensor called `name`, which must have exactly `shape`.
    ///
    /// # Errors
    ///
    /// Returns an error if the tensor is missing or has another shape.
    fn tensor(&mut self, name: &str, shape: &[usize], init: Init) -> Result<ArrayD<f32>>;
}

/// Fabricates untrained parameters.
pub struct RandomSource {
    rng: StdRng,
}

impl RandomSource {
    /// Create a source seeded for reproducibility, or from OS entropy when `seed` is `None`.
    #[must_use]
    pub fn new(seed: Option<u64>) -> Self {
        let rng = seed.map_or_else(StdRng::from_os_rng, StdRng::seed_from_u64);
        Self { rng }
    }
}

impl ParameterSource for RandomSource {
    #[allow(clippy::cast_precision_loss)]
    fn tensor(&mut self, _name: &str, shape: &[usize], init: Init) -> Result<ArrayD<f32>> {
        let shape = IxDyn(shape);
        let tensor = match init {
            Init::Uniform { fan_in } => {
                let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
                ArrayD::from_shape_simple_fn(shape, || self.rng.random_range(-bound..bound))
            }
            Init::Ones => ArrayD::ones(shape),
            Init::Zeros => ArrayD::zeros(shape),
        };
        Ok(tensor)
    }
}

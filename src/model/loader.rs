//! Checkpoint loading and saving.
//!
//! Checkpoints are safetensors files. The parameter mapping is either stored
//! directly (`enc1.block.0.weight`, ...) or nested under one of the wrapper keys
//! training runs have used over time (`model_state.enc1.block.0.weight`, ...).

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use ndarray::{ArrayD, IxDyn};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};

use crate::error::{Error, Result};

use super::layers::NamedTensor;
use super::net::ColorizationNet;
use super::params::{Init, ParameterSource};

/// Where the parameter mapping lives inside a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyLayout {
    /// Nested under `model_state`.
    ModelState,
    /// Nested under `model_state_dict`.
    ModelStateDict,
    /// Nested under `state_dict`.
    StateDict,
    /// The whole file is the parameter mapping.
    Bare,
}

impl KeyLayout {
    /// Wrapper layouts in resolution order.
    pub const WRAPPERS: [Self; 3] = [Self::ModelState, Self::ModelStateDict, Self::StateDict];

    /// The wrapper key, if any.
    #[must_use]
    pub const fn key(&self) -> Option<&'static str> {
        match self {
            Self::ModelState => Some("model_state"),
            Self::ModelStateDict => Some("model_state_dict"),
            Self::StateDict => Some("state_dict"),
            Self::Bare => None,
        }
    }

    /// Full tensor name of parameter `name` under this layout.
    #[must_use]
    pub fn qualify(&self, name: &str) -> String {
        match self.key() {
            Some(key) => format!("{key}.{name}"),
            None => name.to_string(),
        }
    }

    /// Parameter name of a tensor stored under this layout, if it belongs to it.
    #[must_use]
    pub fn strip<'a>(&self, full_name: &'a str) -> Option<&'a str> {
        match self.key() {
            Some(key) => full_name.strip_prefix(key)?.strip_prefix('.'),
            None => Some(full_name),
        }
    }

    /// Pick the layout of a checkpoint from its tensor names.
    ///
    /// The first wrapper that holds at least one tensor wins; otherwise the
    /// names are taken as bare parameter names.
    pub fn resolve<'a, I>(names: I) -> Self
    where
        I: IntoIterator<Item = &'a str> + Clone,
    {
        Self::WRAPPERS
            .into_iter()
            .find(|layout| names.clone().into_iter().any(|n| layout.strip(n).is_some()))
            .unwrap_or(Self::Bare)
    }
}

impl fmt::Display for KeyLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key().unwrap_or("bare"))
    }
}

/// What to do when a checkpoint exists but cannot be used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoadPolicy {
    /// Log the failure and continue with untrained parameters.
    #[default]
    Permissive,
    /// Return the failure. A missing file still falls back to untrained parameters.
    Strict,
}

/// Outcome of loading the model at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadStatus {
    /// Trained parameters were loaded.
    Loaded { path: PathBuf, layout: KeyLayout },
    /// No checkpoint file; parameters are untrained.
    Missing { path: PathBuf },
    /// The checkpoint could not be used; parameters are untrained.
    Failed { path: PathBuf, reason: String },
}

impl LoadStatus {
    /// Whether the network runs with trained parameters.
    #[must_use]
    pub const fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded { .. })
    }
}

/// A ready-to-run network and how it was obtained.
#[derive(Debug, Clone)]
pub struct LoadedModel {
    pub net: ColorizationNet,
    pub status: LoadStatus,
}

/// Load the network from a checkpoint, degrading to untrained parameters.
///
/// A missing file is logged as a warning. Other failures are logged as errors
/// under [`LoadPolicy::Permissive`] and returned under [`LoadPolicy::Strict`].
/// Callers that need trained output must check [`LoadStatus::is_loaded`].
///
/// # Errors
///
/// Returns an error in strict mode, or if `base_channels` is zero.
pub fn load_checkpoint<P: AsRef<Path>>(
    path: P,
    base_channels: usize,
    policy: LoadPolicy,
    seed: Option<u64>,
) -> Result<LoadedModel> {
    let path = path.as_ref();

    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(
                "Model file not found at {}. Inference will use random weights.",
                path.display()
            );
            return Ok(LoadedModel {
                net: ColorizationNet::random(base_channels, seed)?,
                status: LoadStatus::Missing {
                    path: path.to_path_buf(),
                },
            });
        }
        Err(err) => return degrade(path, checkpoint_error(path, err), base_channels, policy, seed),
    };

    match parse_checkpoint(path, &bytes, base_channels) {
        Ok((net, layout)) => {
            tracing::info!("Model loaded successfully from {} ({layout} layout)", path.display());
            Ok(LoadedModel {
                net,
                status: LoadStatus::Loaded {
                    path: path.to_path_buf(),
                    layout,
                },
            })
        }
        Err(err) => degrade(path, err, base_channels, policy, seed),
    }
}

fn degrade(
    path: &Path,
    err: Error,
    base_channels: usize,
    policy: LoadPolicy,
    seed: Option<u64>,
) -> Result<LoadedModel> {
    if policy == LoadPolicy::Strict {
        return Err(err);
    }

    tracing::error!("Error loading model: {err}. Inference will use random weights.");
    Ok(LoadedModel {
        net: ColorizationNet::random(base_channels, seed)?,
        status: LoadStatus::Failed {
            path: path.to_path_buf(),
            reason: err.to_string(),
        },
    })
}

fn checkpoint_error(path: &Path, reason: impl fmt::Display) -> Error {
    Error::Checkpoint {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

fn parse_checkpoint(
    path: &Path,
    bytes: &[u8],
    base_channels: usize,
) -> Result<(ColorizationNet, KeyLayout)> {
    let tensors = SafeTensors::deserialize(bytes).map_err(|e| checkpoint_error(path, e))?;
    let names = tensors.names();
    let layout = KeyLayout::resolve(names.iter().map(|n| n.as_str()));
    tracing::debug!("Checkpoint holds {} tensors, using {layout} layout", names.len());

    let mut source = CheckpointSource {
        path,
        tensors: &tensors,
        layout,
        consumed: HashSet::new(),
    };
    let net = ColorizationNet::load(&mut source, base_channels)?;

    let unexpected: Vec<&str> = names
        .iter()
        .filter_map(|n| layout.strip(n))
        .filter(|n| !n.ends_with("num_batches_tracked") && !source.consumed.contains(*n))
        .collect();
    if !unexpected.is_empty() {
        return Err(checkpoint_error(
            path,
            format!("unexpected parameters: {}", unexpected.join(", ")),
        ));
    }

    Ok((net, layout))
}

/// Serves parameters from a deserialized safetensors file.
struct CheckpointSource<'a, 'data> {
    path: &'a Path,
    tensors: &'a SafeTensors<'data>,
    layout: KeyLayout,
    consumed: HashSet<String>,
}

impl ParameterSource for CheckpointSource<'_, '_> {
    fn tensor(&mut self, name: &str, shape: &[usize], _init: Init) -> Result<ArrayD<f32>> {
        let full_name = self.layout.qualify(name);
        let view = self
            .tensors
            .tensor(&full_name)
            .map_err(|_| checkpoint_error(self.path, format!("missing parameter {full_name}")))?;

        if view.shape() != shape {
            return Err(checkpoint_error(
                self.path,
                format!(
                    "shape mismatch for {full_name}: expected {shape:?}, found {:?}",
                    view.shape()
                ),
            ));
        }

        let values = decode_values(&view).ok_or_else(|| {
            checkpoint_error(
                self.path,
                format!("unsupported dtype {:?} for {full_name}", view.dtype()),
            )
        })?;

        self.consumed.insert(name.to_string());
        ArrayD::from_shape_vec(IxDyn(shape), values).map_err(|e| checkpoint_error(self.path, e))
    }
}

/// Little-endian tensor bytes as f32, for the float dtypes a training run produces.
#[allow(clippy::cast_possible_truncation)]
fn decode_values(view: &TensorView<'_>) -> Option<Vec<f32>> {
    let data = view.data();
    match view.dtype() {
        Dtype::F32 => Some(
            data.chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        ),
        Dtype::F64 => Some(
            data.chunks_exact(8)
                .map(|c| {
                    f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32
                })
                .collect(),
        ),
        _ => None,
    }
}

/// Serialize named tensors as an f32 safetensors buffer.
///
/// # Errors
///
/// Returns an error if the tensors cannot be serialized.
pub fn serialize_tensors(tensors: &[NamedTensor]) -> Result<Vec<u8>> {
    let buffers: Vec<Vec<u8>> = tensors
        .iter()
        .map(|(_, t)| t.iter().flat_map(|v| v.to_le_bytes()).collect())
        .collect();

    let views = tensors
        .iter()
        .zip(buffers.iter())
        .map(|((name, t), data)| {
            TensorView::new(Dtype::F32, t.shape().to_vec(), data)
                .map(|view| (name.clone(), view))
                .map_err(|e| Error::InvalidParameter {
                    name: name.clone(),
                    reason: e.to_string(),
                })
        })
        .collect::<Result<Vec<_>>>()?;

    safetensors::serialize(views, &None).map_err(|e| Error::InvalidParameter {
        name: "checkpoint".to_string(),
        reason: e.to_string(),
    })
}

/// Write the network's parameters to `path` under `layout`.
///
/// The file is written next to its destination first and then renamed.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn save_checkpoint<P: AsRef<Path>>(
    net: &ColorizationNet,
    path: P,
    layout: KeyLayout,
) -> Result<()> {
    let path = path.as_ref();

    let tensors: Vec<NamedTensor> = net
        .named_tensors()
        .into_iter()
        .map(|(name, t)| (layout.qualify(&name), t))
        .collect();
    let bytes = serialize_tensors(&tensors)?;

    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, bytes)?;
    fs::rename(&temp_path, path)?;

    tracing::info!("Saved {} parameters to {} ({layout} layout)", tensors.len(), path.display());
    Ok(())
}

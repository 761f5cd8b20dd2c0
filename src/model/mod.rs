//! The chrominance predictor and its checkpoint handling.

mod layers;
mod loader;
mod net;
mod params;

pub use layers::NamedTensor;
pub use loader::{
    load_checkpoint, save_checkpoint, serialize_tensors, KeyLayout, LoadPolicy, LoadStatus,
    LoadedModel,
};
pub use net::{
    ColorizationNet, ConvBlock, UpBlock, DEFAULT_BASE_CHANNELS, DEPTH, DOWNSAMPLE_FACTOR,
};
pub use params::{Init, ParameterSource, RandomSource};

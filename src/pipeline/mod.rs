//! End-to-end colorization pipeline.

mod colorize;

pub use colorize::{Colorizer, Config, DEFAULT_CHECKPOINT};

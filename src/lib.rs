//! # colorizer
//!
//! Turns a grayscale image into a plausible color image.
//!
//! The image is converted to CIE Lab, its lightness is fed to a U-shaped
//! encoder-decoder network that predicts the two chrominance channels, and the
//! result is converted back to sRGB at the original resolution.
//!
//! ## Example
//!
//! ```no_run
//! use colorizer::{Colorizer, Config};
//!
//! # fn main() -> colorizer::Result<()> {
//! let colorizer = Colorizer::new(Config::default())?;
//! if !colorizer.model_loaded() {
//!     eprintln!("running with untrained weights");
//! }
//!
//! colorizer.process("grayscale.jpg", "colorized.png")?;
//! # Ok(())
//! # }
//! ```

pub mod color;
pub mod error;
pub mod image;
pub mod model;
pub mod pipeline;
pub mod server;

pub use error::{Error, Result};
pub use model::{LoadPolicy, LoadStatus};
pub use pipeline::{Colorizer, Config};

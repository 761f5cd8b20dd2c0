//! Custom error types for colorizer.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the colorizer library.
#[derive(Error, Debug)]
pub enum Error {
    /// The input bytes are not a decodable image.
    #[error("failed to decode image: {source}")]
    Decode {
        #[source]
        source: image::ImageError,
    },

    /// The input was recognized but its format or color mode cannot be used.
    #[error("unsupported image format: {reason}")]
    UnsupportedFormat { reason: String },

    /// Image dimensions are not supported.
    #[error("unsupported image dimensions {width}x{height}: {reason}")]
    UnsupportedDimensions {
        width: u32,
        height: u32,
        reason: String,
    },

    /// Failed to encode the output image.
    #[error("failed to encode output image: {source}")]
    Encode {
        #[source]
        source: image::ImageError,
    },

    /// The forward computation failed.
    #[error("model inference failed: {reason}")]
    Inference { reason: String },

    /// Shape mismatch in tensor operations.
    #[error("tensor shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },

    /// Failed to load a checkpoint.
    #[error("failed to load checkpoint {path}: {reason}")]
    Checkpoint { path: PathBuf, reason: String },

    /// Invalid parameter value.
    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the failure was caused by the caller's input rather than the server.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Decode { .. }
                | Self::UnsupportedFormat { .. }
                | Self::UnsupportedDimensions { .. }
        )
    }
}

/// Result type alias for colorizer operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_error_classification() {
        let err = Error::UnsupportedFormat {
            reason: "cmyk".to_string(),
        };
        assert!(err.is_client_error());

        let err = Error::Inference {
            reason: "out of memory".to_string(),
        };
        assert!(!err.is_client_error());
    }
}

//! Error types for the driver protocol layer

use std::path::PathBuf;
use thiserror::Error;

/// Failures that propagate to the caller instead of being absorbed into a
/// `DriverOutput`. Protocol-level trouble (crashes, timeouts, hung children)
/// is reported through `DriverOutput` fields, never through these variants.
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("failed to launch runner {path}: {source}")]
    Spawn {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("image hash supplied for '{0}' without requesting a pixel test")]
    ImageHashWithoutPixelTest(String),

    #[error("unknown url type: {0}")]
    UnknownUrl(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type DriverResult<T> = Result<T, DriverError>;

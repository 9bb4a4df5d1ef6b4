//! Configuration loading errors.

use thiserror::Error;

/// Errors raised while loading or validating configuration.
///
/// All of these are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigLoadError {
    /// File could not be read.
    #[error("config IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON was malformed or carried unknown keys.
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// Values were readable but semantically invalid.
    #[error("config validation error: {0}")]
    Validation(String),
}

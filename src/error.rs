//! Error types for the Ursa rate limiter.

use thiserror::Error;

/// Main error type for Ursa operations.
///
/// Only configuration loading can fail. Admission decisions, including
/// rejections, are values and never errors.
#[derive(Error, Debug)]
pub enum UrsaError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed YAML in a rules file
    #[error("Rules parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Invalid path or value pattern
    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl UrsaError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        UrsaError::Config(msg.into())
    }
}

/// Result type alias for Ursa operations.
pub type Result<T> = std::result::Result<T, UrsaError>;

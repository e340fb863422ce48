//! Error types for compete-cnn-rs.
//!
//! Two failure classes are part of the training contract rather than plain
//! plumbing errors:
//!
//! - [`CompeteError::EmptyValidation`]: every validation batch of an epoch
//!   was skipped by the competition mask, so the mean validation error is
//!   undefined.
//! - [`CompeteError::ModelLoad`]: testing was requested but no trained
//!   checkpoint exists.
//!
//! # Example
//!
//! ```rust
//! use compete_cnn_rs::{CompeteConfig, CompeteError};
//!
//! let mut config = CompeteConfig::default();
//! config.batch_size = 0;
//!
//! match config.validate() {
//!     Err(CompeteError::Config(msg)) => assert!(msg.contains("batch_size")),
//!     other => panic!("unexpected: {other:?}"),
//! }
//! ```

use thiserror::Error;

/// Result type alias for compete-cnn-rs operations.
pub type Result<T> = std::result::Result<T, CompeteError>;

/// Errors that can occur while training or testing the competition network.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CompeteError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid configuration file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Dataset error.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// Training error.
    #[error("training error: {0}")]
    Training(String),

    /// Every validation batch of an epoch was masked out.
    #[error("validation error undefined at epoch {epoch}: all validation batches were skipped")]
    EmptyValidation {
        /// Epoch whose validation pass produced no usable batch.
        epoch: usize,
    },

    /// Testing without a trained checkpoint.
    #[error("failed to load a trained model: {0}")]
    ModelLoad(String),

    /// Checkpoint error.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Progress bar template error.
    #[error("template error: {0}")]
    Template(String),
}

impl From<indicatif::style::TemplateError> for CompeteError {
    fn from(err: indicatif::style::TemplateError) -> Self {
        CompeteError::Template(err.to_string())
    }
}

impl CompeteError {
    /// Create a dataset error.
    pub fn dataset(msg: impl Into<String>) -> Self {
        Self::Dataset(msg.into())
    }

    /// Create a training error.
    pub fn training(msg: impl Into<String>) -> Self {
        Self::Training(msg.into())
    }
}

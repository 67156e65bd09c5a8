//! Error types for cuantizar
//!
//! Failures propagate unmodified to the caller; nothing here retries or
//! rolls back partially written artifacts.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for cuantizar operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while loading, transforming or exporting a model
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be read, parsed or validated
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Serialization or deserialization of a model file failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Checkpoint file does not exist
    #[error("Checkpoint not found: {}", .0.display())]
    CheckpointNotFound(PathBuf),

    /// Checkpoint is missing a required record entry
    #[error("Checkpoint {} is missing required entry '{key}'", .path.display())]
    MissingCheckpointEntry { path: PathBuf, key: String },

    /// State dict lacks keys the model expects
    #[error("Missing keys in state dict: {0:?}")]
    MissingKeys(Vec<String>),

    /// State dict carries keys the model does not have
    #[error("Unexpected keys in state dict: {0:?}")]
    UnexpectedKeys(Vec<String>),

    /// Tensor shape does not match the model's expectation
    #[error("Shape mismatch for {key}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        key: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Dotted module path does not resolve in the module tree
    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    /// Operation is not supported for the given module or tensor
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Model name is not registered
    #[error("Unknown model: {0}")]
    UnknownModel(String),

    /// Dataset could not be loaded or is malformed
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Experiment tracking failure
    #[error("Tracking error: {0}")]
    Tracking(#[from] crate::tracking::TrackingError),
}

impl Error {
    /// Convenience constructor for shape mismatches
    pub fn shape_mismatch(key: impl Into<String>, expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            key: key.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_mismatch_display() {
        let err = Error::shape_mismatch("features.0.weight", &[4, 3, 3, 3], &[8, 3, 3, 3]);
        let msg = err.to_string();
        assert!(msg.contains("features.0.weight"));
        assert!(msg.contains("[4, 3, 3, 3]"));
        assert!(msg.contains("[8, 3, 3, 3]"));
    }

    #[test]
    fn test_checkpoint_not_found_display() {
        let err = Error::CheckpointNotFound(PathBuf::from("/tmp/missing.pth"));
        assert!(err.to_string().contains("/tmp/missing.pth"));
    }

    #[test]
    fn test_io_error_converts() {
        fn fails() -> Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"))?;
            Ok(())
        }
        assert!(matches!(fails(), Err(Error::Io(_))));
    }

    #[test]
    fn test_module_not_found_names_path() {
        let err = Error::ModuleNotFound("features.9".into());
        assert_eq!(err.to_string(), "Module not found: features.9");
    }
}

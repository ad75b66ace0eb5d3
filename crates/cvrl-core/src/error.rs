//! Error type for every failure in the contrastive training stack.
//!
//! # Error Categories
//!
//! | Category | Variants | Recovery Strategy |
//! |----------|----------|-------------------|
//! | Selection | UnknownModel, UnknownArch | Fix the selector string |
//! | Configuration | QueueCapacity, InvalidHyperparameter, Config | Fix configuration |
//! | Validation | ShapeMismatch, EmptyBatch | Fix input data |
//! | Persistence | Checkpoint, CheckpointMismatch, Io, Csv | Fix file or architecture |
//! | Processing | Tensor, Dataset, Internal | None, these indicate a bug or bad data |
//!
//! Every failure here is a programmer or configuration error. Nothing is
//! retried.

use thiserror::Error;

/// Error type for model construction, training, evaluation and persistence.
#[derive(Debug, Error)]
pub enum CvrlError {
    // === Selection Errors ===
    /// Model selector tag is not one of the supported variants.
    #[error("Unknown model '{name}': expected one of mocov1, mocov2, simclrv1, simclrv2")]
    UnknownModel { name: String },

    /// Backbone architecture name is not supported.
    #[error("Unknown architecture '{name}': expected one of resnet18, resnet34, resnet50")]
    UnknownArch { name: String },

    // === Configuration Errors ===
    /// Queue capacity is not a multiple of the enqueue batch size.
    #[error("Queue capacity {capacity} is not divisible by enqueue batch size {batch}")]
    QueueCapacity { capacity: usize, batch: usize },

    /// A scalar hyperparameter is outside its valid range.
    #[error("Invalid hyperparameter {name}={value}: {reason}")]
    InvalidHyperparameter {
        name: &'static str,
        value: String,
        reason: String,
    },

    /// Configuration file invalid or unreadable.
    #[error("Configuration error: {message}")]
    Config { message: String },

    // === Validation Errors ===
    /// Tensor shape does not match what the operation requires.
    #[error("Shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Operation received a batch with no samples.
    #[error("Empty batch passed to {context}")]
    EmptyBatch { context: String },

    // === Persistence Errors ===
    /// Checkpoint could not be read, parsed or written.
    #[error("Checkpoint error: {message}")]
    Checkpoint { message: String },

    /// Strict checkpoint load found names that do not line up with the model.
    #[error(
        "Checkpoint does not match model: {} missing, {} unexpected (first missing: {:?}, first unexpected: {:?})",
        missing.len(),
        unexpected.len(),
        missing.first(),
        unexpected.first()
    )]
    CheckpointMismatch {
        missing: Vec<String>,
        unexpected: Vec<String>,
    },

    /// File I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Statistics table could not be written.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    // === Processing Errors ===
    /// Tensor backend operation failed.
    #[error("Tensor error: {message}")]
    Tensor { message: String },

    /// Dataset files missing or malformed.
    #[error("Dataset error: {message}")]
    Dataset { message: String },

    /// Internal error (should not occur in normal operation).
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Result type alias for cvrl operations.
pub type CvrlResult<T> = Result<T, CvrlError>;

impl CvrlError {
    /// Wrap a candle error with the call site that produced it.
    pub fn tensor(context: &str, err: candle_core::Error) -> Self {
        CvrlError::Tensor {
            message: format!("{}: {}", context, err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_model_lists_variants() {
        let err = CvrlError::UnknownModel {
            name: "byol".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("byol"));
        assert!(msg.contains("mocov1"));
        assert!(msg.contains("simclrv2"));
    }

    #[test]
    fn test_queue_capacity_message() {
        let err = CvrlError::QueueCapacity {
            capacity: 4096,
            batch: 300,
        };
        let msg = err.to_string();
        assert!(msg.contains("4096"));
        assert!(msg.contains("300"));
    }

    #[test]
    fn test_checkpoint_mismatch_counts() {
        let err = CvrlError::CheckpointMismatch {
            missing: vec!["encoder_q.g.weight".to_string()],
            unexpected: vec!["fc.weight".to_string(), "fc.bias".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("1 missing"));
        assert!(msg.contains("2 unexpected"));
        assert!(msg.contains("encoder_q.g.weight"));
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "data_batch_1.bin");
        let err: CvrlError = io.into();
        assert!(matches!(err, CvrlError::Io(_)));
        assert!(err.to_string().contains("data_batch_1.bin"));
    }

    #[test]
    fn test_tensor_error_keeps_context() {
        let err = CvrlError::tensor("queue enqueue", candle_core::Error::Msg("boom".into()));
        let msg = err.to_string();
        assert!(msg.contains("queue enqueue"));
        assert!(msg.contains("boom"));
    }
}

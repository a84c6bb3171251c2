//! Error types for try-on jobs
//!
//! Every failure that leaves the orchestrator is one of the [`ErrorKind`]s
//! below. Collaborator and I/O errors are translated at the boundary.

use crate::inference::ModelKind;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for try-on operations
pub type Result<T> = std::result::Result<T, TryOnError>;

/// Error taxonomy for try-on operations
#[derive(Error, Debug)]
pub enum TryOnError {
    /// Segmentation found no pixels of the requested garment classes
    #[error("Segmentation found no '{category}' garment region")]
    SegmentationEmpty { category: String },

    /// A configuration value is outside its safe range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Waiting for the inference gate exceeded the configured bound
    #[error("Inference gate still busy after {waited_ms}ms")]
    ResourceBusyTimeout { waited_ms: u64 },

    /// An external model call failed
    #[error("{model} model failed: {message}")]
    ModelFailure {
        model: ModelKind,
        message: String,
        out_of_memory: bool,
    },

    /// The whole-job deadline passed
    #[error("Job exceeded its {limit_ms}ms deadline")]
    Timeout { limit_ms: u64 },

    /// The job was cancelled by its caller
    #[error("Job cancelled")]
    Cancelled,

    /// Uploaded data could not be accepted
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Result handoff to the store failed
    #[error("Result storage failed: {0}")]
    Storage(String),

    /// A pipeline invariant was violated
    #[error("Internal error: {0}")]
    Internal(String),

    /// Input/output errors (file not found, permission denied, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Image decoding or encoding errors
    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),
}

/// Flat, serializable view of [`TryOnError`] variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    SegmentationEmpty,
    InvalidConfig,
    ResourceBusyTimeout,
    ModelFailure,
    Timeout,
    Cancelled,
    InvalidInput,
    Storage,
    Internal,
}

impl ErrorKind {
    /// HTTP status code an API layer should answer with
    #[must_use]
    pub fn http_status(self) -> u16 {
        match self {
            Self::InvalidConfig | Self::InvalidInput => 400,
            Self::Cancelled => 409,
            Self::SegmentationEmpty => 422,
            Self::ResourceBusyTimeout => 503,
            Self::Timeout => 504,
            Self::ModelFailure | Self::Storage | Self::Internal => 500,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

impl TryOnError {
    /// Create a new invalid configuration error
    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a new invalid input error
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a new storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a collaborator failure
    pub fn model_failure<S: Into<String>>(model: ModelKind, msg: S) -> Self {
        Self::ModelFailure {
            model,
            message: msg.into(),
            out_of_memory: false,
        }
    }

    /// Create a collaborator failure caused by device memory exhaustion
    pub fn out_of_memory<S: Into<String>>(model: ModelKind, msg: S) -> Self {
        Self::ModelFailure {
            model,
            message: msg.into(),
            out_of_memory: true,
        }
    }

    /// Create an empty-segmentation error for a garment category
    pub fn segmentation_empty<S: ToString>(category: S) -> Self {
        Self::SegmentationEmpty {
            category: category.to_string(),
        }
    }

    /// Create configuration error with valid ranges
    pub fn config_value_error<T: std::fmt::Display>(
        parameter: &str,
        value: T,
        valid_range: &str,
    ) -> Self {
        Self::InvalidConfig(format!(
            "Invalid {}: {} (valid range: {})",
            parameter, value, valid_range
        ))
    }

    /// Taxonomy kind of this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SegmentationEmpty { .. } => ErrorKind::SegmentationEmpty,
            Self::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Self::ResourceBusyTimeout { .. } => ErrorKind::ResourceBusyTimeout,
            Self::ModelFailure { .. } => ErrorKind::ModelFailure,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Internal(_) | Self::Io(_) | Self::Image(_) => ErrorKind::Internal,
        }
    }

    /// Whether the failure left the device in an out-of-memory state
    #[must_use]
    pub fn is_out_of_memory(&self) -> bool {
        matches!(
            self,
            Self::ModelFailure {
                out_of_memory: true,
                ..
            }
        )
    }

    /// Whether retrying the same request later could succeed
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ResourceBusyTimeout | ErrorKind::Timeout | ErrorKind::ModelFailure
        )
    }

    /// Collapse raw I/O and image errors into taxonomy kinds
    #[must_use]
    pub fn into_taxonomy(self) -> Self {
        match self {
            Self::Io(e) => Self::Internal(format!("I/O failure: {e}")),
            Self::Image(e) => Self::Internal(format!("image buffer failure: {e}")),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            TryOnError::segmentation_empty("lower").kind(),
            ErrorKind::SegmentationEmpty
        );
        assert_eq!(
            TryOnError::invalid_config("x").kind(),
            ErrorKind::InvalidConfig
        );
        assert_eq!(
            TryOnError::ResourceBusyTimeout { waited_ms: 5 }.kind(),
            ErrorKind::ResourceBusyTimeout
        );
        assert_eq!(TryOnError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            TryOnError::out_of_memory(ModelKind::Inpaint, "CUDA OOM").kind(),
            ErrorKind::ModelFailure
        );
    }

    #[test]
    fn test_out_of_memory_flag() {
        assert!(TryOnError::out_of_memory(ModelKind::Inpaint, "oom").is_out_of_memory());
        assert!(!TryOnError::model_failure(ModelKind::Pose, "bad").is_out_of_memory());
    }

    #[test]
    fn test_http_status() {
        assert_eq!(ErrorKind::SegmentationEmpty.http_status(), 422);
        assert_eq!(ErrorKind::InvalidConfig.http_status(), 400);
        assert_eq!(ErrorKind::ResourceBusyTimeout.http_status(), 503);
        assert_eq!(ErrorKind::Timeout.http_status(), 504);
        assert_eq!(ErrorKind::ModelFailure.http_status(), 500);
    }

    #[test]
    fn test_io_errors_are_translated() {
        let err: TryOnError = std::io::Error::new(std::io::ErrorKind::Other, "disk").into();
        let translated = err.into_taxonomy();
        assert!(matches!(translated, TryOnError::Internal(_)));
        assert!(translated.to_string().contains("disk"));
    }

    #[test]
    fn test_config_value_error_message() {
        let err = TryOnError::config_value_error("refiner_strength", 0.5, "0.15-0.30");
        let msg = err.to_string();
        assert!(msg.contains("refiner_strength"));
        assert!(msg.contains("0.5"));
        assert!(msg.contains("0.15-0.30"));
    }

    #[test]
    fn test_error_kind_serde() {
        let json = serde_json::to_string(&ErrorKind::SegmentationEmpty).unwrap();
        assert_eq!(json, "\"SegmentationEmpty\"");
        let back: ErrorKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ErrorKind::SegmentationEmpty);
    }
}

//! Error type for the model and deployment layers.

use thiserror::Error;

use pocketvision_core::TensorError;

/// Errors raised while building, converting or serializing models.
#[derive(Debug, Error)]
pub enum NeuralError {
    /// Batch normalization has already been folded into the convolution.
    #[error("convolution and batch norm are already fused")]
    AlreadyFused,

    /// A block schedule that cannot form a valid model.
    #[error("invalid block schedule: {0}")]
    InvalidSchedule(String),

    /// Conversion to the quantized form requires at least one observed sample.
    #[error("calibration requires at least one sample")]
    EmptyCalibration,

    /// The requested operation does not apply to the model's current form.
    #[error("{operation}: {reason}")]
    InvalidOperation { operation: String, reason: String },

    /// An op the accelerator delegate cannot represent.
    #[error("op `{op}` has no accelerator lowering")]
    NotLowerable { op: String },

    /// A serialized artifact that cannot be read back.
    #[error("malformed artifact {path}: {reason}")]
    MalformedArtifact { path: String, reason: String },

    #[error(transparent)]
    Tensor(#[from] TensorError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("header encoding: {0}")]
    Json(#[from] serde_json::Error),
}

impl NeuralError {
    pub fn invalid_operation(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidOperation {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    pub fn malformed_artifact(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedArtifact {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, NeuralError>;

use thiserror::Error;

/// Error type shared by the tensor container, the CPU kernels and the
/// quantization primitives.
#[derive(Error, Debug)]
pub enum TensorError {
    #[error("Shape mismatch in operation '{operation}': expected {expected}, got {got}")]
    ShapeMismatch {
        operation: String,
        expected: String,
        got: String,
    },

    #[error("Invalid argument in operation '{operation}': {reason}")]
    InvalidArgument { operation: String, reason: String },

    #[error("Operation '{operation}' not supported: {reason}")]
    UnsupportedOperation { operation: String, reason: String },

    #[error("Serialization error in operation '{operation}': {details}")]
    SerializationError { operation: String, details: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TensorError {
    pub fn shape_mismatch(
        operation: impl Into<String>,
        expected: impl Into<String>,
        got: impl Into<String>,
    ) -> Self {
        Self::ShapeMismatch {
            operation: operation.into(),
            expected: expected.into(),
            got: got.into(),
        }
    }

    pub fn invalid_argument(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    pub fn unsupported_operation(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UnsupportedOperation {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    pub fn serialization_error(operation: impl Into<String>, details: impl Into<String>) -> Self {
        Self::SerializationError {
            operation: operation.into(),
            details: details.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TensorError>;

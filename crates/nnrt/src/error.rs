use std::io;

use thiserror::Error;

use crate::backend::BackendError;
use crate::ir::OperationIndex;

/// Failure raised by any compile or execute call.
///
/// Every variant is fatal to the call that produced it; no partial artifact or partial output
/// is returned.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid combination of compiler options.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Package, model or subgraph shape that the compiler does not support.
    #[error("unsupported model: {0}")]
    UnsupportedModel(String),
    /// Shape inference or shape validation found inconsistent operand shapes.
    #[error("shape mismatch at {operation}: {detail}")]
    ShapeMismatch {
        operation: OperationRef,
        detail: String,
    },
    /// No trainable counterpart or gradient rule exists for an operation kind.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),
    /// Runtime data violates a kernel precondition.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// No backend accepted an operation, or a backend failed to build a kernel.
    #[error("backend error: {0}")]
    Backend(String),
    /// A kernel failed while the schedule was running.
    #[error("execution failed: {0}")]
    Execution(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Location attached to shape errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationRef {
    Operation(OperationIndex),
    Graph,
}

impl std::fmt::Display for OperationRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationRef::Operation(index) => write!(f, "operation {index}"),
            OperationRef::Graph => write!(f, "graph boundary"),
        }
    }
}

impl Error {
    pub fn shape_mismatch(operation: OperationIndex, detail: impl Into<String>) -> Self {
        Error::ShapeMismatch {
            operation: OperationRef::Operation(operation),
            detail: detail.into(),
        }
    }

    pub fn graph_shape_mismatch(detail: impl Into<String>) -> Self {
        Error::ShapeMismatch {
            operation: OperationRef::Graph,
            detail: detail.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration(message.into())
    }

    pub fn unsupported_model(message: impl Into<String>) -> Self {
        Error::UnsupportedModel(message.into())
    }

    pub fn unsupported_operation(message: impl Into<String>) -> Self {
        Error::UnsupportedOperation(message.into())
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Error::InvalidInput(message.into())
    }
}

impl From<BackendError> for Error {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::InvalidInput(message) => Error::InvalidInput(message),
            BackendError::ShapeMismatch(message) => Error::graph_shape_mismatch(message),
            BackendError::Unimplemented { op, reason } => {
                Error::UnsupportedOperation(format!("{op}: {reason}"))
            }
            BackendError::Execution { message } => Error::Execution(message),
            BackendError::Nested(inner) => *inner,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

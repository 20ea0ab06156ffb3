//! Capability contracts implemented by execution backends.
//!
//! A [`Backend`] decides, per operation and with resolved operand shapes, whether it can run
//! that operation and hands out a [`Kernel`] when it can. Kernels compute on host tensors;
//! buffer placement and aliasing are decided by the memory planner, not by the kernel.

mod builtin;
pub mod registry;

use std::sync::Arc;

use thiserror::Error;

use crate::error::{Error, Result};
use crate::ir::{Graph, OperationIndex, Operation, SubgraphIndex};
use crate::tensor::{DType, HostTensor};

pub use builtin::{BuiltinBackend, BUILTIN_BACKEND};

/// Failure reported by a backend or one of its kernels.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("{op} is not implemented: {reason}")]
    Unimplemented { op: &'static str, reason: String },
    #[error("backend execution failure: {message}")]
    Execution { message: String },
    /// Error raised by a nested subgraph run, forwarded unchanged.
    #[error(transparent)]
    Nested(Box<Error>),
}

impl BackendError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        BackendError::InvalidInput(message.into())
    }

    pub fn shape_mismatch(message: impl Into<String>) -> Self {
        BackendError::ShapeMismatch(message.into())
    }

    pub fn unimplemented(op: &'static str, reason: impl Into<String>) -> Self {
        BackendError::Unimplemented {
            op,
            reason: reason.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution {
            message: message.into(),
        }
    }
}

impl From<Error> for BackendError {
    fn from(err: Error) -> Self {
        BackendError::Nested(Box::new(err))
    }
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Runs child subgraphs on behalf of control-flow kernels.
pub trait SubgraphRunner: Sync {
    fn run_subgraph(&self, subgraph: SubgraphIndex, inputs: Vec<HostTensor>)
        -> Result<Vec<HostTensor>>;

    /// Min/max run the current execution belongs to, if recording is on.
    fn minmax_run(&self) -> Option<usize> {
        None
    }
}

/// Per-invocation information handed to a kernel.
#[derive(Clone, Copy)]
pub struct KernelContext<'a> {
    operation: OperationIndex,
    runner: Option<&'a dyn SubgraphRunner>,
}

impl<'a> KernelContext<'a> {
    pub fn new(operation: OperationIndex, runner: Option<&'a dyn SubgraphRunner>) -> Self {
        Self { operation, runner }
    }

    pub fn operation(&self) -> OperationIndex {
        self.operation
    }

    pub fn runner(&self) -> BackendResult<&'a dyn SubgraphRunner> {
        self.runner.ok_or_else(|| {
            BackendError::execution(format!(
                "operation {} needs a subgraph runner but none was provided",
                self.operation
            ))
        })
    }
}

/// Executable form of one lowered operation.
pub trait Kernel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Computes the operation's outputs from contiguous inputs.
    fn run(&self, inputs: &[&HostTensor], cx: &KernelContext<'_>) -> BackendResult<Vec<HostTensor>>;

    /// Gradients w.r.t. each input, `None` where an input takes no gradient.
    ///
    /// `output_grads` has one entry per operation output.
    fn backward(
        &self,
        inputs: &[&HostTensor],
        outputs: &[&HostTensor],
        output_grads: &[&HostTensor],
        cx: &KernelContext<'_>,
    ) -> BackendResult<Vec<Option<HostTensor>>> {
        let _ = (inputs, outputs, output_grads, cx);
        Err(BackendError::unimplemented(
            self.name(),
            "backward is not available for this kernel",
        ))
    }
}

/// Execution backend capability.
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    /// Accepts or rejects `operation`; operand shapes in `graph` are already resolved.
    fn supports(&self, operation: &Operation, graph: &Graph) -> bool;

    /// Builds the kernel for an accepted operation.
    fn kernel(&self, operation: &Operation, graph: &Graph) -> BackendResult<Arc<dyn Kernel>>;

    /// Whether operands on this backend may alias a parent buffer window.
    fn supports_subtensor(&self) -> bool {
        false
    }

    /// Tensor pool hook used when the executor allocates an owned buffer.
    fn allocate(&self, dtype: DType, dims: &[usize]) -> HostTensor {
        HostTensor::zeros(dtype, dims)
    }
}

impl std::fmt::Debug for dyn Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Backend({})", self.name())
    }
}

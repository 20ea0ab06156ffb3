use std::sync::Arc;

use nnrt::backend::{Backend, BackendError, BackendResult, Kernel};
use nnrt::ir::{Graph, OpKind, Operation};
use nnrt::tensor::DType;

use crate::kernels::activation::ActivationKernel;
use crate::kernels::arithmetic::ArithmeticKernel;
use crate::kernels::concat::ConcatKernel;
use crate::kernels::fully_connected::FullyConnectedKernel;
use crate::kernels::layout::{PermuteKernel, ReshapeKernel, TransposeKernel};
use crate::kernels::loss::LossKernel;
use crate::kernels::normalize::{L2NormalizeKernel, SoftmaxKernel};

/// Single-threaded f32 backend covering every non-control-flow operation kind.
#[derive(Debug, Clone)]
pub struct CpuBackend {
    name: &'static str,
    subtensor: bool,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self {
            name: "cpu",
            subtensor: true,
        }
    }

    /// Same kernels, but concat inputs always get their own buffers.
    pub fn without_subtensor() -> Self {
        Self {
            name: "cpu-plain",
            subtensor: false,
        }
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for CpuBackend {
    fn name(&self) -> &str {
        self.name
    }

    fn supports(&self, operation: &Operation, graph: &Graph) -> bool {
        if operation.kind.is_control_flow() {
            return false;
        }
        operation
            .inputs
            .iter()
            .chain(operation.outputs.iter())
            .all(|operand| graph.operand(*operand).dtype() == DType::F32)
    }

    fn kernel(&self, operation: &Operation, graph: &Graph) -> BackendResult<Arc<dyn Kernel>> {
        let kernel: Arc<dyn Kernel> = match &operation.kind {
            OpKind::BinaryArithmetic { kind, activation } => Arc::new(ArithmeticKernel {
                kind: *kind,
                activation: *activation,
            }),
            OpKind::FullyConnected { activation } => Arc::new(FullyConnectedKernel {
                activation: *activation,
            }),
            OpKind::ElementwiseActivation(activation) => Arc::new(ActivationKernel {
                activation: *activation,
            }),
            OpKind::Concat { axis, activation } => Arc::new(ConcatKernel {
                axis: *axis,
                activation: *activation,
            }),
            OpKind::Reshape { .. } => {
                let output = operation.outputs.first().ok_or_else(|| {
                    BackendError::execution("Reshape needs an output operand")
                })?;
                let dims = graph.operand(*output).shape().static_dims().ok_or_else(|| {
                    BackendError::shape_mismatch("Reshape output shape is unresolved")
                })?;
                Arc::new(ReshapeKernel { dims })
            }
            OpKind::Softmax { beta } => Arc::new(SoftmaxKernel { beta: *beta }),
            OpKind::Transpose { perm } => Arc::new(TransposeKernel { perm: perm.clone() }),
            OpKind::L2Normalize => Arc::new(L2NormalizeKernel),
            OpKind::Permute => Arc::new(PermuteKernel),
            OpKind::Loss { kind } => Arc::new(LossKernel { kind: *kind }),
            OpKind::Call { .. } | OpKind::If { .. } => {
                return Err(BackendError::unimplemented(
                    operation.name(),
                    "control flow runs on the builtin backend",
                ))
            }
        };
        tracing::trace!(backend = self.name, kernel = kernel.name(), "kernel built");
        Ok(kernel)
    }

    fn supports_subtensor(&self) -> bool {
        self.subtensor
    }
}

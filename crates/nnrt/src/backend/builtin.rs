use std::sync::Arc;

use crate::ir::{Graph, OpKind, Operation, SubgraphIndex};
use crate::tensor::HostTensor;

use super::{Backend, BackendError, BackendResult, Kernel, KernelContext};

pub const BUILTIN_BACKEND: &str = "builtin";

/// Owned by the core; runs control-flow operations by calling into child subgraph executors.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinBackend;

impl Backend for BuiltinBackend {
    fn name(&self) -> &str {
        BUILTIN_BACKEND
    }

    fn supports(&self, operation: &Operation, _graph: &Graph) -> bool {
        operation.kind.is_control_flow()
    }

    fn kernel(&self, operation: &Operation, _graph: &Graph) -> BackendResult<Arc<dyn Kernel>> {
        match &operation.kind {
            OpKind::Call { subgraph } => Ok(Arc::new(CallKernel {
                subgraph: *subgraph,
            })),
            OpKind::If {
                then_subgraph,
                else_subgraph,
            } => Ok(Arc::new(IfKernel {
                then_subgraph: *then_subgraph,
                else_subgraph: *else_subgraph,
            })),
            other => Err(BackendError::unimplemented(
                other.name(),
                "builtin backend only runs control flow",
            )),
        }
    }
}

struct CallKernel {
    subgraph: SubgraphIndex,
}

impl Kernel for CallKernel {
    fn name(&self) -> &'static str {
        "Call"
    }

    fn run(&self, inputs: &[&HostTensor], cx: &KernelContext<'_>) -> BackendResult<Vec<HostTensor>> {
        let args = inputs.iter().map(|tensor| (*tensor).clone()).collect();
        Ok(cx.runner()?.run_subgraph(self.subgraph, args)?)
    }
}

struct IfKernel {
    then_subgraph: SubgraphIndex,
    else_subgraph: SubgraphIndex,
}

impl Kernel for IfKernel {
    fn name(&self) -> &'static str {
        "If"
    }

    fn run(&self, inputs: &[&HostTensor], cx: &KernelContext<'_>) -> BackendResult<Vec<HostTensor>> {
        let (cond, args) = inputs
            .split_first()
            .ok_or_else(|| BackendError::invalid_input("If requires a condition input"))?;
        let taken = cond.truthy().ok_or_else(|| {
            BackendError::invalid_input(format!(
                "If condition must not be empty, got dims {:?}",
                cond.dims()
            ))
        })?;
        let subgraph = if taken {
            self.then_subgraph
        } else {
            self.else_subgraph
        };
        tracing::trace!(operation = %cx.operation(), branch = %subgraph, "if branch selected");
        let args = args.iter().map(|tensor| (*tensor).clone()).collect();
        Ok(cx.runner()?.run_subgraph(subgraph, args)?)
    }
}

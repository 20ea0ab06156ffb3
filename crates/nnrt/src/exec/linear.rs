use std::borrow::Cow;
use std::sync::Arc;

use crate::backend::SubgraphRunner;
use crate::compiler::{ExecutorKind, LoweredGraph};
use crate::error::Result;
use crate::tensor::HostTensor;
use crate::trace::TracingContext;

use super::minmax::MinMaxRecorder;
use super::storage::TensorStore;
use super::{run_operation, Executor};

/// Runs operations one by one in `indexed_ranks` order on the calling thread.
///
/// Min/max records are tagged with the run handed down by the runner, so child subgraphs
/// started by `Call`/`If` share the run of their caller.
pub struct LinearExecutor {
    lowered: LoweredGraph,
    trace: Arc<TracingContext>,
    minmax: Option<Arc<MinMaxRecorder>>,
}

impl LinearExecutor {
    pub fn new(
        lowered: LoweredGraph,
        trace: Arc<TracingContext>,
        minmax: Option<Arc<MinMaxRecorder>>,
    ) -> Self {
        Self {
            lowered,
            trace,
            minmax,
        }
    }
}

impl Executor for LinearExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Linear
    }

    fn lowered(&self) -> &LoweredGraph {
        &self.lowered
    }

    fn execute(
        &self,
        inputs: &[HostTensor],
        runner: &dyn SubgraphRunner,
    ) -> Result<Vec<HostTensor>> {
        let lowered = &self.lowered;
        let graph = lowered.graph();
        let mut store = TensorStore::new(lowered);
        store.bind_inputs(inputs)?;
        let run = runner.minmax_run();

        for (rank, index) in lowered.indexed_ranks().iter().enumerate() {
            let position = rank + 1;
            if !lowered.tensors().is_noop(*index) {
                let operation = graph.operation(*index);
                let outputs = {
                    let values = operation
                        .inputs
                        .iter()
                        .map(|input| store.read(*input))
                        .collect::<Result<Vec<Cow<'_, HostTensor>>>>()?;
                    let refs: Vec<&HostTensor> = values.iter().map(|value| &**value).collect();
                    run_operation(lowered, *index, &refs, runner, &self.trace)?
                };

                if let (Some(recorder), Some(run)) = (&self.minmax, run) {
                    recorder.record(
                        run,
                        lowered.model(),
                        lowered.subgraph(),
                        *index,
                        operation.name(),
                        &outputs,
                    );
                }
                for (output, tensor) in operation.outputs.iter().zip(outputs) {
                    store.commit(*output, tensor)?;
                }
            } else {
                tracing::trace!(operation = %index, "skipping in-place operation");
            }
            for operand in lowered.tensors().releases_after(position) {
                store.release(*operand);
            }
        }

        store.outputs()
    }
}

//! Executors that run lowered subgraphs.
//!
//! Every executor owns its [`LoweredGraph`]; kernels receive contiguous host tensors and the
//! [`TensorStore`] routes results into owned or aliased buffers. Control-flow kernels reach
//! sibling subgraphs through the [`SubgraphRunner`] handed to each run.

mod dataflow;
mod factory;
mod linear;
mod minmax;
mod storage;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use crate::backend::{KernelContext, SubgraphRunner};
use crate::compiler::{ExecutorKind, LoweredGraph};
use crate::error::{Error, Result};
use crate::ir::{ModelIndex, OperationIndex, SubgraphIndex};
use crate::tensor::HostTensor;
use crate::trace::TracingContext;

pub use dataflow::DataflowExecutor;
pub use factory::ExecutorFactory;
pub use linear::LinearExecutor;
pub use minmax::{MinMaxRecord, MinMaxRecorder};
pub use storage::TensorStore;

/// Runs one lowered subgraph.
pub trait Executor: Send + Sync {
    fn kind(&self) -> ExecutorKind;

    fn lowered(&self) -> &LoweredGraph;

    /// Runs the subgraph on `inputs` and returns its outputs in declaration order.
    fn execute(&self, inputs: &[HostTensor], runner: &dyn SubgraphRunner)
        -> Result<Vec<HostTensor>>;
}

/// Executors of a compiled package keyed by model and subgraph.
#[derive(Default)]
pub struct Executors {
    executors: BTreeMap<(ModelIndex, SubgraphIndex), Box<dyn Executor>>,
    minmax: Option<Arc<MinMaxRecorder>>,
}

impl Executors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorder that every top-level run starts and flushes a run on.
    pub fn with_minmax(mut self, minmax: Option<Arc<MinMaxRecorder>>) -> Self {
        self.minmax = minmax;
        self
    }

    pub fn minmax(&self) -> Option<&Arc<MinMaxRecorder>> {
        self.minmax.as_ref()
    }

    pub fn emplace(
        &mut self,
        model: ModelIndex,
        subgraph: SubgraphIndex,
        executor: Box<dyn Executor>,
    ) {
        self.executors.insert((model, subgraph), executor);
    }

    pub fn get(&self, model: ModelIndex, subgraph: SubgraphIndex) -> Option<&dyn Executor> {
        self.executors
            .get(&(model, subgraph))
            .map(|executor| executor.as_ref())
    }

    /// Primary subgraph of the primary model.
    pub fn entry(&self) -> Option<&dyn Executor> {
        self.get(ModelIndex::PRIMARY, SubgraphIndex::PRIMARY)
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = (ModelIndex, SubgraphIndex)> + '_ {
        self.executors.keys().copied()
    }

    /// Runs one subgraph as a top-level execution.
    ///
    /// With min/max recording on, the whole execution, child subgraphs included, is one run
    /// and its records are flushed once it returns.
    pub fn execute(
        &self,
        model: ModelIndex,
        subgraph: SubgraphIndex,
        inputs: &[HostTensor],
    ) -> Result<Vec<HostTensor>> {
        let Some(recorder) = &self.minmax else {
            return self.execute_in_run(model, subgraph, inputs, None);
        };
        let run = recorder.begin_run();
        let outputs = self.execute_in_run(model, subgraph, inputs, Some(run));
        let flushed = recorder.end_run(run);
        let outputs = outputs?;
        flushed?;
        Ok(outputs)
    }

    fn execute_in_run(
        &self,
        model: ModelIndex,
        subgraph: SubgraphIndex,
        inputs: &[HostTensor],
        run: Option<usize>,
    ) -> Result<Vec<HostTensor>> {
        let executor = self.get(model, subgraph).ok_or_else(|| {
            Error::invalid_input(format!("no executor for {model}/{subgraph}"))
        })?;
        let runner = ModelRunner {
            executors: self,
            model,
            run,
        };
        executor.execute(inputs, &runner)
    }
}

/// Resolves `Call`/`If` targets within one model and one run.
struct ModelRunner<'a> {
    executors: &'a Executors,
    model: ModelIndex,
    run: Option<usize>,
}

impl SubgraphRunner for ModelRunner<'_> {
    fn run_subgraph(
        &self,
        subgraph: SubgraphIndex,
        inputs: Vec<HostTensor>,
    ) -> Result<Vec<HostTensor>> {
        self.executors
            .execute_in_run(self.model, subgraph, &inputs, self.run)
    }

    fn minmax_run(&self) -> Option<usize> {
        self.run
    }
}

/// Runs one kernel and reports the event to the tracing context.
pub(crate) fn run_operation(
    lowered: &LoweredGraph,
    operation: OperationIndex,
    inputs: &[&HostTensor],
    runner: &dyn SubgraphRunner,
    trace: &TracingContext,
) -> Result<Vec<HostTensor>> {
    let kernel = lowered.kernel(operation);
    let cx = KernelContext::new(operation, Some(runner));
    let start = Instant::now();
    let outputs = kernel.run(inputs, &cx)?;
    trace.record_operation(
        lowered.model(),
        lowered.subgraph(),
        operation,
        lowered.graph().operation(operation).name(),
        lowered.backend(operation).name(),
        start.elapsed(),
    );
    check_output_count(lowered, operation, outputs.len())?;
    Ok(outputs)
}

pub(crate) fn check_output_count(
    lowered: &LoweredGraph,
    operation: OperationIndex,
    produced: usize,
) -> Result<()> {
    let expected = lowered.graph().operation(operation).outputs.len();
    if produced != expected {
        return Err(Error::Execution(format!(
            "kernel for {operation} produced {produced} outputs, expected {expected}"
        )));
    }
    Ok(())
}

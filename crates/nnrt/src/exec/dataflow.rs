use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use crate::backend::SubgraphRunner;
use crate::compiler::{ExecutorKind, LoweredGraph};
use crate::error::{Error, Result};
use crate::ir::{BufferState, OperandIndex, OperationIndex};
use crate::tensor::HostTensor;
use crate::trace::TracingContext;

use super::storage::TensorStore;
use super::{run_operation, Executor};

/// Runs operations as soon as their producers have finished.
///
/// Each backend gets one worker thread, so operations of the same backend run in order while
/// different backends overlap. The calling thread owns the [`TensorStore`]: it hands copies of
/// ready inputs to workers and commits their results, so aliased windows have a single writer.
pub struct DataflowExecutor {
    lowered: LoweredGraph,
    trace: Arc<TracingContext>,
}

struct Job {
    operation: OperationIndex,
    inputs: Vec<HostTensor>,
}

struct Done {
    operation: OperationIndex,
    outputs: Result<Vec<HostTensor>>,
}

impl DataflowExecutor {
    pub fn new(lowered: LoweredGraph, trace: Arc<TracingContext>) -> Self {
        Self { lowered, trace }
    }
}

impl Executor for DataflowExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Dataflow
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
        let trace = self.trace.as_ref();
        let mut store = TensorStore::new(lowered);
        store.bind_inputs(inputs)?;
        let mut schedule = Schedule::new(lowered);

        thread::scope(|scope| -> Result<Vec<HostTensor>> {
            let (done_tx, done_rx) = mpsc::channel::<Done>();
            let mut queues: HashMap<String, mpsc::Sender<Job>> = HashMap::new();
            for name in lowered.backend_names() {
                let (job_tx, job_rx) = mpsc::channel::<Job>();
                let done_tx = done_tx.clone();
                thread::Builder::new()
                    .name(format!("nnrt-{name}"))
                    .spawn_scoped(scope, move || {
                        for job in job_rx {
                            let refs: Vec<&HostTensor> = job.inputs.iter().collect();
                            let outputs =
                                run_operation(lowered, job.operation, &refs, runner, trace);
                            let done = Done {
                                operation: job.operation,
                                outputs,
                            };
                            if done_tx.send(done).is_err() {
                                break;
                            }
                        }
                    })
                    .map_err(Error::Io)?;
                queues.insert(name, job_tx);
            }
            drop(done_tx);

            let mut in_flight = 0usize;
            while !schedule.finished() {
                while let Some(index) = schedule.next_ready() {
                    if lowered.tensors().is_noop(index) {
                        tracing::trace!(operation = %index, "skipping in-place operation");
                        schedule.complete(index, &mut store);
                        continue;
                    }
                    for transfer in lowered.transfers_into(index) {
                        tracing::trace!(
                            operand = %transfer.operand,
                            from = %transfer.from,
                            to = %transfer.to,
                            "transfer before dispatch"
                        );
                    }
                    let operation = lowered.graph().operation(index);
                    let inputs = operation
                        .inputs
                        .iter()
                        .map(|input| store.read(*input).map(|value| value.into_owned()))
                        .collect::<Result<Vec<_>>>()?;
                    let backend = lowered.backend(index).name();
                    let queue = queues.get(backend).ok_or_else(|| {
                        Error::Execution(format!("no worker for backend '{backend}'"))
                    })?;
                    queue
                        .send(Job {
                            operation: index,
                            inputs,
                        })
                        .map_err(|_| {
                            Error::Execution(format!("worker for backend '{backend}' stopped"))
                        })?;
                    in_flight += 1;
                }
                if schedule.finished() {
                    break;
                }
                if in_flight == 0 {
                    return Err(Error::Execution(
                        "dataflow schedule stalled with operations left".to_string(),
                    ));
                }

                let done = done_rx
                    .recv()
                    .map_err(|_| Error::Execution("all dataflow workers stopped".to_string()))?;
                in_flight -= 1;
                let outputs = done.outputs?;
                let operation = lowered.graph().operation(done.operation);
                for (output, tensor) in operation.outputs.iter().zip(outputs) {
                    store.commit(*output, tensor)?;
                }
                schedule.complete(done.operation, &mut store);
            }
            drop(queues);
            store.outputs()
        })
    }
}

/// Dependency counters of one run.
struct Schedule<'g> {
    lowered: &'g LoweredGraph,
    pending: HashMap<OperationIndex, usize>,
    consumers: HashMap<OperationIndex, BTreeSet<OperationIndex>>,
    readers: HashMap<OperandIndex, usize>,
    ready: VecDeque<OperationIndex>,
    remaining: usize,
}

impl<'g> Schedule<'g> {
    fn new(lowered: &'g LoweredGraph) -> Self {
        let graph = lowered.graph();
        let mut pending = HashMap::new();
        let mut consumers: HashMap<OperationIndex, BTreeSet<OperationIndex>> = HashMap::new();
        let mut readers: HashMap<OperandIndex, usize> = HashMap::new();
        let mut ready = VecDeque::new();

        for index in lowered.indexed_ranks() {
            let operation = graph.operation(*index);
            let producers = graph.producers_of(operation);
            for producer in &producers {
                consumers.entry(*producer).or_default().insert(*index);
            }
            if producers.is_empty() {
                ready.push_back(*index);
            }
            pending.insert(*index, producers.len());

            let distinct: BTreeSet<OperandIndex> = operation.inputs.iter().copied().collect();
            for input in distinct {
                let releasable = lowered.tensors().entry(input).is_some_and(|entry| {
                    entry.buffer == BufferState::Owned && !entry.constant
                }) && !graph.is_output(input);
                if releasable {
                    *readers.entry(input).or_default() += 1;
                }
            }
        }

        Self {
            lowered,
            pending,
            consumers,
            readers,
            ready,
            remaining: lowered.indexed_ranks().len(),
        }
    }

    fn finished(&self) -> bool {
        self.remaining == 0
    }

    fn next_ready(&mut self) -> Option<OperationIndex> {
        self.ready.pop_front()
    }

    fn complete(&mut self, index: OperationIndex, store: &mut TensorStore<'_>) {
        self.remaining -= 1;
        let operation = self.lowered.graph().operation(index);
        let distinct: BTreeSet<OperandIndex> = operation.inputs.iter().copied().collect();
        for input in distinct {
            if let Some(count) = self.readers.get_mut(&input) {
                *count -= 1;
                if *count == 0 {
                    store.release(input);
                }
            }
        }
        if let Some(consumers) = self.consumers.get(&index) {
            for consumer in consumers {
                if let Some(count) = self.pending.get_mut(consumer) {
                    *count -= 1;
                    if *count == 0 {
                        self.ready.push_back(*consumer);
                    }
                }
            }
        }
    }
}

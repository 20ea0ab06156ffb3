//! Forward/backward execution of a lowered trainable graph.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::backend::{KernelContext, SubgraphRunner};
use crate::compiler::LoweredGraph;
use crate::error::{Error, Result};
use crate::exec::{run_operation, TensorStore};
use crate::ir::{OperandIndex, SubgraphIndex};
use crate::tensor::HostTensor;
use crate::trace::TracingContext;

use super::graph::{trainable_operands, LossBinding};
use super::info::TrainingInfo;

/// Consumes accumulated gradients and updates one parameter in place.
pub trait OptimizerUpdate: Send + Sync {
    fn apply(&self, operand: OperandIndex, value: &mut HostTensor, gradient: &HostTensor)
        -> Result<()>;
}

/// Outcome of one training step.
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// Reduced loss value.
    pub loss: f32,
    /// Accumulated gradient of every trainable parameter that received one.
    pub gradients: BTreeMap<OperandIndex, HostTensor>,
}

/// Runs a trainable graph on the calling thread.
///
/// Parameters start from the graph's constant data and live in the executor afterwards;
/// steps are serialized on the parameter lock.
pub struct TrainableExecutor {
    lowered: LoweredGraph,
    trace: Arc<TracingContext>,
    info: TrainingInfo,
    loss: LossBinding,
    parameters: Mutex<BTreeMap<OperandIndex, HostTensor>>,
}

struct NoSubgraphs;

impl SubgraphRunner for NoSubgraphs {
    fn run_subgraph(&self, subgraph: SubgraphIndex, _inputs: Vec<HostTensor>) -> Result<Vec<HostTensor>> {
        Err(Error::unsupported_model(format!(
            "trainable graphs cannot call {subgraph}"
        )))
    }
}

impl TrainableExecutor {
    pub fn new(
        lowered: LoweredGraph,
        trace: Arc<TracingContext>,
        info: TrainingInfo,
        loss: LossBinding,
    ) -> Self {
        let graph = lowered.graph();
        let parameters = trainable_operands(graph)
            .into_iter()
            .filter_map(|operand| {
                let data = graph.operand(operand).data()?;
                Some((operand, data.as_ref().clone()))
            })
            .collect();
        Self {
            lowered,
            trace,
            info,
            loss,
            parameters: Mutex::new(parameters),
        }
    }

    pub fn lowered(&self) -> &LoweredGraph {
        &self.lowered
    }

    pub fn loss_binding(&self) -> &LossBinding {
        &self.loss
    }

    pub fn training_info(&self) -> &TrainingInfo {
        &self.info
    }

    pub fn parameter_operands(&self) -> BTreeSet<OperandIndex> {
        self.lock().keys().copied().collect()
    }

    /// Current value of a trainable parameter.
    pub fn parameter(&self, operand: OperandIndex) -> Option<HostTensor> {
        self.lock().get(&operand).cloned()
    }

    /// Runs forward only and returns `[prediction, loss]`.
    pub fn execute(&self, inputs: &[HostTensor], target: &HostTensor) -> Result<Vec<HostTensor>> {
        let parameters = self.lock();
        let store = self.forward(inputs, target, &parameters)?;
        store.outputs()
    }

    /// Forward, backward and parameter update; returns the reduced loss.
    pub fn train_step(
        &self,
        inputs: &[HostTensor],
        target: &HostTensor,
        optimizer: &dyn OptimizerUpdate,
    ) -> Result<f32> {
        Ok(self.step(inputs, target, Some(optimizer))?.loss)
    }

    /// Forward and backward without updating parameters.
    pub fn gradients(&self, inputs: &[HostTensor], target: &HostTensor) -> Result<StepOutput> {
        self.step(inputs, target, None)
    }

    fn step(
        &self,
        inputs: &[HostTensor],
        target: &HostTensor,
        optimizer: Option<&dyn OptimizerUpdate>,
    ) -> Result<StepOutput> {
        let mut parameters = self.lock();
        let store = self.forward(inputs, target, &parameters)?;
        let loss_value = store.read(self.loss.output)?.into_owned();
        let values = loss_value
            .as_f32()
            .ok_or_else(|| Error::Execution("loss output is not f32".to_string()))?;
        let seed = self.info.loss_seed(values.len());
        let loss = values.iter().sum::<f32>() * seed;

        let mut grads = self.backward(&store, HostTensor::filled(loss_value.dims(), seed))?;
        let gradients: BTreeMap<OperandIndex, HostTensor> = parameters
            .keys()
            .filter_map(|operand| Some((*operand, grads.remove(operand)?)))
            .collect();

        if let Some(optimizer) = optimizer {
            for (operand, gradient) in &gradients {
                if let Some(value) = parameters.get_mut(operand) {
                    optimizer.apply(*operand, value, gradient)?;
                }
            }
        }
        tracing::debug!(loss, updated = gradients.len(), "training step finished");
        Ok(StepOutput { loss, gradients })
    }

    /// Runs every operation in rank order and keeps all activations for backward.
    fn forward(
        &self,
        inputs: &[HostTensor],
        target: &HostTensor,
        parameters: &BTreeMap<OperandIndex, HostTensor>,
    ) -> Result<TensorStore<'_>> {
        let lowered = &self.lowered;
        let graph = lowered.graph();
        let mut bound = inputs.to_vec();
        bound.push(target.clone());
        let mut store = TensorStore::new(lowered);
        store.bind_inputs(&bound)?;
        for (operand, value) in parameters {
            store.bind_parameter(*operand, value.clone());
        }

        for index in lowered.indexed_ranks() {
            if lowered.tensors().is_noop(*index) {
                continue;
            }
            let operation = graph.operation(*index);
            let outputs = {
                let values = operation
                    .inputs
                    .iter()
                    .map(|input| store.read(*input))
                    .collect::<Result<Vec<Cow<'_, HostTensor>>>>()?;
                let refs: Vec<&HostTensor> = values.iter().map(|value| &**value).collect();
                run_operation(lowered, *index, &refs, &NoSubgraphs, &self.trace)?
            };
            for (output, tensor) in operation.outputs.iter().zip(outputs) {
                store.commit(*output, tensor)?;
            }
        }
        Ok(store)
    }

    /// Propagates gradients in reverse rank order, starting from the loss output.
    fn backward(
        &self,
        store: &TensorStore<'_>,
        seed: HostTensor,
    ) -> Result<HashMap<OperandIndex, HostTensor>> {
        let lowered = &self.lowered;
        let graph = lowered.graph();
        let mut grads: HashMap<OperandIndex, HostTensor> = HashMap::new();
        grads.insert(self.loss.output, seed);

        for index in lowered.indexed_ranks().iter().rev() {
            let operation = graph.operation(*index);
            let Some(training) = &operation.training else {
                continue;
            };
            if !operation.outputs.iter().any(|output| grads.contains_key(output)) {
                continue;
            }
            let input_values = operation
                .inputs
                .iter()
                .map(|input| store.read(*input))
                .collect::<Result<Vec<_>>>()?;
            let output_values = operation
                .outputs
                .iter()
                .map(|output| store.read(*output))
                .collect::<Result<Vec<_>>>()?;
            let output_grads: Vec<HostTensor> = operation
                .outputs
                .iter()
                .zip(output_values.iter())
                .map(|(output, value)| match grads.get(output) {
                    Some(grad) => grad.clone(),
                    None => HostTensor::zeros(value.dtype(), value.dims()),
                })
                .collect();

            let input_refs: Vec<&HostTensor> = input_values.iter().map(|value| &**value).collect();
            let output_refs: Vec<&HostTensor> = output_values.iter().map(|value| &**value).collect();
            let grad_refs: Vec<&HostTensor> = output_grads.iter().collect();
            let cx = KernelContext::new(*index, None);
            let start = Instant::now();
            let input_grads = lowered
                .kernel(*index)
                .backward(&input_refs, &output_refs, &grad_refs, &cx)?;
            tracing::trace!(
                operation = %index,
                kind = operation.name(),
                elapsed_us = crate::trace::micros(start.elapsed()),
                "backward"
            );
            if input_grads.len() != operation.inputs.len() {
                return Err(Error::Execution(format!(
                    "backward of {index} returned {} gradients for {} inputs",
                    input_grads.len(),
                    operation.inputs.len()
                )));
            }

            let wanted = operation.inputs.iter().zip(training.input_grads.iter());
            for ((input, wants_grad), grad) in wanted.zip(input_grads) {
                let (true, Some(grad)) = (*wants_grad, grad) else {
                    continue;
                };
                match grads.get_mut(input) {
                    Some(total) => total.accumulate(&grad)?,
                    None => {
                        let expected = store.read(*input)?;
                        if grad.dims() != expected.dims() {
                            return Err(Error::Execution(format!(
                                "gradient for operand {input} has dims {:?}, expected {:?}",
                                grad.dims(),
                                expected.dims()
                            )));
                        }
                        grads.insert(*input, grad);
                    }
                }
            }
        }
        Ok(grads)
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<OperandIndex, HostTensor>> {
        self.parameters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

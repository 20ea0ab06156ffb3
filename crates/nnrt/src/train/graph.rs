use std::collections::BTreeSet;

use crate::error::{Error, Result};
use crate::ir::{Graph, OperandIndex, Operation, OperationIndex};

/// Loss attached by loss insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LossBinding {
    pub operation: OperationIndex,
    pub prediction: OperandIndex,
    /// Graph input receiving the expected values.
    pub target: OperandIndex,
    pub output: OperandIndex,
}

/// Graph whose operations are being replaced by trainable variants.
#[derive(Debug, Clone)]
pub struct TrainableGraph {
    graph: Graph,
    loss: Option<LossBinding>,
}

impl TrainableGraph {
    /// Copies a plain inference graph; a graph that is already trainable is rejected.
    pub fn from_graph(graph: &Graph) -> Result<Self> {
        if graph.is_trainable() {
            return Err(Error::unsupported_model(
                "graph is already trainable; a plain inference graph is required",
            ));
        }
        Ok(Self {
            graph: graph.clone(),
            loss: None,
        })
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    pub fn into_graph(self) -> Graph {
        self.graph
    }

    pub fn replace_operation(&mut self, index: OperationIndex, operation: Operation) -> OperationIndex {
        self.graph.replace_operation(index, operation)
    }

    pub fn loss(&self) -> Option<&LossBinding> {
        self.loss.as_ref()
    }

    pub(crate) fn set_loss(&mut self, loss: LossBinding) {
        self.loss = Some(loss);
    }

    /// Constants feeding an input slot that takes a gradient.
    pub fn trainable_operands(&self) -> BTreeSet<OperandIndex> {
        trainable_operands(&self.graph)
    }
}

pub(crate) fn trainable_operands(graph: &Graph) -> BTreeSet<OperandIndex> {
    let mut operands = BTreeSet::new();
    for (_, operation) in graph.operations().iter() {
        let Some(training) = &operation.training else {
            continue;
        };
        for (input, wants_grad) in operation.inputs.iter().zip(training.input_grads.iter()) {
            if *wants_grad && graph.operand(*input).is_constant() {
                operands.insert(*input);
            }
        }
    }
    operands
}

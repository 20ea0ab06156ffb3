use std::collections::{BTreeSet, HashSet};
use std::fmt;

use crate::error::{Error, Result};
use crate::tensor::HostTensor;

use super::arena::Arena;
use super::index::{OperandIndex, OperationIndex, SubgraphIndex};
use super::operand::{BufferState, Operand, OperandInfo, Shape};
use super::operation::{OpKind, Operation};

/// Operands and operations of one subgraph.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    operands: Arena<OperandIndex, Operand>,
    operations: Arena<OperationIndex, Operation>,
    inputs: Vec<OperandIndex>,
    outputs: Vec<OperandIndex>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_operand(&mut self, info: OperandInfo) -> OperandIndex {
        self.operands.push(Operand::new(info))
    }

    pub fn add_constant(&mut self, info: OperandInfo, data: HostTensor) -> OperandIndex {
        self.operands.push(Operand::constant(info, data))
    }

    pub fn add_input(&mut self, operand: OperandIndex) {
        self.assert_operand(operand);
        self.inputs.push(operand);
    }

    pub fn add_output(&mut self, operand: OperandIndex) {
        self.assert_operand(operand);
        self.outputs.push(operand);
    }

    pub fn set_outputs(&mut self, outputs: Vec<OperandIndex>) {
        for operand in &outputs {
            self.assert_operand(*operand);
        }
        self.outputs = outputs;
    }

    pub fn inputs(&self) -> &[OperandIndex] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[OperandIndex] {
        &self.outputs
    }

    pub fn is_input(&self, operand: OperandIndex) -> bool {
        self.inputs.contains(&operand)
    }

    pub fn is_output(&self, operand: OperandIndex) -> bool {
        self.outputs.contains(&operand)
    }

    /// Adds an operation and links its operands.
    pub fn add_operation(&mut self, operation: Operation) -> OperationIndex {
        self.assert_links(&operation);
        let inputs = operation.inputs.clone();
        let outputs = operation.outputs.clone();
        let index = self.operations.push(operation);
        self.link(index, &inputs, &outputs);
        index
    }

    pub fn add_op(
        &mut self,
        kind: OpKind,
        inputs: impl IntoIterator<Item = OperandIndex>,
        outputs: impl IntoIterator<Item = OperandIndex>,
    ) -> OperationIndex {
        self.add_operation(Operation::new(kind, inputs, outputs))
    }

    /// Swaps the operation at `index`; the returned index is always `index`.
    pub fn replace_operation(
        &mut self,
        index: OperationIndex,
        operation: Operation,
    ) -> OperationIndex {
        let (old_inputs, old_outputs) = {
            let old = &self.operations[index];
            (old.inputs.clone(), old.outputs.clone())
        };
        self.unlink(index, &old_inputs, &old_outputs);
        self.assert_links(&operation);
        let inputs = operation.inputs.clone();
        let outputs = operation.outputs.clone();
        let (same, _) = self.operations.replace(index, operation);
        self.link(index, &inputs, &outputs);
        same
    }

    pub fn remove_operation(&mut self, index: OperationIndex) -> Operation {
        let operation = self.operations.remove(index);
        self.unlink(index, &operation.inputs, &operation.outputs);
        operation
    }

    /// Removes an operand that nothing references anymore.
    pub fn remove_operand(&mut self, index: OperandIndex) -> Operand {
        let operand = &self.operands[index];
        assert!(
            operand.def.is_none() && operand.uses.is_empty(),
            "operand {index} is still linked to operations"
        );
        self.inputs.retain(|input| *input != index);
        self.outputs.retain(|output| *output != index);
        self.operands.remove(index)
    }

    pub fn operand(&self, index: OperandIndex) -> &Operand {
        &self.operands[index]
    }

    pub fn operation(&self, index: OperationIndex) -> &Operation {
        &self.operations[index]
    }

    pub fn operands(&self) -> &Arena<OperandIndex, Operand> {
        &self.operands
    }

    pub fn operations(&self) -> &Arena<OperationIndex, Operation> {
        &self.operations
    }

    /// Visits operations in insertion order.
    pub fn iterate(&self, mut visitor: impl FnMut(OperationIndex, &Operation)) {
        for (index, operation) in self.operations.iter() {
            visitor(index, operation);
        }
    }

    /// Updates an operand's shape; returns whether anything changed.
    ///
    /// A shape marked final can only be re-set to the same value.
    pub fn set_shape(&mut self, index: OperandIndex, shape: Shape) -> Result<bool> {
        let operand = &mut self.operands[index];
        if operand.shape() == &shape {
            return Ok(false);
        }
        if operand.is_shape_final() {
            return Err(Error::graph_shape_mismatch(format!(
                "operand {index} has final shape {} and cannot become {shape}",
                operand.shape()
            )));
        }
        operand.set_shape_unchecked(shape);
        Ok(true)
    }

    pub fn mark_shape_final(&mut self, index: OperandIndex) {
        self.operands[index].mark_shape_final();
    }

    pub(crate) fn set_buffer(&mut self, index: OperandIndex, buffer: BufferState) {
        self.operands[index].set_buffer(buffer);
    }

    pub(crate) fn operand_mut(&mut self, index: OperandIndex) -> &mut Operand {
        &mut self.operands[index]
    }

    /// True when any operation is already a trainable variant.
    pub fn is_trainable(&self) -> bool {
        self.operations.iter().any(|(_, op)| op.is_trainable())
    }

    pub fn child_subgraphs(&self) -> BTreeSet<SubgraphIndex> {
        self.operations
            .iter()
            .flat_map(|(_, op)| op.kind.child_subgraphs())
            .collect()
    }

    /// Operation order in which every producer precedes its consumers.
    ///
    /// Ties are broken by operation index, so the order is deterministic.
    pub fn topological_order(&self) -> Result<Vec<OperationIndex>> {
        let mut pending: Vec<usize> = vec![0; self.operations.capacity_hint()];
        let mut ready: BTreeSet<OperationIndex> = BTreeSet::new();
        for (index, operation) in self.operations.iter() {
            let deps = self.producers_of(operation).len();
            pending[index.value()] = deps;
            if deps == 0 {
                ready.insert(index);
            }
        }

        let mut order = Vec::with_capacity(self.operations.len());
        while let Some(index) = ready.pop_first() {
            order.push(index);
            let mut consumers: BTreeSet<OperationIndex> = BTreeSet::new();
            for output in &self.operations[index].outputs {
                consumers.extend(self.operands[*output].uses.iter().copied());
            }
            for consumer in consumers {
                let count = &mut pending[consumer.value()];
                *count -= 1;
                if *count == 0 {
                    ready.insert(consumer);
                }
            }
        }

        if order.len() != self.operations.len() {
            return Err(Error::unsupported_model(
                "graph contains a cycle between operations",
            ));
        }
        Ok(order)
    }

    /// Distinct operations producing `operation`'s inputs.
    pub fn producers_of(&self, operation: &Operation) -> BTreeSet<OperationIndex> {
        operation
            .inputs
            .iter()
            .filter_map(|input| self.operands[*input].def)
            .collect()
    }

    /// Structural checks run before lowering.
    pub fn verify(&self) -> Result<()> {
        for input in &self.inputs {
            if self.operands[*input].def.is_some() {
                return Err(Error::unsupported_model(format!(
                    "graph input {input} is produced by an operation"
                )));
            }
        }
        let mut available: HashSet<OperandIndex> = self.inputs.iter().copied().collect();
        for (index, operand) in self.operands.iter() {
            if operand.is_constant() {
                available.insert(index);
            }
        }
        for index in self.topological_order()? {
            let operation = &self.operations[index];
            if matches!(operation.kind, OpKind::If { .. }) && operation.inputs.is_empty() {
                return Err(Error::unsupported_model(format!(
                    "If {index} has no condition input"
                )));
            }
            for input in &operation.inputs {
                if !available.contains(input) && self.operands[*input].def.is_none() {
                    return Err(Error::unsupported_model(format!(
                        "operand {input} consumed by {index} ({}) has no producer",
                        operation.name()
                    )));
                }
            }
            available.extend(operation.outputs.iter().copied());
        }
        for output in &self.outputs {
            if !available.contains(output) {
                return Err(Error::unsupported_model(format!(
                    "graph output {output} is never produced"
                )));
            }
        }
        Ok(())
    }

    fn assert_operand(&self, operand: OperandIndex) {
        assert!(
            self.operands.contains(operand),
            "operand {operand} does not exist"
        );
    }

    fn assert_links(&self, operation: &Operation) {
        for operand in operation.inputs.iter().chain(operation.outputs.iter()) {
            self.assert_operand(*operand);
        }
        for output in &operation.outputs {
            assert!(
                self.operands[*output].def.is_none(),
                "operand {output} already has a producer"
            );
        }
    }

    fn link(&mut self, index: OperationIndex, inputs: &[OperandIndex], outputs: &[OperandIndex]) {
        for input in inputs {
            let uses = &mut self.operands[*input].uses;
            if !uses.contains(&index) {
                uses.push(index);
            }
        }
        for output in outputs {
            self.operands[*output].def = Some(index);
        }
    }

    fn unlink(&mut self, index: OperationIndex, inputs: &[OperandIndex], outputs: &[OperandIndex]) {
        for input in inputs {
            if let Some(operand) = self.operands.get_mut(*input) {
                operand.uses.retain(|user| *user != index);
            }
        }
        for output in outputs {
            if let Some(operand) = self.operands.get_mut(*output) {
                if operand.def == Some(index) {
                    operand.def = None;
                }
            }
        }
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph {{")?;
        writeln!(f, "  inputs: {}", join(&self.inputs))?;
        writeln!(f, "  outputs: {}", join(&self.outputs))?;
        for (index, operand) in self.operands.iter() {
            let mut notes = Vec::new();
            if operand.is_constant() {
                notes.push("const".to_string());
            }
            if let BufferState::Aliased(sub) = operand.buffer() {
                notes.push(format!("view of {} at {:?}", sub.parent, sub.offset));
            }
            let notes = if notes.is_empty() {
                String::new()
            } else {
                format!(" [{}]", notes.join(", "))
            };
            writeln!(
                f,
                "  {index} : {}[{}]{notes}",
                operand.dtype(),
                operand.shape()
            )?;
        }
        for (index, operation) in self.operations.iter() {
            writeln!(
                f,
                "  {index} {} ({}) -> ({})",
                operation.kind,
                join(&operation.inputs),
                join(&operation.outputs)
            )?;
        }
        write!(f, "}}")
    }
}

fn join(indices: &[OperandIndex]) -> String {
    indices
        .iter()
        .map(|index| index.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

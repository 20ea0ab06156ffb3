use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::ir::{Graph, Model, OpKind, OperandIndex, SubgraphIndex};

use super::shape_inference::{check_condition, operation_rule};

/// Checks final shapes after inference.
///
/// Every operand reachable from a graph output must be resolved, and every operation's
/// output shapes must equal what its rule yields for its input shapes.
pub struct ShapeValidator<'a> {
    model: &'a Model,
}

impl<'a> ShapeValidator<'a> {
    pub fn new(model: &'a Model) -> Self {
        Self { model }
    }

    pub fn validate(&self) -> Result<()> {
        for (index, graph) in self.model.subgraphs() {
            self.validate_graph(index, graph)?;
        }
        Ok(())
    }

    fn validate_graph(&self, index: SubgraphIndex, graph: &Graph) -> Result<()> {
        let mut worklist: Vec<OperandIndex> = graph.outputs().to_vec();
        let mut reachable: HashSet<OperandIndex> = HashSet::new();
        while let Some(operand) = worklist.pop() {
            if !reachable.insert(operand) {
                continue;
            }
            if let Some(def) = graph.operand(operand).def() {
                worklist.extend(graph.operation(def).inputs.iter().copied());
            }
        }
        let mut unresolved: Vec<&OperandIndex> = reachable
            .iter()
            .filter(|operand| !graph.operand(**operand).shape().is_resolved())
            .collect();
        unresolved.sort();
        if let Some(operand) = unresolved.first() {
            return Err(Error::graph_shape_mismatch(format!(
                "operand {operand} of {index} has unresolved shape {}",
                graph.operand(**operand).shape()
            )));
        }

        for (op_index, operation) in graph.operations().iter() {
            if matches!(operation.kind, OpKind::If { .. }) {
                check_condition(graph, op_index)?;
            }
            let dims = |operands: &[OperandIndex]| -> Option<Vec<Vec<usize>>> {
                operands
                    .iter()
                    .map(|operand| graph.operand(*operand).shape().static_dims())
                    .collect()
            };
            let (Some(inputs), Some(outputs)) = (dims(&operation.inputs), dims(&operation.outputs))
            else {
                continue;
            };
            let expected = match &operation.kind {
                OpKind::Call { subgraph } => self.child_outputs(*subgraph)?,
                OpKind::If { then_subgraph, .. } => self.child_outputs(*then_subgraph)?,
                kind => operation_rule(kind, &inputs)
                    .map_err(|detail| Error::shape_mismatch(op_index, detail))?,
            };
            if expected != outputs {
                return Err(Error::shape_mismatch(
                    op_index,
                    format!(
                        "{} outputs are {outputs:?} but its inputs imply {expected:?}",
                        operation.name()
                    ),
                ));
            }
        }
        Ok(())
    }

    fn child_outputs(&self, subgraph: SubgraphIndex) -> Result<Vec<Vec<usize>>> {
        let graph = self.model.subgraph(subgraph).ok_or_else(|| {
            Error::unsupported_model(format!("control flow references missing {subgraph}"))
        })?;
        graph
            .outputs()
            .iter()
            .map(|output| {
                graph.operand(*output).shape().static_dims().ok_or_else(|| {
                    Error::graph_shape_mismatch(format!(
                        "output {output} of {subgraph} is unresolved"
                    ))
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Activation, Dimension, OperandInfo, Shape};
    use crate::tensor::DType;

    #[test]
    fn unresolved_output_is_rejected() {
        let mut graph = Graph::new();
        let x = graph.add_operand(OperandInfo::new(
            Shape::new([Dimension::Unknown]),
            DType::F32,
        ));
        let y = graph.add_operand(OperandInfo::new(Shape::unknown(1), DType::F32));
        graph.add_input(x);
        graph.add_op(OpKind::ElementwiseActivation(Activation::Tanh), [x], [y]);
        graph.add_output(y);
        let model = Model::single(graph);
        assert!(matches!(
            ShapeValidator::new(&model).validate(),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn consistent_graph_passes() {
        let mut graph = Graph::new();
        let x = graph.add_operand(OperandInfo::f32(&[2, 2]));
        let y = graph.add_operand(OperandInfo::f32(&[4]));
        graph.add_input(x);
        graph.add_op(OpKind::Reshape { shape: vec![-1] }, [x], [y]);
        graph.add_output(y);
        let model = Model::single(graph);
        ShapeValidator::new(&model).validate().unwrap();
    }
}

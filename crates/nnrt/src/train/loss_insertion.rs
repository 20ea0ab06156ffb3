use crate::error::{Error, Result};
use crate::ir::{OpKind, OperandInfo, Operation, Shape, TrainableInfo};

use super::graph::{LossBinding, TrainableGraph};
use super::info::LossInfo;

/// Attaches the loss operation to the single graph output.
///
/// Adds a target input shaped like the prediction, a trainable `Loss` operation and its
/// output. Graph outputs become `[prediction, loss]`.
pub struct LossInsertionPass {
    loss: LossInfo,
}

impl LossInsertionPass {
    pub fn new(loss: LossInfo) -> Self {
        Self { loss }
    }

    pub fn run(&self, trainable: &mut TrainableGraph) -> Result<LossBinding> {
        if trainable.loss().is_some() {
            return Err(Error::unsupported_model("graph already carries a loss"));
        }
        let graph = trainable.graph_mut();
        let prediction = match graph.outputs() {
            [single] => *single,
            outputs => {
                return Err(Error::unsupported_model(format!(
                    "loss insertion needs exactly one graph output, found {}",
                    outputs.len()
                )))
            }
        };
        let info = graph.operand(prediction).info().clone();
        let target = graph.add_operand(OperandInfo::new(info.shape.clone(), info.dtype));
        graph.add_input(target);
        let output = graph.add_operand(OperandInfo::new(Shape::unknown(1), info.dtype));

        let mut operation = Operation::new(
            OpKind::Loss {
                kind: self.loss.kind,
            },
            [prediction, target],
            [output],
        );
        operation.training = Some(TrainableInfo {
            input_grads: smallvec::smallvec![true, false],
        });
        let index = graph.add_operation(operation);
        graph.set_outputs(vec![prediction, output]);

        let binding = LossBinding {
            operation: index,
            prediction,
            target,
            output,
        };
        tracing::debug!(
            loss = ?self.loss.kind,
            operation = %index,
            %prediction,
            %target,
            "loss inserted"
        );
        trainable.set_loss(binding);
        Ok(binding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Graph, LossKind};
    use crate::train::info::LossReduction;

    fn loss() -> LossInfo {
        LossInfo {
            kind: LossKind::MeanSquaredError,
            reduction: LossReduction::SumOverBatchSize,
        }
    }

    #[test]
    fn loss_becomes_second_output() {
        let mut graph = Graph::new();
        let x = graph.add_operand(OperandInfo::f32(&[2, 3]));
        let y = graph.add_operand(OperandInfo::f32(&[2, 3]));
        graph.add_input(x);
        graph.add_op(OpKind::Permute, [x], [y]);
        graph.add_output(y);

        let mut trainable = TrainableGraph::from_graph(&graph).unwrap();
        let binding = LossInsertionPass::new(loss()).run(&mut trainable).unwrap();
        let graph = trainable.graph();
        assert_eq!(graph.outputs(), &[y, binding.output]);
        assert_eq!(graph.inputs(), &[x, binding.target]);
        assert_eq!(graph.operand(binding.target).shape(), graph.operand(y).shape());
        assert!(graph.operation(binding.operation).is_trainable());
    }

    #[test]
    fn two_outputs_are_rejected() {
        let mut graph = Graph::new();
        let x = graph.add_operand(OperandInfo::f32(&[2]));
        let y = graph.add_operand(OperandInfo::f32(&[2]));
        graph.add_input(x);
        graph.add_op(OpKind::Permute, [x], [y]);
        graph.add_output(x);
        graph.add_output(y);

        let mut trainable = TrainableGraph::from_graph(&graph).unwrap();
        assert!(LossInsertionPass::new(loss()).run(&mut trainable).is_err());
    }
}

use smallvec::SmallVec;

use crate::error::{Error, Result};
use crate::ir::{OpKind, Operation, OperationIndex, TrainableInfo};

use super::graph::TrainableGraph;

/// Replaces every operation of a trainable graph with its trainable variant.
///
/// Conversion is total: a kind without a trainable counterpart fails the whole conversion
/// and leaves no partially converted graph behind for the caller to use.
pub struct TrainableOperationConverter;

impl TrainableOperationConverter {
    pub fn new() -> Self {
        Self
    }

    /// Converts every operation in place, keeping each operation index stable.
    pub fn convert(&self, graph: &mut TrainableGraph) -> Result<usize> {
        let indices: Vec<OperationIndex> = graph.graph().operations().indices();
        for index in &indices {
            let converted = self.convert_operation(*index, graph.graph().operation(*index))?;
            let replaced = graph.replace_operation(*index, converted);
            debug_assert_eq!(replaced, *index);
        }
        tracing::debug!(operations = indices.len(), "operations converted to trainable variants");
        Ok(indices.len())
    }

    pub fn convert_operation(&self, index: OperationIndex, operation: &Operation) -> Result<Operation> {
        let input_grads: SmallVec<[bool; 4]> = match &operation.kind {
            OpKind::BinaryArithmetic { .. }
            | OpKind::FullyConnected { .. }
            | OpKind::ElementwiseActivation(_)
            | OpKind::Reshape { .. }
            | OpKind::Softmax { .. }
            | OpKind::Permute => operation.inputs.iter().map(|_| true).collect(),
            // The target of a loss is data, never a parameter.
            OpKind::Loss { .. } => operation
                .inputs
                .iter()
                .enumerate()
                .map(|(position, _)| position == 0)
                .collect(),
            OpKind::Concat { .. }
            | OpKind::Transpose { .. }
            | OpKind::L2Normalize
            | OpKind::Call { .. }
            | OpKind::If { .. } => {
                return Err(Error::unsupported_operation(format!(
                    "{} at {index} has no trainable counterpart",
                    operation.name()
                )))
            }
        };
        let mut converted = operation.clone();
        converted.training = Some(TrainableInfo { input_grads });
        Ok(converted)
    }
}

impl Default for TrainableOperationConverter {
    fn default() -> Self {
        Self::new()
    }
}

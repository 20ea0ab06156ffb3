use std::collections::HashSet;

use crate::error::Result;
use crate::ir::{Graph, OperandIndex, OperationIndex};

use super::{Pass, PassResult};

/// Drops operations whose results never reach a graph output.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeadOperationEliminationPass;

impl Pass for DeadOperationEliminationPass {
    fn name(&self) -> &'static str {
        "DeadOperationEliminationPass"
    }

    fn run(&self, graph: &mut Graph) -> Result<PassResult> {
        let mut worklist: Vec<OperandIndex> = graph.outputs().to_vec();
        let mut live_operands: HashSet<OperandIndex> = HashSet::new();
        let mut live_operations: HashSet<OperationIndex> = HashSet::new();
        while let Some(operand) = worklist.pop() {
            if !live_operands.insert(operand) {
                continue;
            }
            let Some(def) = graph.operand(operand).def() else {
                continue;
            };
            if live_operations.insert(def) {
                worklist.extend(graph.operation(def).inputs.iter().copied());
            }
        }

        let dead: Vec<OperationIndex> = graph
            .operations()
            .indices()
            .into_iter()
            .filter(|index| !live_operations.contains(index))
            .collect();
        for index in &dead {
            let operation = graph.remove_operation(*index);
            tracing::trace!(operation = %index, kind = operation.name(), "removed dead operation");
        }
        Ok(PassResult {
            changed: !dead.is_empty(),
            erased_operations: dead.len(),
            ..PassResult::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{OpKind, OperandInfo};

    #[test]
    fn unreachable_branch_is_removed() {
        let mut graph = Graph::new();
        let x = graph.add_operand(OperandInfo::f32(&[2]));
        let y = graph.add_operand(OperandInfo::f32(&[2]));
        let z = graph.add_operand(OperandInfo::f32(&[2]));
        graph.add_input(x);
        let kept = graph.add_op(OpKind::Permute, [x], [y]);
        let dropped = graph.add_op(OpKind::L2Normalize, [x], [z]);
        graph.add_output(y);

        let stats = DeadOperationEliminationPass.run(&mut graph).unwrap();
        assert_eq!(stats.erased_operations, 1);
        assert!(graph.operations().contains(kept));
        assert!(!graph.operations().contains(dropped));
        assert!(graph.operand(z).def().is_none());
    }
}

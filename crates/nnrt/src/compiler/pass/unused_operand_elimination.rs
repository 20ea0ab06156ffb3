use crate::error::Result;
use crate::ir::{Graph, OperandIndex};

use super::{Pass, PassResult};

/// Removes operands that no operation or graph boundary references.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnusedOperandEliminationPass;

impl Pass for UnusedOperandEliminationPass {
    fn name(&self) -> &'static str {
        "UnusedOperandEliminationPass"
    }

    fn run(&self, graph: &mut Graph) -> Result<PassResult> {
        let unused: Vec<OperandIndex> = graph
            .operands()
            .iter()
            .filter(|(index, operand)| {
                operand.def().is_none()
                    && operand.uses().is_empty()
                    && !graph.is_input(*index)
                    && !graph.is_output(*index)
            })
            .map(|(index, _)| index)
            .collect();

        for index in &unused {
            graph.remove_operand(*index);
        }
        Ok(PassResult {
            changed: !unused.is_empty(),
            erased_operands: unused.len(),
            ..PassResult::default()
        })
    }
}

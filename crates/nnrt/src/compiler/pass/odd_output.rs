use std::collections::HashSet;

use crate::error::Result;
use crate::ir::{Graph, OpKind, OperandIndex};

use super::{Pass, PassResult};

/// Gives every graph output its own producing operation.
///
/// Two shapes are rewritten with an inserted `Permute`:
/// * an output that is also a graph input,
/// * an operand listed more than once among the outputs (every repeat after the first).
#[derive(Debug, Default, Clone, Copy)]
pub struct OddOutputPass;

impl Pass for OddOutputPass {
    fn name(&self) -> &'static str {
        "OddOutputPass"
    }

    fn run(&self, graph: &mut Graph) -> Result<PassResult> {
        let mut outputs = graph.outputs().to_vec();
        let mut seen: HashSet<OperandIndex> = HashSet::new();
        let mut changed = false;

        for slot in outputs.iter_mut() {
            let original = *slot;
            let repeated = !seen.insert(original);
            if !repeated && !graph.is_input(original) {
                continue;
            }
            let replacement = copy_through_permute(graph, original);
            tracing::debug!(
                output = %original,
                %replacement,
                repeated,
                "odd graph output rewritten"
            );
            *slot = replacement;
            changed = true;
        }

        if changed {
            graph.set_outputs(outputs);
        }
        Ok(PassResult {
            changed,
            ..PassResult::default()
        })
    }
}

fn copy_through_permute(graph: &mut Graph, source: OperandIndex) -> OperandIndex {
    let fresh = graph.operand(source).detached();
    let target = graph.add_operand(fresh.info().clone());
    graph.add_op(OpKind::Permute, [source], [target]);
    target
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::OperandInfo;

    #[test]
    fn input_passed_through_as_output_gets_a_copy() {
        let mut graph = Graph::new();
        let x = graph.add_operand(OperandInfo::f32(&[3]));
        graph.add_input(x);
        graph.add_output(x);

        assert!(OddOutputPass.run(&mut graph).unwrap().changed);
        let out = graph.outputs()[0];
        assert_ne!(out, x);
        let producer = graph.operand(out).def().unwrap();
        assert_eq!(graph.operation(producer).inputs.as_slice(), &[x]);
    }

    #[test]
    fn repeated_output_is_split() {
        let mut graph = Graph::new();
        let x = graph.add_operand(OperandInfo::f32(&[3]));
        let y = graph.add_operand(OperandInfo::f32(&[3]));
        graph.add_input(x);
        graph.add_op(OpKind::Permute, [x], [y]);
        graph.add_output(y);
        graph.add_output(y);

        OddOutputPass.run(&mut graph).unwrap();
        let outputs = graph.outputs();
        assert_eq!(outputs[0], y);
        assert_ne!(outputs[1], y);
        assert!(!OddOutputPass.run(&mut graph).unwrap().changed);
    }
}

use std::sync::Arc;

use crate::error::Result;
use crate::ir::{Graph, OpKind, OperandIndex};

use super::{Pass, PassResult};

/// Makes constant graph outputs operation-produced.
///
/// For an output `%o` holding constant data the pass adds a fresh constant `%c` with the same
/// data and rewires `%o` as the result of `Permute(%c)`. Executors can then treat every output
/// as written by a kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConstantOutputPass;

impl Pass for ConstantOutputPass {
    fn name(&self) -> &'static str {
        "ConstantOutputPass"
    }

    fn run(&self, graph: &mut Graph) -> Result<PassResult> {
        let targets: Vec<OperandIndex> = graph
            .outputs()
            .iter()
            .copied()
            .filter(|output| graph.operand(*output).is_constant())
            .collect();
        if targets.is_empty() {
            return Ok(PassResult::unchanged());
        }

        for output in &targets {
            let Some(data) = graph.operand_mut(*output).take_data() else {
                continue;
            };
            let info = graph.operand(*output).info().clone();
            let data = Arc::try_unwrap(data).unwrap_or_else(|shared| (*shared).clone());
            let constant = graph.add_constant(info, data);
            graph.add_op(OpKind::Permute, [constant], [*output]);
            tracing::debug!(%output, %constant, "constant output routed through permute");
        }

        Ok(PassResult {
            changed: true,
            ..PassResult::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::OperandInfo;
    use crate::tensor::HostTensor;

    #[test]
    fn constant_output_becomes_permute_result() {
        let mut graph = Graph::new();
        let data = HostTensor::from_f32(&[2], vec![1.0, 2.0]).unwrap();
        let out = graph.add_constant(OperandInfo::f32(&[2]), data);
        graph.add_output(out);

        let stats = ConstantOutputPass.run(&mut graph).unwrap();
        assert!(stats.changed);
        assert!(!graph.operand(out).is_constant());
        let producer = graph.operand(out).def().unwrap();
        assert_eq!(graph.operation(producer).kind, OpKind::Permute);
        let source = graph.operation(producer).inputs[0];
        assert!(graph.operand(source).is_constant());

        assert!(!ConstantOutputPass.run(&mut graph).unwrap().changed);
    }
}

//! Graph passes and the runner that sequences them.
//!
//! Mandatory passes establish invariants later stages rely on (every graph output is produced
//! by an operation, outputs are distinct from inputs); optimizations run afterwards and may
//! assume them. The runner stops at the first pass that fails.

mod constant_output;
mod dead_operation_elimination;
mod odd_output;
mod unused_operand_elimination;

use std::time::Instant;

use crate::error::Result;
use crate::ir::{Graph, ModelIndex, SubgraphIndex};
use crate::trace::{micros, PassEvent, TracingContext};

pub use constant_output::ConstantOutputPass;
pub use dead_operation_elimination::DeadOperationEliminationPass;
pub use odd_output::OddOutputPass;
pub use unused_operand_elimination::UnusedOperandEliminationPass;

/// Result returned by a [`Pass`] after it runs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassResult {
    pub changed: bool,
    pub erased_operations: usize,
    pub erased_operands: usize,
}

impl PassResult {
    pub fn unchanged() -> Self {
        Self::default()
    }

    pub fn merge(self, other: PassResult) -> PassResult {
        PassResult {
            changed: self.changed || other.changed,
            erased_operations: self.erased_operations + other.erased_operations,
            erased_operands: self.erased_operands + other.erased_operands,
        }
    }
}

/// In-place graph transformation or validation; a no-op when nothing matches.
pub trait Pass: Send + Sync {
    fn name(&self) -> &'static str;
    fn run(&self, graph: &mut Graph) -> Result<PassResult>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    Mandatory,
    Optimization,
}

/// Ordered list of passes; mandatory passes always run before optimizations.
#[derive(Default)]
pub struct PassRunner {
    passes: Vec<(Stage, Box<dyn Pass>)>,
}

impl PassRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pipeline used by every compile: constant/odd output fixes, then dead code removal.
    pub fn standard() -> Self {
        PassRunner::new()
            .mandatory(ConstantOutputPass)
            .mandatory(OddOutputPass)
            .optimization(DeadOperationEliminationPass)
            .optimization(UnusedOperandEliminationPass)
    }

    pub fn mandatory(mut self, pass: impl Pass + 'static) -> Self {
        self.passes.push((Stage::Mandatory, Box::new(pass)));
        self
    }

    pub fn optimization(mut self, pass: impl Pass + 'static) -> Self {
        self.passes.push((Stage::Optimization, Box::new(pass)));
        self
    }

    pub fn pass_names(&self) -> Vec<&'static str> {
        self.ordered().map(|pass| pass.name()).collect()
    }

    /// Runs every pass on `graph`, recording one [`PassEvent`] per pass.
    pub fn run(
        &self,
        graph: &mut Graph,
        model: ModelIndex,
        subgraph: SubgraphIndex,
        trace: &TracingContext,
    ) -> Result<PassResult> {
        let log_stats = crate::env::pass_stats_enabled();
        let mut totals = PassResult::default();
        for pass in self.ordered() {
            let start = Instant::now();
            let stats = pass.run(graph)?;
            let elapsed = start.elapsed();
            totals = totals.merge(stats);
            if log_stats {
                tracing::info!(
                    pass = pass.name(),
                    %model,
                    %subgraph,
                    changed = stats.changed,
                    erased_operations = stats.erased_operations,
                    erased_operands = stats.erased_operands,
                    operations = graph.operations().len(),
                    "pass finished"
                );
            } else {
                tracing::debug!(pass = pass.name(), %subgraph, changed = stats.changed, "pass finished");
            }
            trace.record_pass(PassEvent {
                model,
                subgraph,
                pass: pass.name().to_string(),
                changed: stats.changed,
                erased_operations: stats.erased_operations,
                erased_operands: stats.erased_operands,
                duration_us: micros(elapsed),
            });
        }
        Ok(totals)
    }

    fn ordered(&self) -> impl Iterator<Item = &dyn Pass> + '_ {
        let mandatory = self
            .passes
            .iter()
            .filter(|(stage, _)| *stage == Stage::Mandatory);
        let optional = self
            .passes
            .iter()
            .filter(|(stage, _)| *stage == Stage::Optimization);
        mandatory.chain(optional).map(|(_, pass)| pass.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mandatory_passes_run_first_regardless_of_insertion() {
        let runner = PassRunner::new()
            .optimization(UnusedOperandEliminationPass)
            .mandatory(ConstantOutputPass)
            .optimization(DeadOperationEliminationPass)
            .mandatory(OddOutputPass);
        assert_eq!(
            runner.pass_names(),
            vec![
                "ConstantOutputPass",
                "OddOutputPass",
                "UnusedOperandEliminationPass",
                "DeadOperationEliminationPass"
            ]
        );
    }
}

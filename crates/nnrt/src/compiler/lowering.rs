//! Backend assignment and memory planning for one subgraph.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use crate::backend::registry::create_backend;
use crate::backend::{Backend, BuiltinBackend, Kernel, BUILTIN_BACKEND};
use crate::error::{Error, Result};
use crate::ir::{Graph, ModelIndex, OperandIndex, Operation, OperationIndex, SubgraphIndex};

use super::memory::{MemoryPlanner, TensorPlan};
use super::options::{CompilerOptions, GraphDumpLevel};
use super::subtensor::SubtensorAnalyzer;

/// Chooses the backend of every operation.
///
/// A per-kind entry in `manual_scheduler` wins; otherwise the first backend of
/// `backend_list` that accepts the operation is used. Control flow always goes to the
/// builtin backend.
pub struct BackendResolver {
    backends: Vec<Arc<dyn Backend>>,
    manual: HashMap<String, Arc<dyn Backend>>,
    builtin: Arc<dyn Backend>,
}

impl BackendResolver {
    pub fn from_options(options: &CompilerOptions) -> Result<Self> {
        let builtin: Arc<dyn Backend> = Arc::new(BuiltinBackend);
        let lookup = |name: &str| -> Result<Arc<dyn Backend>> {
            if name == BUILTIN_BACKEND {
                return Ok(Arc::clone(&builtin));
            }
            create_backend(name)
                .ok_or_else(|| Error::configuration(format!("backend '{name}' is not registered")))
        };
        let backends = options
            .backend_list
            .iter()
            .map(|name| lookup(name.as_str()))
            .collect::<Result<Vec<_>>>()?;
        let manual = options
            .manual_scheduler
            .iter()
            .map(|(kind, name)| Ok((kind.clone(), lookup(name.as_str())?)))
            .collect::<Result<HashMap<_, _>>>()?;
        Ok(Self::new(backends, manual))
    }

    pub fn new(backends: Vec<Arc<dyn Backend>>, manual: HashMap<String, Arc<dyn Backend>>) -> Self {
        Self {
            backends,
            manual,
            builtin: Arc::new(BuiltinBackend),
        }
    }

    pub fn resolve(
        &self,
        index: OperationIndex,
        operation: &Operation,
        graph: &Graph,
    ) -> Result<Arc<dyn Backend>> {
        if operation.kind.is_control_flow() {
            return Ok(Arc::clone(&self.builtin));
        }
        if let Some(backend) = self.manual.get(operation.name()) {
            if backend.supports(operation, graph) {
                return Ok(Arc::clone(backend));
            }
            return Err(Error::Backend(format!(
                "backend '{}' was requested for {} but rejects operation {index}",
                backend.name(),
                operation.name()
            )));
        }
        self.backends
            .iter()
            .find(|backend| backend.supports(operation, graph))
            .cloned()
            .ok_or_else(|| {
                Error::Backend(format!(
                    "no backend accepts operation {index} ({})",
                    operation.kind
                ))
            })
    }
}

/// Operand consumed on a backend other than the one that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub operand: OperandIndex,
    pub consumer: OperationIndex,
    pub from: String,
    pub to: String,
}

/// Subgraph after backend assignment and memory planning. Read-only once built.
pub struct LoweredGraph {
    model: ModelIndex,
    subgraph: SubgraphIndex,
    graph: Graph,
    backends: HashMap<OperationIndex, Arc<dyn Backend>>,
    kernels: HashMap<OperationIndex, Arc<dyn Kernel>>,
    indexed_ranks: Vec<OperationIndex>,
    tensors: TensorPlan,
    transfers: Vec<Transfer>,
}

impl LoweredGraph {
    pub fn lower(
        model: ModelIndex,
        subgraph: SubgraphIndex,
        mut graph: Graph,
        resolver: &BackendResolver,
    ) -> Result<Self> {
        graph.verify()?;
        let indexed_ranks = graph.topological_order()?;

        let mut backends = HashMap::with_capacity(indexed_ranks.len());
        let mut kernels = HashMap::with_capacity(indexed_ranks.len());
        for index in &indexed_ranks {
            let operation = graph.operation(*index);
            let backend = resolver.resolve(*index, operation, &graph)?;
            let kernel = backend.kernel(operation, &graph).map_err(|err| {
                Error::Backend(format!(
                    "backend '{}' failed to build a kernel for {index} ({}): {err}",
                    backend.name(),
                    operation.name()
                ))
            })?;
            tracing::trace!(
                operation = %index,
                kind = operation.name(),
                backend = backend.name(),
                "operation lowered"
            );
            backends.insert(*index, backend);
            kernels.insert(*index, kernel);
        }

        let transfers = collect_transfers(&graph, &indexed_ranks, &backends);
        for transfer in &transfers {
            tracing::debug!(
                operand = %transfer.operand,
                consumer = %transfer.consumer,
                from = %transfer.from,
                to = %transfer.to,
                "cross-backend transfer"
            );
        }

        let subtensors = SubtensorAnalyzer::new(&graph, &indexed_ranks, &backends).analyze();
        let tensors = MemoryPlanner::new(&graph, &indexed_ranks).plan(&subtensors);
        for (index, entry) in tensors.entries() {
            graph.set_buffer(index, entry.buffer.clone());
        }

        tracing::debug!(
            %model,
            %subgraph,
            operations = indexed_ranks.len(),
            owned = tensors.owned_count(),
            aliased = subtensors.children.len(),
            transfers = transfers.len(),
            "subgraph lowered"
        );

        Ok(Self {
            model,
            subgraph,
            graph,
            backends,
            kernels,
            indexed_ranks,
            tensors,
            transfers,
        })
    }

    pub fn model(&self) -> ModelIndex {
        self.model
    }

    pub fn subgraph(&self) -> SubgraphIndex {
        self.subgraph
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Operations in dependency order.
    pub fn indexed_ranks(&self) -> &[OperationIndex] {
        &self.indexed_ranks
    }

    pub fn backend(&self, operation: OperationIndex) -> &Arc<dyn Backend> {
        &self.backends[&operation]
    }

    pub fn kernel(&self, operation: OperationIndex) -> &Arc<dyn Kernel> {
        &self.kernels[&operation]
    }

    pub fn tensors(&self) -> &TensorPlan {
        &self.tensors
    }

    pub fn transfers(&self) -> &[Transfer] {
        &self.transfers
    }

    /// Transfers that must complete before `operation` may start.
    pub fn transfers_into(&self, operation: OperationIndex) -> impl Iterator<Item = &Transfer> + '_ {
        self.transfers
            .iter()
            .filter(move |transfer| transfer.consumer == operation)
    }

    /// Distinct backends used by this subgraph, by name.
    pub fn backend_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .backends
            .values()
            .map(|backend| backend.name().to_string())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn dump(&self, level: GraphDumpLevel) -> Option<String> {
        let mut out = String::new();
        match level {
            GraphDumpLevel::Off => return None,
            GraphDumpLevel::Basic => {
                let _ = writeln!(out, "{}/{}", self.model, self.subgraph);
                for (rank, index) in self.indexed_ranks.iter().enumerate() {
                    let noop = if self.tensors.is_noop(*index) { " (in place)" } else { "" };
                    let _ = writeln!(
                        out,
                        "  #{rank} {index} {} on {}{noop}",
                        self.graph.operation(*index).kind,
                        self.backends[index].name()
                    );
                }
            }
            GraphDumpLevel::Detailed => {
                let _ = writeln!(out, "{}/{}", self.model, self.subgraph);
                let _ = writeln!(out, "{}", self.graph);
                for (rank, index) in self.indexed_ranks.iter().enumerate() {
                    let _ = writeln!(out, "  rank {rank}: {index} on {}", self.backends[index].name());
                }
                for transfer in &self.transfers {
                    let _ = writeln!(
                        out,
                        "  transfer {} {} -> {} for {}",
                        transfer.operand, transfer.from, transfer.to, transfer.consumer
                    );
                }
            }
        }
        Some(out)
    }
}

fn collect_transfers(
    graph: &Graph,
    order: &[OperationIndex],
    backends: &HashMap<OperationIndex, Arc<dyn Backend>>,
) -> Vec<Transfer> {
    let mut transfers = Vec::new();
    for consumer in order {
        let to = backends[consumer].name();
        for input in &graph.operation(*consumer).inputs {
            let Some(producer) = graph.operand(*input).def() else {
                continue;
            };
            let from = backends[&producer].name();
            if from != to {
                transfers.push(Transfer {
                    operand: *input,
                    consumer: *consumer,
                    from: from.to_string(),
                    to: to.to_string(),
                });
            }
        }
    }
    transfers
}

//! Concat elimination.
//!
//! When every input of a `Concat` is produced on the same backend and read only by that
//! `Concat`, each input can live directly inside the concat output buffer at its offset along
//! the concat axis. Producers then write into that window and the `Concat` itself has nothing
//! left to do. Any failed precondition leaves the operation untouched; the analysis never
//! reports an error.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::backend::Backend;
use crate::ir::{Activation, Graph, OpKind, OperandIndex, OperationIndex, SubtensorInfo};

use super::shape_inference::normalize_axis;

/// Result of the aliasing analysis.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SubtensorPlan {
    /// Child operand to the window it occupies in its parent.
    pub children: BTreeMap<OperandIndex, SubtensorInfo>,
    /// Concat operations whose output is fully assembled by its producers.
    pub eliminated: BTreeSet<OperationIndex>,
}

impl SubtensorPlan {
    pub fn parents(&self) -> BTreeSet<OperandIndex> {
        self.children.values().map(|info| info.parent).collect()
    }
}

pub struct SubtensorAnalyzer<'a> {
    graph: &'a Graph,
    order: &'a [OperationIndex],
    backends: &'a HashMap<OperationIndex, Arc<dyn Backend>>,
}

impl<'a> SubtensorAnalyzer<'a> {
    pub fn new(
        graph: &'a Graph,
        order: &'a [OperationIndex],
        backends: &'a HashMap<OperationIndex, Arc<dyn Backend>>,
    ) -> Self {
        Self {
            graph,
            order,
            backends,
        }
    }

    pub fn analyze(&self) -> SubtensorPlan {
        let mut plan = SubtensorPlan::default();
        if crate::env::subtensor_disabled() {
            tracing::debug!("subtensor analysis disabled by environment");
            return plan;
        }
        let mut parents: BTreeSet<OperandIndex> = BTreeSet::new();
        for op_index in self.order {
            let operation = self.graph.operation(*op_index);
            let OpKind::Concat { axis, activation } = &operation.kind else {
                continue;
            };
            match self.candidate(*op_index, *axis, *activation, &plan, &parents) {
                Ok(windows) => {
                    let parent = operation.outputs[0];
                    tracing::debug!(
                        operation = %op_index,
                        %parent,
                        children = windows.len(),
                        "concat eliminated through subtensors"
                    );
                    parents.insert(parent);
                    plan.children.extend(windows);
                    plan.eliminated.insert(*op_index);
                }
                Err(reason) => {
                    tracing::debug!(operation = %op_index, reason, "concat keeps its own buffer");
                }
            }
        }
        plan
    }

    fn candidate(
        &self,
        op_index: OperationIndex,
        axis: i32,
        activation: Activation,
        plan: &SubtensorPlan,
        parents: &BTreeSet<OperandIndex>,
    ) -> Result<Vec<(OperandIndex, SubtensorInfo)>, &'static str> {
        let graph = self.graph;
        let operation = graph.operation(op_index);
        if activation != Activation::None {
            return Err("fused activation rewrites the output");
        }
        let backend = self.backends.get(&op_index).ok_or("operation has no backend")?;
        if !backend.supports_subtensor() {
            return Err("backend does not support subtensors");
        }
        let [parent] = operation.outputs.as_slice() else {
            return Err("concat must have one output");
        };
        let parent = *parent;
        if plan.children.contains_key(&parent) {
            return Err("output already aliases another buffer");
        }
        let parent_operand = graph.operand(parent);
        let parent_dims = parent_operand
            .shape()
            .static_dims()
            .ok_or("output shape unresolved")?;
        let axis = normalize_axis(axis, parent_dims.len()).map_err(|_| "axis out of range")?;

        let mut windows = Vec::with_capacity(operation.inputs.len());
        let mut seen = BTreeSet::new();
        let mut cursor = 0usize;
        for input in &operation.inputs {
            if !seen.insert(*input) {
                return Err("input listed more than once");
            }
            let operand = graph.operand(*input);
            if operand.uses() != [op_index] {
                return Err("input has other consumers");
            }
            if graph.is_input(*input) || graph.is_output(*input) || operand.is_constant() {
                return Err("input is external or constant");
            }
            if parents.contains(input) || plan.children.contains_key(input) {
                return Err("input already takes part in aliasing");
            }
            if operand.dtype() != parent_operand.dtype() {
                return Err("dtype differs from output");
            }
            let producer = operand.def().ok_or("input has no producer")?;
            let producer_backend = self.backends.get(&producer).ok_or("producer has no backend")?;
            if producer_backend.name() != backend.name() {
                return Err("producer runs on another backend");
            }
            let dims = operand
                .shape()
                .static_dims()
                .ok_or("input shape unresolved")?;
            if dims.len() != parent_dims.len() {
                return Err("rank differs from output");
            }
            let mut offset = vec![0; dims.len()];
            offset[axis] = cursor;
            cursor += dims[axis];
            let info = SubtensorInfo {
                parent,
                offset,
                extent: dims,
            };
            if !info.fits_within(&parent_dims) {
                return Err("window exceeds output bounds");
            }
            windows.push((*input, info));
        }
        if cursor != parent_dims[axis] {
            return Err("inputs do not cover the output");
        }
        Ok(windows)
    }
}

//! Tensor memory planning for a lowered subgraph.
//!
//! Positions count executed operations: graph inputs and constants are live from position 0,
//! the operation at rank `r` runs at position `r + 1`, and graph outputs stay live until the
//! position after the last operation.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::ir::{BufferState, Graph, OperandIndex, OperationIndex, SubtensorInfo};
use crate::tensor::DType;

use super::subtensor::SubtensorPlan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LiveRange {
    pub start: usize,
    pub end: usize,
}

impl LiveRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn covers(&self, other: &LiveRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    fn extend(&mut self, other: &LiveRange) {
        self.start = self.start.min(other.start);
        self.end = self.end.max(other.end);
    }
}

/// Planned storage of one operand.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorEntry {
    pub dtype: DType,
    pub dims: Vec<usize>,
    pub buffer: BufferState,
    pub live: LiveRange,
    pub constant: bool,
}

/// Buffer plan for every operand of a lowered subgraph.
#[derive(Debug, Clone, Default)]
pub struct TensorPlan {
    entries: BTreeMap<OperandIndex, TensorEntry>,
    releases: BTreeMap<usize, Vec<OperandIndex>>,
    noop: BTreeSet<OperationIndex>,
}

impl TensorPlan {
    pub fn entry(&self, operand: OperandIndex) -> Option<&TensorEntry> {
        self.entries.get(&operand)
    }

    pub fn entries(&self) -> impl Iterator<Item = (OperandIndex, &TensorEntry)> + '_ {
        self.entries.iter().map(|(index, entry)| (*index, entry))
    }

    pub fn subtensor(&self, operand: OperandIndex) -> Option<&SubtensorInfo> {
        match &self.entries.get(&operand)?.buffer {
            BufferState::Aliased(info) => Some(info),
            _ => None,
        }
    }

    pub fn children_of(&self, parent: OperandIndex) -> Vec<OperandIndex> {
        self.entries
            .iter()
            .filter(|(_, entry)| {
                matches!(&entry.buffer, BufferState::Aliased(info) if info.parent == parent)
            })
            .map(|(index, _)| *index)
            .collect()
    }

    /// Whether the operation's output is assembled in place and the kernel is skipped.
    pub fn is_noop(&self, operation: OperationIndex) -> bool {
        self.noop.contains(&operation)
    }

    /// Owned buffers whose last reader runs at `position`.
    pub fn releases_after(&self, position: usize) -> &[OperandIndex] {
        self.releases
            .get(&position)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn owned_count(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.buffer == BufferState::Owned && !entry.constant)
            .count()
    }
}

/// Computes live ranges, applies subtensor aliasing and derives the release schedule.
pub struct MemoryPlanner<'a> {
    graph: &'a Graph,
    order: &'a [OperationIndex],
}

impl<'a> MemoryPlanner<'a> {
    pub fn new(graph: &'a Graph, order: &'a [OperationIndex]) -> Self {
        Self { graph, order }
    }

    pub fn plan(&self, subtensors: &SubtensorPlan) -> TensorPlan {
        let graph = self.graph;
        let ranges = self.live_ranges();
        let mut entries = BTreeMap::new();
        for (index, operand) in graph.operands().iter() {
            let Some(live) = ranges.get(&index).copied() else {
                continue;
            };
            let buffer = match subtensors.children.get(&index) {
                Some(info) => BufferState::Aliased(info.clone()),
                None => BufferState::Owned,
            };
            entries.insert(
                index,
                TensorEntry {
                    dtype: operand.dtype(),
                    dims: operand.shape().static_dims().unwrap_or_default(),
                    buffer,
                    live,
                    constant: operand.is_constant(),
                },
            );
        }

        // A parent must outlive all of its children.
        let child_ranges: Vec<(OperandIndex, LiveRange)> = subtensors
            .children
            .iter()
            .filter_map(|(child, info)| Some((info.parent, entries.get(child)?.live)))
            .collect();
        for (parent, child_live) in child_ranges {
            if let Some(entry) = entries.get_mut(&parent) {
                entry.live.extend(&child_live);
            }
        }

        let mut releases: BTreeMap<usize, Vec<OperandIndex>> = BTreeMap::new();
        let final_position = self.order.len() + 1;
        for (index, entry) in &entries {
            if entry.constant || entry.buffer != BufferState::Owned || entry.live.end >= final_position
            {
                continue;
            }
            releases.entry(entry.live.end).or_default().push(*index);
        }

        TensorPlan {
            entries,
            releases,
            noop: subtensors.eliminated.clone(),
        }
    }

    fn live_ranges(&self) -> BTreeMap<OperandIndex, LiveRange> {
        let graph = self.graph;
        let mut ranges: BTreeMap<OperandIndex, LiveRange> = BTreeMap::new();
        for (index, operand) in graph.operands().iter() {
            if operand.is_constant() || graph.is_input(index) {
                ranges.insert(index, LiveRange::new(0, 0));
            }
        }
        for (rank, op_index) in self.order.iter().enumerate() {
            let position = rank + 1;
            let operation = graph.operation(*op_index);
            for output in &operation.outputs {
                ranges.insert(*output, LiveRange::new(position, position));
            }
        }
        for (rank, op_index) in self.order.iter().enumerate() {
            let position = rank + 1;
            for input in &graph.operation(*op_index).inputs {
                if let Some(range) = ranges.get_mut(input) {
                    range.end = range.end.max(position);
                }
            }
        }
        let final_position = self.order.len() + 1;
        for output in graph.outputs() {
            if let Some(range) = ranges.get_mut(output) {
                range.end = final_position;
            }
        }
        ranges
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{OpKind, OperandInfo};

    #[test]
    fn intermediate_is_released_after_last_reader() {
        let mut graph = Graph::new();
        let x = graph.add_operand(OperandInfo::f32(&[2]));
        let y = graph.add_operand(OperandInfo::f32(&[2]));
        let z = graph.add_operand(OperandInfo::f32(&[2]));
        graph.add_input(x);
        let first = graph.add_op(OpKind::Permute, [x], [y]);
        let second = graph.add_op(OpKind::Permute, [y], [z]);
        graph.add_output(z);

        let order = vec![first, second];
        let plan = MemoryPlanner::new(&graph, &order).plan(&SubtensorPlan::default());
        assert_eq!(plan.entry(y).unwrap().live, LiveRange::new(1, 2));
        assert_eq!(plan.releases_after(1), &[x]);
        assert_eq!(plan.releases_after(2), &[y]);
        assert_eq!(plan.entry(z).unwrap().live.end, 3);
        assert!(plan.releases_after(3).is_empty());
    }
}

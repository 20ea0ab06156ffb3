//! Static shape inference.
//!
//! Shapes flow through each subgraph in dependency order, so every input shape is settled
//! before its consumer is visited. `Call` and `If` recurse into the referenced child subgraphs
//! with the caller's input shapes and copy the child's output shapes back. Every shape written
//! here is marked final; a second run over a resolved model changes nothing.

use std::collections::BTreeSet;

use crate::error::{Error, Result};
use crate::ir::{Graph, LossKind, Model, OpKind, OperationIndex, Shape, SubgraphIndex};
use crate::tensor::DType;

/// Runs inference over every subgraph of a model, starting from the primary one.
pub struct StaticShapeInferer<'a> {
    model: &'a mut Model,
    visiting: Vec<SubgraphIndex>,
    visited: BTreeSet<SubgraphIndex>,
}

impl<'a> StaticShapeInferer<'a> {
    pub fn new(model: &'a mut Model) -> Self {
        Self {
            model,
            visiting: Vec::new(),
            visited: BTreeSet::new(),
        }
    }

    /// Returns whether any operand shape changed.
    pub fn infer(mut self) -> Result<bool> {
        let mut changed = false;
        for index in self.model.subgraph_indices() {
            if !self.visited.contains(&index) {
                changed |= self.infer_subgraph(index, None)?;
            }
        }
        Ok(changed)
    }

    fn infer_subgraph(
        &mut self,
        index: SubgraphIndex,
        input_shapes: Option<&[Shape]>,
    ) -> Result<bool> {
        if self.visiting.contains(&index) {
            return Err(Error::unsupported_model(format!(
                "{index} is reached recursively through control flow"
            )));
        }
        let mut graph = self.model.take_subgraph(index).ok_or_else(|| {
            Error::unsupported_model(format!("control flow references missing {index}"))
        })?;
        self.visiting.push(index);
        let result = self.infer_graph(&mut graph, input_shapes);
        self.visiting.pop();
        self.model.restore_subgraph(index, graph);
        self.visited.insert(index);
        let changed = result?;
        tracing::trace!(subgraph = %index, changed, "shape inference finished");
        Ok(changed)
    }

    fn infer_graph(&mut self, graph: &mut Graph, input_shapes: Option<&[Shape]>) -> Result<bool> {
        let mut changed = false;

        if let Some(shapes) = input_shapes {
            let inputs = graph.inputs().to_vec();
            if inputs.len() != shapes.len() {
                return Err(Error::graph_shape_mismatch(format!(
                    "subgraph expects {} inputs, caller passes {}",
                    inputs.len(),
                    shapes.len()
                )));
            }
            for (input, shape) in inputs.iter().zip(shapes) {
                changed |= merge_into(graph, *input, shape, None)?;
            }
        }
        let seeds: Vec<_> = graph
            .operands()
            .iter()
            .filter(|(index, operand)| {
                operand.shape().is_resolved() && (operand.is_constant() || graph.is_input(*index))
            })
            .map(|(index, _)| index)
            .collect();
        for seed in seeds {
            graph.mark_shape_final(seed);
        }

        for op_index in graph.topological_order()? {
            let operation = graph.operation(op_index).clone();
            let inputs: Vec<Shape> = operation
                .inputs
                .iter()
                .map(|input| graph.operand(*input).shape().clone())
                .collect();

            let outputs = match &operation.kind {
                OpKind::Call { subgraph } => {
                    if !inputs.iter().all(Shape::is_resolved) {
                        continue;
                    }
                    changed |= self.infer_subgraph(*subgraph, Some(&inputs))?;
                    self.subgraph_output_shapes(*subgraph, op_index)?
                }
                OpKind::If {
                    then_subgraph,
                    else_subgraph,
                } => {
                    check_condition(graph, op_index)?;
                    if !inputs.iter().all(Shape::is_resolved) {
                        continue;
                    }
                    let args = &inputs[1..];
                    changed |= self.infer_subgraph(*then_subgraph, Some(args))?;
                    changed |= self.infer_subgraph(*else_subgraph, Some(args))?;
                    let then_shapes = self.subgraph_output_shapes(*then_subgraph, op_index)?;
                    let else_shapes = self.subgraph_output_shapes(*else_subgraph, op_index)?;
                    if then_shapes != else_shapes {
                        return Err(Error::shape_mismatch(
                            op_index,
                            "If branches produce different output shapes",
                        ));
                    }
                    then_shapes
                }
                kind => {
                    let Some(dims) = resolved_dims(&inputs) else {
                        continue;
                    };
                    operation_rule(kind, &dims)
                        .map_err(|detail| Error::shape_mismatch(op_index, detail))?
                        .iter()
                        .map(|dims| Shape::from_static(dims))
                        .collect()
                }
            };

            if outputs.len() != operation.outputs.len() {
                return Err(Error::shape_mismatch(
                    op_index,
                    format!(
                        "{} produces {} outputs but has {} output operands",
                        operation.name(),
                        outputs.len(),
                        operation.outputs.len()
                    ),
                ));
            }
            for (output, shape) in operation.outputs.iter().zip(outputs.iter()) {
                changed |= merge_into(graph, *output, shape, Some(op_index))?;
                if graph.operand(*output).shape().is_resolved() {
                    graph.mark_shape_final(*output);
                }
            }
        }
        Ok(changed)
    }

    fn subgraph_output_shapes(
        &self,
        subgraph: SubgraphIndex,
        caller: OperationIndex,
    ) -> Result<Vec<Shape>> {
        let graph = self.model.subgraph(subgraph).ok_or_else(|| {
            Error::shape_mismatch(caller, format!("called subgraph {subgraph} does not exist"))
        })?;
        Ok(graph
            .outputs()
            .iter()
            .map(|output| graph.operand(*output).shape().clone())
            .collect())
    }
}

/// Merges `shape` into the operand's current shape; known dimensions must agree.
fn merge_into(
    graph: &mut Graph,
    operand: crate::ir::OperandIndex,
    shape: &Shape,
    operation: Option<OperationIndex>,
) -> Result<bool> {
    let current = graph.operand(operand).shape().clone();
    let mismatch = |detail: String| match operation {
        Some(op) => Error::shape_mismatch(op, detail),
        None => Error::graph_shape_mismatch(detail),
    };
    let merged = current.merge(shape).ok_or_else(|| {
        mismatch(format!(
            "operand {operand} declared as {current} but inferred as {shape}"
        ))
    })?;
    graph
        .set_shape(operand, merged)
        .map_err(|err| match err {
            Error::ShapeMismatch { detail, .. } => mismatch(detail),
            other => other,
        })
}

/// `If` takes a one-element boolean condition ahead of the branch arguments.
pub(crate) fn check_condition(graph: &Graph, op_index: OperationIndex) -> Result<()> {
    let Some(condition) = graph.operation(op_index).inputs.first() else {
        return Err(Error::shape_mismatch(op_index, "If requires a condition input"));
    };
    let operand = graph.operand(*condition);
    if operand.dtype() != DType::Bool {
        return Err(Error::shape_mismatch(
            op_index,
            format!("If condition must be bool, got {}", operand.dtype()),
        ));
    }
    match operand.shape().element_count() {
        Some(1) | None => Ok(()),
        Some(count) => Err(Error::shape_mismatch(
            op_index,
            format!("If condition must hold one element, got {count}"),
        )),
    }
}

fn resolved_dims(shapes: &[Shape]) -> Option<Vec<Vec<usize>>> {
    shapes.iter().map(Shape::static_dims).collect()
}

/// Output dims of a non-control-flow operation, given resolved input dims.
pub(crate) fn operation_rule(
    kind: &OpKind,
    inputs: &[Vec<usize>],
) -> std::result::Result<Vec<Vec<usize>>, String> {
    let input = |position: usize| {
        inputs
            .get(position)
            .ok_or_else(|| format!("{} is missing input {position}", kind.name()))
    };
    let output = match kind {
        OpKind::BinaryArithmetic { .. } => broadcast(input(0)?, input(1)?)?,
        OpKind::FullyConnected { .. } => fully_connected(input(0)?, input(1)?, inputs.get(2))?,
        OpKind::ElementwiseActivation(_)
        | OpKind::Softmax { .. }
        | OpKind::L2Normalize
        | OpKind::Permute => input(0)?.clone(),
        OpKind::Concat { axis, .. } => concat(inputs, *axis)?,
        OpKind::Reshape { shape } => reshape(input(0)?, shape)?,
        OpKind::Transpose { perm } => transpose(input(0)?, perm)?,
        OpKind::Loss { kind: loss } => {
            let (pred, target) = (input(0)?, input(1)?);
            if pred != target {
                return Err(format!(
                    "loss prediction {pred:?} and target {target:?} differ"
                ));
            }
            let batch = *pred.first().ok_or("loss needs at least one dimension")?;
            match loss {
                LossKind::MeanSquaredError => vec![batch],
                LossKind::CategoricalCrossEntropy => vec![1],
            }
        }
        OpKind::Call { .. } | OpKind::If { .. } => {
            return Err(format!("{} has no local shape rule", kind.name()))
        }
    };
    Ok(vec![output])
}

pub(crate) fn broadcast(lhs: &[usize], rhs: &[usize]) -> std::result::Result<Vec<usize>, String> {
    let rank = lhs.len().max(rhs.len());
    let mut out = vec![0; rank];
    for axis in 0..rank {
        let l = dim_from_right(lhs, rank, axis);
        let r = dim_from_right(rhs, rank, axis);
        out[axis] = match (l, r) {
            (a, b) if a == b => a,
            (1, b) => b,
            (a, 1) => a,
            (a, b) => {
                return Err(format!(
                    "cannot broadcast {lhs:?} with {rhs:?} (axis {axis}: {a} vs {b})"
                ))
            }
        };
    }
    Ok(out)
}

fn dim_from_right(dims: &[usize], rank: usize, axis: usize) -> usize {
    let pad = rank - dims.len();
    if axis < pad {
        1
    } else {
        dims[axis - pad]
    }
}

fn fully_connected(
    input: &[usize],
    weights: &[usize],
    bias: Option<&Vec<usize>>,
) -> std::result::Result<Vec<usize>, String> {
    let [units, depth] = weights else {
        return Err(format!("weights must be rank 2, got {weights:?}"));
    };
    let elements: usize = input.iter().product();
    if *depth == 0 || elements % depth != 0 {
        return Err(format!(
            "input {input:?} cannot be flattened to rows of {depth}"
        ));
    }
    if let Some(bias) = bias {
        if bias.as_slice() != [*units] {
            return Err(format!("bias {bias:?} does not match {units} units"));
        }
    }
    Ok(vec![elements / depth, *units])
}

pub(crate) fn normalize_axis(axis: i32, rank: usize) -> std::result::Result<usize, String> {
    let resolved = if axis < 0 { axis + rank as i32 } else { axis };
    if resolved < 0 || resolved as usize >= rank {
        return Err(format!("axis {axis} is out of range for rank {rank}"));
    }
    Ok(resolved as usize)
}

fn concat(inputs: &[Vec<usize>], axis: i32) -> std::result::Result<Vec<usize>, String> {
    let first = inputs.first().ok_or("Concat needs at least one input")?;
    let axis = normalize_axis(axis, first.len())?;
    let mut out = first.clone();
    for dims in &inputs[1..] {
        if dims.len() != first.len() {
            return Err(format!("Concat inputs {first:?} and {dims:?} differ in rank"));
        }
        for (position, (a, b)) in first.iter().zip(dims.iter()).enumerate() {
            if position != axis && a != b {
                return Err(format!(
                    "Concat inputs {first:?} and {dims:?} differ outside axis {axis}"
                ));
            }
        }
        out[axis] += dims[axis];
    }
    Ok(out)
}

fn reshape(input: &[usize], target: &[i64]) -> std::result::Result<Vec<usize>, String> {
    let elements: usize = input.iter().product();
    let mut inferred = None;
    let mut known = 1usize;
    let mut out = Vec::with_capacity(target.len());
    for (position, dim) in target.iter().enumerate() {
        match *dim {
            -1 if inferred.is_none() => {
                inferred = Some(position);
                out.push(0);
            }
            d if d >= 0 => {
                known *= d as usize;
                out.push(d as usize);
            }
            d => return Err(format!("invalid reshape dimension {d} in {target:?}")),
        }
    }
    match inferred {
        Some(position) => {
            if known == 0 || elements % known != 0 {
                return Err(format!("cannot reshape {input:?} into {target:?}"));
            }
            out[position] = elements / known;
        }
        None if known != elements => {
            return Err(format!("cannot reshape {input:?} into {target:?}"));
        }
        None => {}
    }
    Ok(out)
}

fn transpose(input: &[usize], perm: &[usize]) -> std::result::Result<Vec<usize>, String> {
    let mut seen = vec![false; input.len()];
    if perm.len() != input.len() {
        return Err(format!("permutation {perm:?} does not match rank {}", input.len()));
    }
    for axis in perm {
        match seen.get_mut(*axis) {
            Some(flag) if !*flag => *flag = true,
            _ => return Err(format!("{perm:?} is not a permutation")),
        }
    }
    Ok(perm.iter().map(|axis| input[*axis]).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Activation, ArithmeticKind, Dimension};

    #[test]
    fn broadcast_follows_numpy_rules() {
        assert_eq!(broadcast(&[2, 3], &[3]).unwrap(), vec![2, 3]);
        assert_eq!(broadcast(&[4, 1, 5], &[3, 1]).unwrap(), vec![4, 3, 5]);
        assert!(broadcast(&[2, 3], &[4]).is_err());
    }

    #[test]
    fn reshape_resolves_one_wildcard() {
        assert_eq!(reshape(&[2, 3, 4], &[-1, 4]).unwrap(), vec![6, 4]);
        assert!(reshape(&[2, 3], &[-1, -1]).is_err());
        assert!(reshape(&[2, 3], &[4]).is_err());
    }

    #[test]
    fn concat_sums_axis() {
        let out = concat(&[vec![1, 4, 4, 1], vec![1, 4, 4, 2]], -1).unwrap();
        assert_eq!(out, vec![1, 4, 4, 3]);
        assert!(concat(&[vec![1, 4], vec![2, 4]], 1).is_err());
    }

    #[test]
    fn mismatched_declared_shape_is_reported() {
        let mut graph = Graph::new();
        let a = graph.add_operand(crate::ir::OperandInfo::f32(&[2, 3]));
        let b = graph.add_operand(crate::ir::OperandInfo::f32(&[3]));
        let c = graph.add_operand(crate::ir::OperandInfo::f32(&[2, 4]));
        graph.add_input(a);
        graph.add_input(b);
        let op = graph.add_op(
            OpKind::BinaryArithmetic {
                kind: ArithmeticKind::Add,
                activation: Activation::None,
            },
            [a, b],
            [c],
        );
        graph.add_output(c);
        let mut model = Model::single(graph);
        match StaticShapeInferer::new(&mut model).infer() {
            Err(Error::ShapeMismatch { operation, .. }) => {
                assert_eq!(operation, crate::error::OperationRef::Operation(op));
            }
            other => panic!("expected shape mismatch, got {other:?}"),
        }
    }

    #[test]
    fn unknown_output_dims_are_filled() {
        let mut graph = Graph::new();
        let a = graph.add_operand(crate::ir::OperandInfo::f32(&[2, 3]));
        let out = graph.add_operand(crate::ir::OperandInfo::new(
            Shape::new([Dimension::Unknown, Dimension::Static(3)]),
            crate::tensor::DType::F32,
        ));
        graph.add_input(a);
        graph.add_op(OpKind::ElementwiseActivation(Activation::Relu), [a], [out]);
        graph.add_output(out);
        let mut model = Model::single(graph);
        assert!(StaticShapeInferer::new(&mut model).infer().unwrap());
        let graph = model.primary().unwrap();
        assert_eq!(graph.operand(out).shape(), &Shape::from_static(&[2, 3]));
        assert!(graph.operand(out).is_shape_final());
        assert!(!StaticShapeInferer::new(&mut model).infer().unwrap());
    }
}

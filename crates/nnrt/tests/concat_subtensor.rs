mod common;

use anyhow::Result;
use nnrt::ir::{Activation, Graph, OpKind, OperandInfo};
use nnrt::{compile, CompilerOptions, ExecutorKind, HostTensor};

const INPUT1: [f32; 16] = [
    -2.0978436, -25.836285, 7.9663463, -52.951416, -9.174321, -10.963295, 1.4337301, -39.000927,
    -11.76153, -24.070623, -21.426125, -32.041714, -2.29292, -7.595441, -15.297459, -20.068735,
];

const INPUT2: [f32; 32] = [
    -23.881905, -8.470397, -52.49611, -21.756306, 1.581161, -26.177217, -39.463478, -2.172443,
    -30.588694, -7.90017, -17.604687, -27.376356, -26.49272, -15.772057, 8.418157, -36.710365,
    -35.77088, -27.592611, -5.0617495, -7.8632812, 10.318075, -33.451294, -53.1594, -33.312737,
    -6.132754, -21.647987, -38.427383, -41.75349, -22.417152, -1.243468, -19.772722, -55.897236,
];

const REFERENCE: [f32; 48] = [
    -2.0978436, -23.881905, -8.470397, -25.836285, -52.49611, -21.756306, 7.9663463, 1.581161,
    -26.177217, -52.951416, -39.463478, -2.172443, -9.174321, -30.588694, -7.90017, -10.963295,
    -17.604687, -27.376356, 1.4337301, -26.49272, -15.772057, -39.000927, 8.418157, -36.710365,
    -11.76153, -35.77088, -27.592611, -24.070623, -5.0617495, -7.8632812, -21.426125, 10.318075,
    -33.451294, -32.041714, -53.1594, -33.312737, -2.29292, -6.132754, -21.647987, -7.595441,
    -38.427383, -41.75349, -15.297459, -22.417152, -1.243468, -20.068735, -19.772722, -55.897236,
];

/// Two inputs copied by `Permute` and joined on the channel axis, so that the concat inputs are
/// intermediates read only by the concat.
fn concat_graph() -> Graph {
    let mut graph = Graph::new();
    let in1 = graph.add_operand(OperandInfo::f32(&[1, 4, 4, 1]));
    let in2 = graph.add_operand(OperandInfo::f32(&[1, 4, 4, 2]));
    let a = graph.add_operand(OperandInfo::f32(&[1, 4, 4, 1]));
    let b = graph.add_operand(OperandInfo::f32(&[1, 4, 4, 2]));
    let out = graph.add_operand(OperandInfo::f32(&[1, 4, 4, 3]));
    graph.add_input(in1);
    graph.add_input(in2);
    graph.add_op(OpKind::Permute, [in1], [a]);
    graph.add_op(OpKind::Permute, [in2], [b]);
    graph.add_op(
        OpKind::Concat {
            axis: -1,
            activation: Activation::None,
        },
        [a, b],
        [out],
    );
    graph.add_output(out);
    graph
}

fn inputs() -> Vec<HostTensor> {
    vec![
        common::tensor(&[1, 4, 4, 1], INPUT1.to_vec()),
        common::tensor(&[1, 4, 4, 2], INPUT2.to_vec()),
    ]
}

fn assert_bitwise_reference(output: &HostTensor) {
    assert_eq!(output.dims(), &[1, 4, 4, 3]);
    let values = output.as_f32().expect("f32 output");
    let bits: Vec<u32> = values.iter().map(|v| v.to_bits()).collect();
    let expected: Vec<u32> = REFERENCE.iter().map(|v| v.to_bits()).collect();
    assert_eq!(bits, expected);
}

#[test]
fn concat_is_assembled_in_place() -> Result<()> {
    common::setup();
    let artifact = compile(concat_graph(), &CompilerOptions::default())?;

    let executor = artifact.executors().entry().expect("entry executor");
    let lowered = executor.lowered();
    let concat = lowered
        .indexed_ranks()
        .iter()
        .copied()
        .find(|index| lowered.graph().operation(*index).name() == "Concat")
        .expect("concat survives lowering");
    assert!(lowered.tensors().is_noop(concat));
    let parent = lowered.graph().operation(concat).outputs[0];
    assert_eq!(lowered.tensors().children_of(parent).len(), 2);

    let outputs = artifact.execute(&inputs())?;
    assert_bitwise_reference(&outputs[0]);
    Ok(())
}

#[test]
fn concat_without_subtensor_support_matches_reference() -> Result<()> {
    common::setup();
    let options = CompilerOptions::default().with_backends(["cpu-plain"]);
    let artifact = compile(concat_graph(), &options)?;
    let lowered = artifact.executors().entry().expect("entry executor").lowered();
    assert!(lowered
        .indexed_ranks()
        .iter()
        .all(|index| !lowered.tensors().is_noop(*index)));

    let outputs = artifact.execute(&inputs())?;
    assert_bitwise_reference(&outputs[0]);
    Ok(())
}

#[test]
fn dataflow_writes_through_the_same_windows() -> Result<()> {
    common::setup();
    let options = CompilerOptions::default().with_executor(ExecutorKind::Dataflow);
    let artifact = compile(concat_graph(), &options)?;
    let outputs = artifact.execute(&inputs())?;
    assert_bitwise_reference(&outputs[0]);
    Ok(())
}

#[test]
fn concat_of_graph_inputs_keeps_its_kernel() -> Result<()> {
    common::setup();
    let mut graph = Graph::new();
    let in1 = graph.add_operand(OperandInfo::f32(&[1, 4, 4, 1]));
    let in2 = graph.add_operand(OperandInfo::f32(&[1, 4, 4, 2]));
    let out = graph.add_operand(OperandInfo::f32(&[1, 4, 4, 3]));
    graph.add_input(in1);
    graph.add_input(in2);
    let concat = graph.add_op(
        OpKind::Concat {
            axis: 3,
            activation: Activation::None,
        },
        [in1, in2],
        [out],
    );
    graph.add_output(out);

    let artifact = compile(graph, &CompilerOptions::default())?;
    let lowered = artifact.executors().entry().expect("entry executor").lowered();
    assert!(!lowered.tensors().is_noop(concat));
    let outputs = artifact.execute(&inputs())?;
    assert_bitwise_reference(&outputs[0]);
    Ok(())
}

#[test]
fn concat_input_with_another_reader_is_not_aliased() -> Result<()> {
    common::setup();
    let mut graph = concat_graph();
    let concat = graph
        .operations()
        .indices()
        .into_iter()
        .find(|index| graph.operation(*index).name() == "Concat")
        .expect("concat");
    let (a, b) = {
        let inputs = &graph.operation(concat).inputs;
        (inputs[0], inputs[1])
    };
    let relu = graph.add_operand(OperandInfo::f32(&[1, 4, 4, 1]));
    graph.add_op(OpKind::ElementwiseActivation(Activation::Relu), [a], [relu]);
    graph.add_output(relu);

    let artifact = compile(graph, &CompilerOptions::default())?;
    let lowered = artifact.executors().entry().expect("entry executor").lowered();
    assert!(!lowered.tensors().is_noop(concat));
    assert!(lowered.tensors().subtensor(a).is_none());
    // The exclusive input stays owned too; aliasing covers a whole concat or none of it.
    assert!(lowered.tensors().subtensor(b).is_none());
    let parent = lowered.graph().operation(concat).outputs[0];
    assert!(lowered.tensors().children_of(parent).is_empty());

    let outputs = artifact.execute(&inputs())?;
    assert_bitwise_reference(&outputs[0]);
    let relu_values = outputs[1].as_f32().expect("f32 output");
    let expected: Vec<f32> = INPUT1.iter().map(|v| v.max(0.0)).collect();
    assert_eq!(relu_values, expected.as_slice());
    Ok(())
}

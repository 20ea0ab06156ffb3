#![allow(dead_code)]

use nnrt::ir::{Activation, ArithmeticKind, Graph, OpKind, OperandIndex, OperandInfo};
use nnrt::HostTensor;

pub fn setup() {
    nnrt_backend_ref_cpu::register_cpu_backend();
}

pub fn tensor(dims: &[usize], values: Vec<f32>) -> HostTensor {
    HostTensor::from_f32(dims, values).expect("valid tensor")
}

pub fn add() -> OpKind {
    OpKind::BinaryArithmetic {
        kind: ArithmeticKind::Add,
        activation: Activation::None,
    }
}

/// `relu(fc(x, w, b)) + c` followed by a softmax; every operand shape declared.
pub fn dense_graph() -> (Graph, OperandIndex) {
    let mut graph = Graph::new();
    let x = graph.add_operand(OperandInfo::f32(&[2, 3]));
    let w = graph.add_constant(
        OperandInfo::f32(&[4, 3]),
        tensor(&[4, 3], (0..12).map(|v| (v as f32 - 6.0) / 10.0).collect()),
    );
    let b = graph.add_constant(OperandInfo::f32(&[4]), tensor(&[4], vec![0.1, -0.1, 0.2, 0.0]));
    let c = graph.add_constant(OperandInfo::f32(&[4]), tensor(&[4], vec![0.5, 0.25, 0.0, -0.5]));
    let hidden = graph.add_operand(OperandInfo::f32(&[2, 4]));
    let shifted = graph.add_operand(OperandInfo::f32(&[2, 4]));
    let probs = graph.add_operand(OperandInfo::f32(&[2, 4]));
    graph.add_input(x);
    graph.add_op(
        OpKind::FullyConnected {
            activation: Activation::Relu,
        },
        [x, w, b],
        [hidden],
    );
    graph.add_op(add(), [hidden, c], [shifted]);
    graph.add_op(OpKind::Softmax { beta: 1.0 }, [shifted], [probs]);
    graph.add_output(probs);
    (graph, x)
}

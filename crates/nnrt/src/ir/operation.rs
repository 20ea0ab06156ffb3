use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use super::index::{OperandIndex, SubgraphIndex};

/// Fused activation applied to an operation's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Activation {
    #[default]
    None,
    Relu,
    Relu6,
    Sigmoid,
    Tanh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArithmeticKind {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LossKind {
    MeanSquaredError,
    CategoricalCrossEntropy,
}

/// Operation kind together with its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpKind {
    /// `lhs (op) rhs` with numpy-style broadcasting.
    BinaryArithmetic {
        kind: ArithmeticKind,
        activation: Activation,
    },
    /// Inputs: `input, weights[N, K], bias[N]?`.
    FullyConnected { activation: Activation },
    ElementwiseActivation(Activation),
    Concat { axis: i32, activation: Activation },
    /// Target shape, `-1` marks the inferred axis.
    Reshape { shape: Vec<i64> },
    Softmax { beta: f32 },
    Transpose { perm: Vec<usize> },
    L2Normalize,
    /// Plain copy; used where an output must be produced by an operation.
    Permute,
    /// Runs a child subgraph on the inputs.
    Call { subgraph: SubgraphIndex },
    /// Inputs: `cond, args...`; runs one of two child subgraphs on `args`.
    If {
        then_subgraph: SubgraphIndex,
        else_subgraph: SubgraphIndex,
    },
    /// Inputs: `prediction, target`.
    Loss { kind: LossKind },
}

impl OpKind {
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::BinaryArithmetic { .. } => "BinaryArithmetic",
            OpKind::FullyConnected { .. } => "FullyConnected",
            OpKind::ElementwiseActivation(_) => "ElementwiseActivation",
            OpKind::Concat { .. } => "Concat",
            OpKind::Reshape { .. } => "Reshape",
            OpKind::Softmax { .. } => "Softmax",
            OpKind::Transpose { .. } => "Transpose",
            OpKind::L2Normalize => "L2Normalize",
            OpKind::Permute => "Permute",
            OpKind::Call { .. } => "Call",
            OpKind::If { .. } => "If",
            OpKind::Loss { .. } => "Loss",
        }
    }

    pub fn is_control_flow(&self) -> bool {
        matches!(self, OpKind::Call { .. } | OpKind::If { .. })
    }

    /// Child subgraphs referenced by control-flow kinds.
    pub fn child_subgraphs(&self) -> SmallVec<[SubgraphIndex; 2]> {
        match self {
            OpKind::Call { subgraph } => smallvec::smallvec![*subgraph],
            OpKind::If {
                then_subgraph,
                else_subgraph,
            } => smallvec::smallvec![*then_subgraph, *else_subgraph],
            _ => SmallVec::new(),
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::BinaryArithmetic { kind, activation } => {
                write!(f, "{kind:?}(act={activation:?})")
            }
            OpKind::FullyConnected { activation } => write!(f, "FullyConnected(act={activation:?})"),
            OpKind::ElementwiseActivation(activation) => write!(f, "{activation:?}"),
            OpKind::Concat { axis, activation } => {
                write!(f, "Concat(axis={axis}, act={activation:?})")
            }
            OpKind::Reshape { shape } => write!(f, "Reshape({shape:?})"),
            OpKind::Softmax { beta } => write!(f, "Softmax(beta={beta})"),
            OpKind::Transpose { perm } => write!(f, "Transpose({perm:?})"),
            OpKind::Call { subgraph } => write!(f, "Call({subgraph})"),
            OpKind::If {
                then_subgraph,
                else_subgraph,
            } => write!(f, "If(then={then_subgraph}, else={else_subgraph})"),
            OpKind::Loss { kind } => write!(f, "Loss({kind:?})"),
            other => f.write_str(other.name()),
        }
    }
}

/// Marks an operation as the trainable variant of its kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainableInfo {
    /// Per input: whether backward produces a gradient for it.
    pub input_grads: SmallVec<[bool; 4]>,
}

/// Graph node consuming and producing operands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OpKind,
    pub inputs: SmallVec<[OperandIndex; 4]>,
    pub outputs: SmallVec<[OperandIndex; 2]>,
    /// Set only on trainable variants.
    pub training: Option<TrainableInfo>,
}

impl Operation {
    pub fn new(
        kind: OpKind,
        inputs: impl IntoIterator<Item = OperandIndex>,
        outputs: impl IntoIterator<Item = OperandIndex>,
    ) -> Self {
        Self {
            kind,
            inputs: inputs.into_iter().collect(),
            outputs: outputs.into_iter().collect(),
            training: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn is_trainable(&self) -> bool {
        self.training.is_some()
    }
}

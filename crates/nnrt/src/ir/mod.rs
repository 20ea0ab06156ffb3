//! Graph IR: operands and operations stored in stable-index arenas.

mod arena;
mod graph;
mod index;
mod model;
mod operand;
mod operation;

pub use arena::Arena;
pub use graph::Graph;
pub use index::{ArenaIndex, ModelIndex, OperandIndex, OperationIndex, SubgraphIndex};
pub use model::{Model, Package};
pub use operand::{
    BufferState, Dimension, Layout, Operand, OperandInfo, Shape, SubtensorInfo,
};
pub use operation::{
    Activation, ArithmeticKind, LossKind, OpKind, Operation, TrainableInfo,
};

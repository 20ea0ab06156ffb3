//! Training: trainable conversion, loss insertion and the forward/backward executor.

mod compiler;
mod converter;
mod executor;
mod graph;
pub mod info;
mod loss_insertion;

pub use compiler::{TrainingArtifact, TrainingCompiler};
pub use converter::TrainableOperationConverter;
pub use executor::{OptimizerUpdate, StepOutput, TrainableExecutor};
pub use graph::{LossBinding, TrainableGraph};
pub use info::{LossInfo, LossReduction, OptimizerInfo, OptimizerKind, TrainingInfo};
pub use loss_insertion::LossInsertionPass;

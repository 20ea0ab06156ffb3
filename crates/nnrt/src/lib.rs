//! Graph compiler and execution scheduler for on-device neural networks.
//!
//! A [`ir::Package`] of models enters [`compiler::compile`], which runs the pass pipeline,
//! infers shapes, lowers every subgraph onto the available backends (planning tensor memory,
//! including zero-copy concatenation) and builds one executor per subgraph. Training graphs go
//! through [`train::TrainingCompiler`] instead, which converts operations into trainable
//! variants and attaches a loss before lowering.
//!
//! The core never performs arithmetic itself: kernels come from [`backend::Backend`]
//! implementations such as the reference CPU backend crate.

pub mod backend;
pub mod compiler;
mod env;
pub mod error;
pub mod exec;
pub mod ir;
pub mod tensor;
pub mod trace;
pub mod train;

pub use compiler::{compile, CompilerArtifact, CompilerOptions, ExecutorKind, GraphDumpLevel};
pub use error::{Error, Result};
pub use tensor::{HostTensor, TensorData};

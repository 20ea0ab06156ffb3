pub mod cpu;
pub mod kernels;
pub mod optim;

use std::sync::Arc;

use nnrt::backend::registry::register_backend;
use nnrt::backend::Backend;

pub use cpu::CpuBackend;
pub use optim::SgdOptimizer;

/// Registers the reference CPU backend with the global backend registry.
///
/// Registered as "cpu" (operands may alias concat windows) and "cpu-plain" (every operand
/// owns its buffer). Calling it more than once is harmless.
pub fn register_cpu_backend() {
    register_backend("cpu", || -> Arc<dyn Backend> { Arc::new(CpuBackend::new()) });
    register_backend("cpu-plain", || -> Arc<dyn Backend> {
        Arc::new(CpuBackend::without_subtensor())
    });
}

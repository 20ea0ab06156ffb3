//! Compile pipeline: passes, shape inference, lowering and executor construction.

mod lowering;
mod memory;
mod options;
pub mod pass;
mod shape_inference;
mod shape_validator;
mod subtensor;

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::exec::{ExecutorFactory, Executors};
use crate::ir::{Model, ModelIndex, Package, SubgraphIndex};
use crate::tensor::HostTensor;
use crate::trace::TracingContext;

pub use lowering::{BackendResolver, LoweredGraph, Transfer};
pub use memory::{LiveRange, MemoryPlanner, TensorEntry, TensorPlan};
pub use options::{CompilerOptions, ExecutorKind, GraphDumpLevel};
pub use pass::{Pass, PassResult, PassRunner};
pub use shape_inference::StaticShapeInferer;
pub use shape_validator::ShapeValidator;
pub use subtensor::{SubtensorAnalyzer, SubtensorPlan};

/// Output of a successful compile: executors plus the tracing context they report to.
pub struct CompilerArtifact {
    executors: Arc<Executors>,
    tracing: Arc<TracingContext>,
}

impl CompilerArtifact {
    pub fn new(executors: Arc<Executors>, tracing: Arc<TracingContext>) -> Self {
        Self { executors, tracing }
    }

    pub fn executors(&self) -> &Arc<Executors> {
        &self.executors
    }

    pub fn tracing(&self) -> &Arc<TracingContext> {
        &self.tracing
    }

    /// Runs the primary subgraph of the primary model.
    pub fn execute(&self, inputs: &[HostTensor]) -> Result<Vec<HostTensor>> {
        self.executors
            .execute(ModelIndex::PRIMARY, SubgraphIndex::PRIMARY, inputs)
    }
}

/// Inference compiler for a package of models.
pub struct Compiler {
    package: Package,
    options: CompilerOptions,
}

impl Compiler {
    /// `options` is required; `None` is reported as a configuration error.
    pub fn new(package: impl Into<Package>, options: Option<&CompilerOptions>) -> Result<Self> {
        let options = options
            .cloned()
            .ok_or_else(|| Error::configuration("empty compile options"))?;
        Ok(Self {
            package: package.into(),
            options,
        })
    }

    pub fn compile(self) -> Result<CompilerArtifact> {
        let Compiler { package, options } = self;
        options.check_profiler_conditions()?;
        options.log();
        if package.model_count() == 0 {
            return Err(Error::unsupported_model("package holds no models"));
        }

        let tracing_cx = Arc::new(TracingContext::new(
            options.profiling_mode,
            options.trace_filepath.clone(),
        ));
        let resolver = BackendResolver::from_options(&options)?;
        let factory = ExecutorFactory::new(&options, Arc::clone(&tracing_cx));
        let passes = PassRunner::standard();
        let mut executors = Executors::new().with_minmax(factory.minmax().cloned());

        for (model_index, mut model) in package.into_models() {
            prepare_model(&mut model, model_index, &passes, &tracing_cx)?;
            for subgraph in model.subgraph_indices() {
                let Some(graph) = model.take_subgraph(subgraph) else {
                    continue;
                };
                tracing_cx.register_subgraph(model_index, subgraph);
                let lowered = LoweredGraph::lower(model_index, subgraph, graph, &resolver)?;
                dump_lowered(&lowered, options.graph_dump_level);
                executors.emplace(model_index, subgraph, factory.create(lowered));
            }
        }

        tracing::info!(executors = executors.len(), executor = %options.executor, "compile finished");
        Ok(CompilerArtifact::new(Arc::new(executors), tracing_cx))
    }
}

/// Compiles `package` for inference.
pub fn compile(package: impl Into<Package>, options: &CompilerOptions) -> Result<CompilerArtifact> {
    Compiler::new(package, Some(options))?.compile()
}

/// Runs the standard passes on every subgraph, then infers and validates shapes.
pub(crate) fn prepare_model(
    model: &mut Model,
    model_index: ModelIndex,
    passes: &PassRunner,
    tracing_cx: &TracingContext,
) -> Result<()> {
    if model.subgraph_count() == 0 {
        return Err(Error::unsupported_model(format!("{model_index} has no subgraphs")));
    }
    model.verify_references()?;
    for (subgraph, graph) in model.subgraphs_mut() {
        passes.run(graph, model_index, subgraph, tracing_cx)?;
    }
    StaticShapeInferer::new(model).infer()?;
    ShapeValidator::new(model).validate()
}

pub(crate) fn dump_lowered(lowered: &LoweredGraph, level: GraphDumpLevel) {
    if let Some(text) = lowered.dump(level) {
        tracing::info!(
            model = %lowered.model(),
            subgraph = %lowered.subgraph(),
            "lowered graph\n{text}"
        );
    }
}

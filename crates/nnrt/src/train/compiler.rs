use std::sync::Arc;

use crate::compiler::{
    dump_lowered, prepare_model, BackendResolver, CompilerOptions, ExecutorKind, LoweredGraph,
    PassRunner, ShapeValidator, StaticShapeInferer,
};
use crate::error::{Error, Result};
use crate::ir::{Graph, Model, ModelIndex, OperandIndex, Package, SubgraphIndex};
use crate::tensor::HostTensor;
use crate::trace::TracingContext;

use super::converter::TrainableOperationConverter;
use super::executor::{OptimizerUpdate, StepOutput, TrainableExecutor};
use super::graph::TrainableGraph;
use super::info::TrainingInfo;
use super::loss_insertion::LossInsertionPass;

/// Compiled training graph together with the tracing context it reports to.
pub struct TrainingArtifact {
    executor: TrainableExecutor,
    tracing: Arc<TracingContext>,
}

impl TrainingArtifact {
    pub fn executor(&self) -> &TrainableExecutor {
        &self.executor
    }

    pub fn tracing(&self) -> &Arc<TracingContext> {
        &self.tracing
    }

    pub fn execute(&self, inputs: &[HostTensor], target: &HostTensor) -> Result<Vec<HostTensor>> {
        self.executor.execute(inputs, target)
    }

    pub fn train_step(
        &self,
        inputs: &[HostTensor],
        target: &HostTensor,
        optimizer: &dyn OptimizerUpdate,
    ) -> Result<f32> {
        self.executor.train_step(inputs, target, optimizer)
    }

    pub fn gradients(&self, inputs: &[HostTensor], target: &HostTensor) -> Result<StepOutput> {
        self.executor.gradients(inputs, target)
    }
}

/// Compiles a single-model, single-subgraph package for training.
pub struct TrainingCompiler {
    model: Model,
    options: Option<CompilerOptions>,
    info: Option<TrainingInfo>,
}

impl TrainingCompiler {
    /// Rejects packages with more than one model, models with more than one subgraph and
    /// graphs that are already trainable, then validates `info` when given.
    pub fn new(
        package: impl Into<Package>,
        options: Option<&CompilerOptions>,
        info: Option<&TrainingInfo>,
    ) -> Result<Self> {
        let package = package.into();
        if package.model_count() != 1 {
            return Err(Error::unsupported_model(format!(
                "training supports exactly one model, package has {}",
                package.model_count()
            )));
        }
        let model = package
            .into_models()
            .next()
            .map(|(_, model)| model)
            .ok_or_else(|| Error::unsupported_model("package holds no models"))?;
        if model.subgraph_count() != 1 {
            return Err(Error::unsupported_model(format!(
                "training supports exactly one subgraph, model has {}",
                model.subgraph_count()
            )));
        }
        if model.primary().is_some_and(|graph| graph.is_trainable()) {
            return Err(Error::unsupported_model(
                "graph is already trainable; a plain inference graph is required",
            ));
        }
        if let Some(info) = info {
            info.validate()?;
        }
        Ok(Self {
            model,
            options: options.cloned(),
            info: info.copied(),
        })
    }

    pub fn compile(self) -> Result<TrainingArtifact> {
        let TrainingCompiler {
            mut model,
            options,
            info,
        } = self;
        let options = options.ok_or_else(|| Error::configuration("empty compile options"))?;
        let info = info.ok_or_else(|| Error::configuration("empty training info"))?;
        options.check_profiler_conditions()?;
        options.log();
        if options.executor == ExecutorKind::Dataflow {
            tracing::warn!("training always runs on the linear trainable executor; ignoring Dataflow");
        }

        let tracing_cx = Arc::new(TracingContext::new(
            options.profiling_mode,
            options.trace_filepath.clone(),
        ));
        let model_index = ModelIndex::PRIMARY;
        let subgraph = SubgraphIndex::PRIMARY;
        prepare_model(&mut model, model_index, &PassRunner::standard(), &tracing_cx)?;

        let graph = model
            .primary()
            .ok_or_else(|| Error::unsupported_model("model has no primary subgraph"))?;
        let mut trainable = TrainableGraph::from_graph(graph)?;
        TrainableOperationConverter::new().convert(&mut trainable)?;
        let loss = LossInsertionPass::new(info.loss).run(&mut trainable)?;

        let mut trained = Model::single(trainable.into_graph());
        StaticShapeInferer::new(&mut trained).infer()?;
        ShapeValidator::new(&trained).validate()?;
        let graph = trained
            .take_subgraph(subgraph)
            .ok_or_else(|| Error::unsupported_model("model has no primary subgraph"))?;

        check_batch(&graph, loss.prediction, info.batch_size)?;

        tracing_cx.register_subgraph(model_index, subgraph);
        let resolver = BackendResolver::from_options(&options)?;
        let lowered = LoweredGraph::lower(model_index, subgraph, graph, &resolver)?;
        dump_lowered(&lowered, options.graph_dump_level);
        let executor = TrainableExecutor::new(lowered, Arc::clone(&tracing_cx), info, loss);
        tracing::info!(
            parameters = executor.parameter_operands().len(),
            loss = ?info.loss.kind,
            "training compile finished"
        );
        Ok(TrainingArtifact {
            executor,
            tracing: tracing_cx,
        })
    }
}

fn check_batch(graph: &Graph, prediction: OperandIndex, batch_size: usize) -> Result<()> {
    let batch = graph
        .operand(prediction)
        .shape()
        .static_dims()
        .and_then(|dims| dims.first().copied());
    match batch {
        Some(batch) if batch == batch_size => Ok(()),
        Some(batch) => Err(Error::configuration(format!(
            "training batch size {batch_size} does not match prediction batch {batch}"
        ))),
        None => Err(Error::graph_shape_mismatch("prediction shape is unresolved")),
    }
}

use std::sync::Arc;

use crate::compiler::{CompilerOptions, ExecutorKind, LoweredGraph};
use crate::trace::TracingContext;

use super::dataflow::DataflowExecutor;
use super::linear::LinearExecutor;
use super::minmax::MinMaxRecorder;
use super::Executor;

/// Builds the executor kind selected in the options.
pub struct ExecutorFactory<'a> {
    options: &'a CompilerOptions,
    trace: Arc<TracingContext>,
    minmax: Option<Arc<MinMaxRecorder>>,
}

impl<'a> ExecutorFactory<'a> {
    pub fn new(options: &'a CompilerOptions, trace: Arc<TracingContext>) -> Self {
        let minmax = options
            .minmax_record_path
            .as_ref()
            .map(|path| Arc::new(MinMaxRecorder::new(path.clone())));
        Self {
            options,
            trace,
            minmax,
        }
    }

    /// Recorder shared by every linear executor this factory builds.
    pub fn minmax(&self) -> Option<&Arc<MinMaxRecorder>> {
        self.minmax.as_ref()
    }

    pub fn create(&self, lowered: LoweredGraph) -> Box<dyn Executor> {
        tracing::debug!(
            model = %lowered.model(),
            subgraph = %lowered.subgraph(),
            executor = %self.options.executor,
            "creating executor"
        );
        match self.options.executor {
            ExecutorKind::Linear => Box::new(LinearExecutor::new(
                lowered,
                Arc::clone(&self.trace),
                self.minmax.clone(),
            )),
            ExecutorKind::Dataflow => {
                Box::new(DataflowExecutor::new(lowered, Arc::clone(&self.trace)))
            }
        }
    }
}

//! Per-artifact tracing context.
//!
//! A [`TracingContext`] is created by each compile call and owned by the resulting artifact.
//! It assigns session-unique ids to lowered subgraphs and collects pass statistics and, when
//! profiling is enabled, per-operation execution events. Nothing here is process-global.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::ir::{ModelIndex, OperationIndex, SubgraphIndex};

/// Statistics reported by one pass run over one subgraph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassEvent {
    pub model: ModelIndex,
    pub subgraph: SubgraphIndex,
    pub pass: String,
    pub changed: bool,
    pub erased_operations: usize,
    pub erased_operands: usize,
    pub duration_us: u64,
}

/// One kernel invocation observed by an executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationEvent {
    pub model: ModelIndex,
    pub subgraph: SubgraphIndex,
    pub operation: OperationIndex,
    pub kind: String,
    pub backend: String,
    pub duration_us: u64,
}

#[derive(Debug, Default, Serialize)]
struct TraceLog {
    subgraphs: BTreeMap<String, u32>,
    passes: Vec<PassEvent>,
    operations: Vec<OperationEvent>,
}

#[derive(Debug)]
pub struct TracingContext {
    profiling: bool,
    output: Option<PathBuf>,
    log: Mutex<TraceLog>,
}

impl TracingContext {
    pub fn new(profiling: bool, output: Option<PathBuf>) -> Self {
        Self {
            profiling,
            output,
            log: Mutex::new(TraceLog::default()),
        }
    }

    /// Context that records pass events only.
    pub fn disabled() -> Self {
        Self::new(false, None)
    }

    pub fn profiling_enabled(&self) -> bool {
        self.profiling
    }

    /// Returns the session id for `(model, subgraph)`, assigning the next free one on first use.
    pub fn register_subgraph(&self, model: ModelIndex, subgraph: SubgraphIndex) -> u32 {
        let mut log = self.lock();
        let next = log.subgraphs.len() as u32;
        *log
            .subgraphs
            .entry(format!("{model}/{subgraph}"))
            .or_insert(next)
    }

    pub fn subgraph_id(&self, model: ModelIndex, subgraph: SubgraphIndex) -> Option<u32> {
        self.lock()
            .subgraphs
            .get(&format!("{model}/{subgraph}"))
            .copied()
    }

    pub fn record_pass(&self, event: PassEvent) {
        self.lock().passes.push(event);
    }

    /// Stores an operation event; ignored unless profiling is enabled.
    pub fn record_operation(
        &self,
        model: ModelIndex,
        subgraph: SubgraphIndex,
        operation: OperationIndex,
        kind: &str,
        backend: &str,
        duration: Duration,
    ) {
        if !self.profiling {
            return;
        }
        self.lock().operations.push(OperationEvent {
            model,
            subgraph,
            operation,
            kind: kind.to_string(),
            backend: backend.to_string(),
            duration_us: micros(duration),
        });
    }

    pub fn pass_events(&self) -> Vec<PassEvent> {
        self.lock().passes.clone()
    }

    pub fn operation_events(&self) -> Vec<OperationEvent> {
        self.lock().operations.clone()
    }

    pub fn to_json(&self) -> Result<serde_json::Value> {
        serde_json::to_value(&*self.lock())
            .map_err(|err| Error::Execution(format!("failed to serialize trace: {err}")))
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, &*self.lock())
            .map_err(|err| Error::Execution(format!("failed to write trace: {err}")))
    }

    /// Writes collected events to the configured trace file, if any.
    pub fn flush(&self) -> Result<()> {
        match &self.output {
            Some(path) => self.write_json(path),
            None => Ok(()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TraceLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for TracingContext {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            tracing::warn!(error = %err, "failed to flush trace events");
        }
    }
}

pub(crate) fn micros(duration: Duration) -> u64 {
    duration.as_micros().min(u128::from(u64::MAX)) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subgraph_ids_are_stable_and_sequential() {
        let cx = TracingContext::disabled();
        let a = cx.register_subgraph(ModelIndex::PRIMARY, SubgraphIndex::new(0));
        let b = cx.register_subgraph(ModelIndex::PRIMARY, SubgraphIndex::new(1));
        assert_eq!((a, b), (0, 1));
        assert_eq!(
            cx.register_subgraph(ModelIndex::PRIMARY, SubgraphIndex::new(0)),
            0
        );
        assert_eq!(
            cx.subgraph_id(ModelIndex::PRIMARY, SubgraphIndex::new(1)),
            Some(1)
        );
    }

    #[test]
    fn operation_events_require_profiling() {
        let cx = TracingContext::disabled();
        cx.record_operation(
            ModelIndex::PRIMARY,
            SubgraphIndex::PRIMARY,
            OperationIndex::new(0),
            "Permute",
            "cpu",
            Duration::from_micros(3),
        );
        assert!(cx.operation_events().is_empty());
    }
}

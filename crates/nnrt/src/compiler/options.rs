use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How a lowered subgraph is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ExecutorKind {
    /// Strict `indexed_ranks` order on the calling thread.
    #[default]
    Linear,
    /// Operations run once their inputs are ready, one worker per backend.
    Dataflow,
}

impl FromStr for ExecutorKind {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim() {
            "Linear" | "linear" => Ok(ExecutorKind::Linear),
            "Dataflow" | "dataflow" => Ok(ExecutorKind::Dataflow),
            other => Err(Error::configuration(format!("unknown executor kind '{other}'"))),
        }
    }
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutorKind::Linear => f.write_str("Linear"),
            ExecutorKind::Dataflow => f.write_str("Dataflow"),
        }
    }
}

/// Verbosity of the textual graph dump emitted after lowering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum GraphDumpLevel {
    #[default]
    Off,
    /// Operation list with backend assignment.
    Basic,
    /// Full graph including operand shapes and buffer aliasing.
    Detailed,
}

impl FromStr for GraphDumpLevel {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "0" | "off" => Ok(GraphDumpLevel::Off),
            "1" | "basic" => Ok(GraphDumpLevel::Basic),
            "2" | "detailed" => Ok(GraphDumpLevel::Detailed),
            other => Err(Error::configuration(format!(
                "unknown graph dump level '{other}'"
            ))),
        }
    }
}

/// Compiler configuration. The compiler only reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerOptions {
    pub executor: ExecutorKind,
    pub heterogeneous_scheduler: bool,
    pub profiling_mode: bool,
    /// Where the linear executor writes per-operation min/max values.
    pub minmax_record_path: Option<PathBuf>,
    pub graph_dump_level: GraphDumpLevel,
    /// Backend names in order of preference.
    pub backend_list: Vec<String>,
    /// Operation kind name (for example `"Concat"`) to backend name.
    pub manual_scheduler: HashMap<String, String>,
    /// JSON file receiving trace events when the artifact is dropped.
    pub trace_filepath: Option<PathBuf>,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            executor: ExecutorKind::Linear,
            heterogeneous_scheduler: false,
            profiling_mode: false,
            minmax_record_path: None,
            graph_dump_level: GraphDumpLevel::Off,
            backend_list: vec!["cpu".to_string()],
            manual_scheduler: HashMap::new(),
            trace_filepath: None,
        }
    }
}

impl CompilerOptions {
    pub fn with_executor(mut self, executor: ExecutorKind) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_backends<I, S>(mut self, backends: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.backend_list = backends.into_iter().map(Into::into).collect();
        self
    }

    /// Rejects option combinations the executors cannot honor.
    pub fn check_profiler_conditions(&self) -> Result<()> {
        if self.profiling_mode {
            if !self.heterogeneous_scheduler {
                return Err(Error::configuration(
                    "heterogeneous scheduler must be enabled during profiling",
                ));
            }
            if self.executor != ExecutorKind::Dataflow {
                return Err(Error::configuration(
                    "profiling mode works only with the Dataflow executor",
                ));
            }
        }
        if self.minmax_record_path.is_some() && self.executor != ExecutorKind::Linear {
            return Err(Error::configuration(
                "min/max recording works only with the Linear executor",
            ));
        }
        if self.backend_list.is_empty() {
            return Err(Error::configuration("backend list is empty"));
        }
        Ok(())
    }

    pub(crate) fn log(&self) {
        tracing::debug!(
            executor = %self.executor,
            heterogeneous_scheduler = self.heterogeneous_scheduler,
            profiling_mode = self.profiling_mode,
            minmax = ?self.minmax_record_path,
            dump = ?self.graph_dump_level,
            backends = ?self.backend_list,
            "compiler options"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_pass_checks() {
        let options = CompilerOptions::default();
        assert_eq!(options.executor, ExecutorKind::Linear);
        assert_eq!(options.backend_list, vec!["cpu".to_string()]);
        options.check_profiler_conditions().unwrap();
    }

    #[test]
    fn profiling_needs_dataflow_and_heterogeneous_scheduler() {
        let mut options = CompilerOptions {
            profiling_mode: true,
            ..CompilerOptions::default()
        };
        assert!(matches!(
            options.check_profiler_conditions(),
            Err(Error::Configuration(_))
        ));
        options.heterogeneous_scheduler = true;
        assert!(options.check_profiler_conditions().is_err());
        options.executor = ExecutorKind::Dataflow;
        options.check_profiler_conditions().unwrap();
    }

    #[test]
    fn executor_kind_parses_known_names() {
        assert_eq!("Dataflow".parse::<ExecutorKind>().unwrap(), ExecutorKind::Dataflow);
        assert_eq!(" linear ".parse::<ExecutorKind>().unwrap(), ExecutorKind::Linear);
        assert!("Parallel".parse::<ExecutorKind>().is_err());
        assert_eq!("2".parse::<GraphDumpLevel>().unwrap(), GraphDumpLevel::Detailed);
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let options: CompilerOptions =
            serde_json::from_str(r#"{"executor":"Dataflow","backend_list":["cpu","builtin"]}"#)
                .unwrap();
        assert_eq!(options.executor, ExecutorKind::Dataflow);
        assert!(!options.profiling_mode);
        assert_eq!(options.backend_list.len(), 2);
    }
}

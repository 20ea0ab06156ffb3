use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use crate::error::{Error, Result};
use crate::ir::{ModelIndex, OperationIndex, SubgraphIndex};
use crate::tensor::HostTensor;

/// Min/max of every float output of one operation in one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MinMaxRecord {
    pub run: usize,
    pub model: ModelIndex,
    pub subgraph: SubgraphIndex,
    pub operation: OperationIndex,
    pub kind: String,
    /// `[min, max]` per output; `None` for non-float outputs.
    pub outputs: Vec<Option<[f32; 2]>>,
}

/// Streams records to a JSON Lines file, one line per record.
///
/// A run spans one top-level execution including every child subgraph it calls. Records are
/// held only until their run ends and are then appended to the file.
#[derive(Debug)]
pub struct MinMaxRecorder {
    path: PathBuf,
    state: Mutex<RecorderState>,
}

#[derive(Debug, Default)]
struct RecorderState {
    runs: usize,
    pending: Vec<MinMaxRecord>,
    written: usize,
    truncated: bool,
}

impl MinMaxRecorder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(RecorderState::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of runs started so far.
    pub fn runs(&self) -> usize {
        self.lock().runs
    }

    /// Number of records written to the file so far.
    pub fn written(&self) -> usize {
        self.lock().written
    }

    /// Starts a run and returns its sequence number.
    pub(crate) fn begin_run(&self) -> usize {
        let mut state = self.lock();
        let run = state.runs;
        state.runs += 1;
        run
    }

    pub(crate) fn record(
        &self,
        run: usize,
        model: ModelIndex,
        subgraph: SubgraphIndex,
        operation: OperationIndex,
        kind: &str,
        outputs: &[HostTensor],
    ) {
        let outputs = outputs
            .iter()
            .map(|tensor| tensor.min_max().map(|(lo, hi)| [lo, hi]))
            .collect();
        self.lock().pending.push(MinMaxRecord {
            run,
            model,
            subgraph,
            operation,
            kind: kind.to_string(),
            outputs,
        });
    }

    /// Appends the records of `run` to the file and forgets them.
    pub(crate) fn end_run(&self, run: usize) -> Result<()> {
        let mut state = self.lock();
        let (finished, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut state.pending)
            .into_iter()
            .partition(|record| record.run == run);
        state.pending = pending;

        let file = if state.truncated {
            OpenOptions::new().append(true).open(&self.path)?
        } else {
            File::create(&self.path)?
        };
        state.truncated = true;
        let mut writer = BufWriter::new(file);
        for record in &finished {
            serde_json::to_writer(&mut writer, record).map_err(|err| {
                Error::Execution(format!("failed to write min/max records: {err}"))
            })?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        state.written += finished.len();
        tracing::trace!(run, records = finished.len(), "min/max run flushed");
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, RecorderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interleaved_runs_flush_only_their_own_records() {
        let path = std::env::temp_dir()
            .join(format!("nnrt-minmax-unit-{}.jsonl", std::process::id()));
        let recorder = MinMaxRecorder::new(&path);
        let first = recorder.begin_run();
        let second = recorder.begin_run();
        let value = HostTensor::from_f32(&[2], vec![-1.0, 3.0]).unwrap();
        let record = |run| {
            recorder.record(
                run,
                ModelIndex::PRIMARY,
                SubgraphIndex::PRIMARY,
                OperationIndex::new(0),
                "Relu",
                std::slice::from_ref(&value),
            )
        };
        record(first);
        record(second);

        recorder.end_run(second).unwrap();
        recorder.end_run(first).unwrap();
        let lines: Vec<serde_json::Value> = std::fs::read_to_string(&path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["run"], 1);
        assert_eq!(lines[1]["run"], 0);
        assert_eq!(lines[1]["outputs"][0][1], 3.0);
        assert_eq!(recorder.written(), 2);
        std::fs::remove_file(&path).unwrap();
    }
}

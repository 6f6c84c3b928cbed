use brisk_hash::HashCode;

use crate::error::ExecutionError;
use crate::history::{ExecutionHistoryStore, ExecutionRecord};
use crate::input::{CurrentInputs, InputFingerprinter, InputProperty};
use crate::up_to_date::{self, UpToDateVerdict};

/// The inputs of a unit of work as seen before it runs.
#[derive(Debug)]
pub struct ExecutionState {
    identity: String,
    inputs: CurrentInputs,
    previous: Option<ExecutionRecord>,
    verdict: UpToDateVerdict,
}

impl ExecutionState {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn inputs(&self) -> &CurrentInputs {
        &self.inputs
    }

    pub fn previous(&self) -> Option<&ExecutionRecord> {
        self.previous.as_ref()
    }

    pub fn verdict(&self) -> &UpToDateVerdict {
        &self.verdict
    }

    pub fn cache_key(&self) -> Option<HashCode> {
        self.inputs.cache_key(&self.identity)
    }
}

/// Decides whether units of work are up to date and remembers how they last ran.
#[derive(Clone)]
pub struct IncrementalExecution {
    fingerprinter: InputFingerprinter,
    history: ExecutionHistoryStore,
}

impl IncrementalExecution {
    pub fn new(fingerprinter: InputFingerprinter, history: ExecutionHistoryStore) -> Self {
        Self {
            fingerprinter,
            history,
        }
    }

    pub fn fingerprinter(&self) -> &InputFingerprinter {
        &self.fingerprinter
    }

    pub fn history(&self) -> &ExecutionHistoryStore {
        &self.history
    }

    /// Fingerprints the inputs of `identity` and compares them with its last execution.
    pub fn check(
        &self,
        identity: &str,
        properties: &[InputProperty],
    ) -> Result<ExecutionState, ExecutionError> {
        let inputs = self.fingerprinter.fingerprint_all(properties)?;
        let previous = self.history.load(identity)?;
        let verdict = up_to_date::check(previous.as_ref(), &inputs);
        tracing::debug!(
            target = "brisk.execution",
            identity,
            up_to_date = verdict.is_up_to_date(),
            incremental = verdict.is_incremental(),
            "checked unit of work"
        );
        Ok(ExecutionState {
            identity: identity.to_string(),
            inputs,
            previous,
            verdict,
        })
    }

    /// Records the outcome of running the unit of work checked as `state`.
    pub fn record(
        &self,
        state: &ExecutionState,
        successful: bool,
        build_invocation_id: Option<&str>,
    ) -> Result<ExecutionRecord, ExecutionError> {
        let record = ExecutionRecord {
            identity: state.identity.clone(),
            successful,
            inputs: state.inputs.to_persisted(),
            cache_key: state.cache_key(),
            recorded_at: brisk_core::now_millis(),
            build_invocation_id: build_invocation_id.map(str::to_string),
        };
        self.history.store(record.clone())?;
        Ok(record)
    }
}

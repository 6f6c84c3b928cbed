//! Up-to-date checks for units of work.
//!
//! A unit of work declares [`InputProperty`]s. [`IncrementalExecution::check`] fingerprints
//! them, loads the previous [`ExecutionRecord`] from the execution history, and produces an
//! [`UpToDateVerdict`] whose per-property comparisons double as the change set for incremental
//! reprocessing. [`IncrementalExecution::record`] stores the fingerprints once the work has run.

mod error;
mod execution;
mod history;
mod input;
mod up_to_date;

pub use error::ExecutionError;
pub use execution::{ExecutionState, IncrementalExecution};
pub use history::{ExecutionHistoryStore, ExecutionRecord, PersistedFingerprint};
pub use input::{CurrentInputs, InputFingerprinter, InputProperty};
pub use up_to_date::{check, PropertyOutcome, PropertyVerdict, UpToDateVerdict, MAX_CHANGE_MESSAGES};

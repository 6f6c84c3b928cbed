use std::collections::BTreeMap;

use brisk_cache::{IndexedCache, PersistentCache};
use brisk_fingerprint::CollectionFingerprint;
use brisk_hash::HashCode;
use serde::{Deserialize, Serialize};

use crate::error::ExecutionError;

/// A recorded input fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PersistedFingerprint {
    Fingerprint(CollectionFingerprint),
    /// Fingerprinting failed; never matches any current fingerprint.
    Failed { reason: String },
}

impl PersistedFingerprint {
    pub fn from_result(result: &Result<CollectionFingerprint, ExecutionError>) -> Self {
        match result {
            Ok(fingerprint) => PersistedFingerprint::Fingerprint(fingerprint.clone()),
            Err(err) => PersistedFingerprint::Failed {
                reason: err.to_string(),
            },
        }
    }

    pub fn fingerprint(&self) -> Option<&CollectionFingerprint> {
        match self {
            PersistedFingerprint::Fingerprint(fingerprint) => Some(fingerprint),
            PersistedFingerprint::Failed { .. } => None,
        }
    }
}

/// What is remembered about the last execution of a unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub identity: String,
    pub successful: bool,
    pub inputs: BTreeMap<String, PersistedFingerprint>,
    /// Build cache key of the inputs, when all of them could be fingerprinted.
    pub cache_key: Option<HashCode>,
    /// Milliseconds since the unix epoch.
    pub recorded_at: u64,
    pub build_invocation_id: Option<String>,
}

/// Previous executions keyed by unit-of-work identity.
#[derive(Clone)]
pub struct ExecutionHistoryStore {
    records: IndexedCache<String, ExecutionRecord>,
}

impl ExecutionHistoryStore {
    pub const CACHE_NAME: &'static str = "execution-history";

    pub fn new(cache: &PersistentCache) -> Result<Self, ExecutionError> {
        Ok(Self {
            records: cache.indexed_cache(Self::CACHE_NAME)?,
        })
    }

    pub fn load(&self, identity: &str) -> Result<Option<ExecutionRecord>, ExecutionError> {
        let record = self.records.get(&identity.to_string())?;
        Ok(record.filter(|record| {
            let matches = record.identity == identity;
            if !matches {
                tracing::debug!(
                    target = "brisk.execution",
                    identity,
                    recorded = %record.identity,
                    "ignoring execution record of another unit of work"
                );
            }
            matches
        }))
    }

    pub fn store(&self, record: ExecutionRecord) -> Result<(), ExecutionError> {
        let identity = record.identity.clone();
        self.records.put(&identity, record)?;
        Ok(())
    }

    pub fn remove(&self, identity: &str) -> Result<(), ExecutionError> {
        self.records.remove(&identity.to_string())?;
        Ok(())
    }
}

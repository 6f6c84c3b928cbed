use std::path::PathBuf;

use brisk_cache::CacheError;
use brisk_fingerprint::FingerprintingError;
use brisk_vfs::VfsError;

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Fingerprinting(#[from] FingerprintingError),

    #[error("failed to snapshot input property '{property}' at {}: {source}", .root.display())]
    Snapshot {
        property: String,
        root: PathBuf,
        #[source]
        source: VfsError,
    },

    #[error("input property '{0}' is declared more than once")]
    DuplicateProperty(String),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl ExecutionError {
    /// The input property the failure belongs to, if any.
    pub fn property(&self) -> Option<&str> {
        match self {
            ExecutionError::Fingerprinting(err) => Some(&err.property),
            ExecutionError::Snapshot { property, .. } => Some(property),
            ExecutionError::DuplicateProperty(property) => Some(property),
            ExecutionError::Cache(_) => None,
        }
    }
}

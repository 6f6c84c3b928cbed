use std::io;
use std::path::{Path, PathBuf};

use brisk_archive::ArchiveError;

/// Failure to compute the normalized hash of one file.
#[derive(Debug, thiserror::Error)]
pub enum ResourceHashError {
    #[error("could not read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error("malformed class file {}: {source}", location(.path, .entry))]
    ClassFile {
        path: PathBuf,
        /// Entry name when the class was read from an archive.
        entry: Option<String>,
        #[source]
        source: brisk_classfile::Error,
    },
}

/// A fingerprint could not be computed for an input property.
#[derive(Debug, thiserror::Error)]
#[error("failed to fingerprint input property '{property}' at {}: {source}", .path.display())]
pub struct FingerprintingError {
    pub property: String,
    pub path: PathBuf,
    #[source]
    pub source: ResourceHashError,
}

/// Two fingerprints produced under different strategies were compared.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot compare fingerprints of strategy '{previous}' with fingerprints of strategy '{current}'")]
pub struct IncompatibleFingerprints {
    pub previous: String,
    pub current: String,
}

fn location(path: &Path, entry: &Option<String>) -> String {
    match entry {
        Some(entry) => format!("{}!{entry}", path.display()),
        None => path.display().to_string(),
    }
}

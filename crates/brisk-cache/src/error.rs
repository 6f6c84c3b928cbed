use std::path::PathBuf;

use crate::lock::LockMode;

pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors produced by cache locking and persistence.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("failed to generate a random lock identifier: {0}")]
    Random(#[from] getrandom::Error),

    #[error(
        "timeout waiting to lock {display_name}. It is currently in use by {}.\nOwner PID: {}\nOur PID: {our_pid}\nOwner operation: {}\nOur operation: {our_operation}\nLock file: {}",
        holder(.held_by_this_process),
        owner_field(.owner_pid),
        owner_field(.owner_operation),
        .lock_file.display()
    )]
    LockTimeout {
        display_name: String,
        lock_file: PathBuf,
        held_by_this_process: bool,
        owner_pid: Option<u32>,
        owner_operation: Option<String>,
        our_pid: u32,
        our_operation: String,
    },

    /// A programming error in lock or operation bookkeeping. Never retried.
    #[error("lock protocol violation: {0}")]
    LockProtocolViolation(String),

    #[error("operation {operation} is not supported by the {format} lock state format")]
    UnsupportedLockStateOperation {
        operation: &'static str,
        format: &'static str,
    },

    #[error("unexpected lock state format in {}: expected version {expected}, found {found}", .lock_file.display())]
    UnexpectedLockStateFormat {
        lock_file: PathBuf,
        expected: u8,
        found: u8,
    },

    #[error("lock state in {} is truncated", .lock_file.display())]
    TruncatedLockState { lock_file: PathBuf },

    #[error("{mode} lock mode is not supported for {display_name}")]
    UnsupportedLockMode {
        display_name: String,
        mode: LockMode,
    },

    #[error("an exclusive lock is required to write {display_name}")]
    InsufficientLockMode { display_name: String },

    #[error("the file '{}' was not unlocked cleanly", .target.display())]
    FileIntegrityViolation { target: PathBuf },

    #[error("indexed cache '{name}' is already open with different key or value types")]
    IncompatibleIndexedCache { name: String },

    #[error("invalid indexed cache name '{name}'")]
    InvalidCacheName { name: String },

    #[error("corrupt build cache entry: {0}")]
    CorruptEntry(String),
}

fn holder(held_by_this_process: &bool) -> &'static str {
    if *held_by_this_process {
        "this process"
    } else {
        "another process"
    }
}

fn owner_field<T: std::fmt::Display>(value: &Option<T>) -> String {
    match value {
        Some(value) => value.to_string(),
        None => "unknown".to_string(),
    }
}

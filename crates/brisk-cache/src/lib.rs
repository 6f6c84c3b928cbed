//! Cross-process persistent caches.
//!
//! A [`PersistentCache`] is a directory guarded by one OS file lock managed by a
//! [`FileLockManager`]. The lock file carries a versioned [`LockState`] whose sequence number
//! tells later openers whether the last writer finished, and tells long-lived processes whether
//! somebody else wrote since they last looked.
//!
//! ## On-disk layout
//!
//! Under `<cache_dir>/`:
//! - `<dir name>.lock`: the lock file. One version byte, then the [`LockStateFormat`] payload.
//! - `<dir name>.lock.owner`: `key=value` lines naming the exclusive holder (contention port,
//!   lock id, pid, operation).
//! - `<indexed cache name>/<hash of key>.bin`: [`IndexedCache`] entries persisted via `serde` +
//!   `bincode`, gated by [`INDEXED_CACHE_SCHEMA_VERSION`] and the Brisk version.
//! - `build-cache/`: [`BuildCache`] entries, each a tar archive of origin metadata and output.

mod build_cache;
mod contention;
mod error;
mod lock;
mod lock_state;
mod operations;
mod persistent;
mod util;

pub use build_cache::{
    pack_entry, unpack_entry, BuildCache, BuildCacheEntry, OriginMetadata, METADATA_ENTRY,
    OUTPUT_ENTRY,
};
pub use contention::{ContendedAction, ContentionHandler};
pub use error::{CacheError, Result};
pub use lock::{
    FileLock, FileLockManager, LockManagerOptions, LockMode, LockOptions, LockOwner,
    DEFAULT_LOCK_TIMEOUT, DEFAULT_PING_DELAY,
};
pub use lock_state::{LockState, LockStateFormat};
pub use operations::OperationStack;
pub use persistent::{CacheOptions, IndexedCache, PersistentCache, INDEXED_CACHE_SCHEMA_VERSION};
pub use util::atomic_write;

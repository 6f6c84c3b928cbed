//! Virtual file system for Brisk.
//!
//! The VFS is an in-memory, path-indexed mirror of filesystem state:
//! - [`Vfs`] caches [`Snapshot`] trees (and metadata-only markers) and enforces invalidation.
//! - [`FileSystemAccess`] answers snapshot requests from the VFS, walking the disk on a miss and
//!   recording what it saw.
//!
//! A snapshot computed while an overlapping path is invalidated is never recorded; the caller
//! still gets the result, and the next lookup misses.

mod access;
mod error;
mod vfs;

pub use access::FileSystemAccess;
pub use brisk_snapshot::Snapshot;
pub use error::VfsError;
pub use vfs::{Vfs, VfsEntry};

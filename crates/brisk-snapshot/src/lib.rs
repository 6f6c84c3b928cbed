//! Immutable snapshots of filesystem locations.
//!
//! A [`Snapshot`] is the recorded observation of a path at one point in time: a regular file
//! (length, modification time, content hash), a directory (name-ordered children), or a missing
//! path. Snapshots are produced by [`DirectorySnapshotter`] and never mutated; a later walk
//! produces a new tree that supersedes the old one.

mod error;
mod excludes;
mod filter;
mod snapshotter;
mod tree;

pub use error::SnapshotError;
pub use excludes::{DefaultExcludes, DEFAULT_EXCLUDES};
pub use filter::SnapshottingFilter;
pub use snapshotter::{DirectorySnapshotter, SnapshotOutcome};
pub use tree::{
    AccessType, DirectorySnapshot, FileMetadata, MissingSnapshot, RegularFileSnapshot, Snapshot,
    directory_signature, missing_file_signature,
};

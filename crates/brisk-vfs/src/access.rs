use std::path::Path;
use std::sync::Arc;

use brisk_snapshot::{DirectorySnapshotter, Snapshot, SnapshottingFilter};

use crate::{Vfs, VfsError};

/// Snapshot access backed by a shared [`Vfs`].
#[derive(Debug, Clone)]
pub struct FileSystemAccess {
    vfs: Arc<Vfs>,
    snapshotter: DirectorySnapshotter,
}

impl FileSystemAccess {
    pub fn new(vfs: Arc<Vfs>, snapshotter: DirectorySnapshotter) -> Self {
        Self { vfs, snapshotter }
    }

    pub fn vfs(&self) -> &Arc<Vfs> {
        &self.vfs
    }

    /// Returns the snapshot of `root` with `filter` applied.
    ///
    /// Cached state is reused when present. Otherwise the disk is walked and the unfiltered parts
    /// of the walk are recorded.
    pub fn read(&self, root: &Path, filter: &SnapshottingFilter) -> Result<Snapshot, VfsError> {
        if let Some(cached) = self.vfs.find_snapshot(root) {
            tracing::trace!(target = "brisk.vfs", path = %root.display(), "snapshot cache hit");
            return Ok(filter.apply(&cached).0);
        }
        let outcome = self
            .vfs
            .store_outcome(root, || self.snapshotter.snapshot(root, filter))?;
        Ok(outcome.snapshot)
    }

    /// Runs `action`, which modifies `paths` on disk, keeping the VFS consistent around it.
    pub fn write<T>(&self, paths: &[&Path], action: impl FnOnce() -> T) -> T {
        self.vfs.invalidate(paths.iter().copied());
        let result = action();
        self.vfs.invalidate(paths.iter().copied());
        result
    }

    pub fn invalidate_all(&self) {
        self.vfs.invalidate_all();
    }

    pub fn move_atomically(&self, from: &Path, to: &Path) -> Result<(), VfsError> {
        self.vfs.move_atomically(from, to)
    }
}

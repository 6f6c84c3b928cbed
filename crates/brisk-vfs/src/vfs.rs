use std::collections::BTreeMap;
use std::fs;
use std::ops::Bound;
use std::path::{Path, PathBuf};

use brisk_core::FileType;
use brisk_snapshot::{Snapshot, SnapshotOutcome};
use parking_lot::RwLock;

use crate::VfsError;

/// What the VFS knows about one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VfsEntry {
    Snapshot(Snapshot),
    /// Only the type of the path is known.
    Metadata(FileType),
}

#[derive(Debug, Default)]
struct VfsState {
    entries: BTreeMap<PathBuf, VfsEntry>,
    /// Bumped on every invalidation.
    version: u64,
    /// Invalidated paths and the version at which they were invalidated. Only retained while
    /// stores are in flight.
    invalidated: BTreeMap<PathBuf, u64>,
    invalidated_all_at: u64,
    stores_in_flight: usize,
}

impl VfsState {
    fn find_entry(&self, path: &Path) -> Option<(&Path, &VfsEntry)> {
        path.ancestors()
            .find_map(|ancestor| self.entries.get_key_value(ancestor))
            .map(|(key, entry)| (key.as_path(), entry))
    }

    fn find_snapshot(&self, path: &Path) -> Option<Snapshot> {
        match self.find_entry(path)? {
            (_, VfsEntry::Snapshot(snapshot)) => snapshot.find(path),
            (_, VfsEntry::Metadata(_)) => None,
        }
    }

    fn find_metadata(&self, path: &Path) -> Option<FileType> {
        match self.find_entry(path)? {
            (_, VfsEntry::Snapshot(snapshot)) => snapshot.find(path).map(|s| s.file_type()),
            (key, VfsEntry::Metadata(file_type)) if key == path => Some(*file_type),
            _ => None,
        }
    }

    fn descendant_keys(&self, path: &Path) -> Vec<PathBuf> {
        self.entries
            .range::<Path, _>((Bound::Excluded(path), Bound::Unbounded))
            .map(|(key, _)| key)
            .take_while(|key| key.starts_with(path))
            .cloned()
            .collect()
    }

    /// Removes `path`, everything below it, and every ancestor entry. Children of removed
    /// ancestor directories that are not on the way to `path` are kept as standalone entries.
    fn remove_overlapping(&mut self, path: &Path) {
        self.entries.remove(path);
        for key in self.descendant_keys(path) {
            self.entries.remove(&key);
        }
        let ancestors: Vec<PathBuf> = path
            .ancestors()
            .skip(1)
            .filter(|ancestor| self.entries.contains_key(*ancestor))
            .map(Path::to_path_buf)
            .collect();
        for ancestor in ancestors {
            if let Some(VfsEntry::Snapshot(Snapshot::Directory(dir))) =
                self.entries.remove(&ancestor)
            {
                self.keep_siblings(dir.children(), path);
            }
        }
    }

    fn keep_siblings(&mut self, children: &[Snapshot], path: &Path) {
        for child in children {
            let child_path = child.absolute_path();
            if child_path == path {
                continue;
            }
            if path.starts_with(child_path) {
                if let Snapshot::Directory(dir) = child {
                    self.keep_siblings(dir.children(), path);
                }
                continue;
            }
            self.entries
                .entry(child_path.to_path_buf())
                .or_insert_with(|| VfsEntry::Snapshot(child.clone()));
        }
    }

    fn invalidate(&mut self, path: &Path) {
        self.version += 1;
        if self.stores_in_flight > 0 {
            self.invalidated.insert(path.to_path_buf(), self.version);
        }
        self.remove_overlapping(path);
    }

    fn invalidate_all(&mut self) {
        self.version += 1;
        self.invalidated_all_at = self.version;
        self.entries.clear();
    }

    fn invalidated_since(&self, path: &Path, version: u64) -> bool {
        if self.invalidated_all_at > version {
            return true;
        }
        self.invalidated.iter().any(|(invalidated, at)| {
            *at > version && (invalidated.starts_with(path) || path.starts_with(invalidated))
        })
    }

    fn record(&mut self, snapshot: Snapshot) {
        let path = snapshot.absolute_path().to_path_buf();
        self.remove_overlapping(&path);
        self.entries.insert(path, VfsEntry::Snapshot(snapshot));
    }
}

/// In-memory cache of filesystem snapshots.
///
/// All mutation goes through [`Vfs::store`], [`Vfs::invalidate`], [`Vfs::invalidate_all`], and
/// [`Vfs::move_atomically`]. Lookups take a shared lock and never block on a running store.
#[derive(Debug, Default)]
pub struct Vfs {
    state: RwLock<VfsState>,
}

impl Vfs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the snapshot for `path` if it, or an ancestor directory, is cached.
    ///
    /// A path below a cached directory that is not listed in it is reported as missing.
    pub fn find_snapshot(&self, path: &Path) -> Option<Snapshot> {
        self.state.read().find_snapshot(path)
    }

    /// Returns the file type of `path` from either a snapshot or a metadata-only entry.
    pub fn find_metadata(&self, path: &Path) -> Option<FileType> {
        self.state.read().find_metadata(path)
    }

    /// Records only the type of `path`, replacing anything cached for it.
    pub fn store_metadata(&self, path: &Path, file_type: FileType) {
        let mut state = self.state.write();
        state.remove_overlapping(path);
        state
            .entries
            .insert(path.to_path_buf(), VfsEntry::Metadata(file_type));
    }

    /// Computes a snapshot with `supplier` and records it.
    ///
    /// If `path`, one of its ancestors, or one of its descendants is invalidated while the
    /// supplier runs, the result is returned but not recorded. Errors are returned as is and
    /// nothing is recorded.
    pub fn store<E>(
        &self,
        path: &Path,
        supplier: impl FnOnce() -> Result<Snapshot, E>,
    ) -> Result<Snapshot, E> {
        self.store_inner(path, supplier, |snapshot| vec![snapshot.clone()])
    }

    /// Like [`Vfs::store`], for a walk that may have been filtered: only the unfiltered parts of
    /// the outcome are recorded.
    pub fn store_outcome<E>(
        &self,
        path: &Path,
        supplier: impl FnOnce() -> Result<SnapshotOutcome, E>,
    ) -> Result<SnapshotOutcome, E> {
        self.store_inner(path, supplier, |outcome| outcome.unfiltered.clone())
    }

    fn store_inner<T, E>(
        &self,
        path: &Path,
        supplier: impl FnOnce() -> Result<T, E>,
        recorded: impl FnOnce(&T) -> Vec<Snapshot>,
    ) -> Result<T, E> {
        let started_at = {
            let mut state = self.state.write();
            state.stores_in_flight += 1;
            state.version
        };
        let guard = InFlight { vfs: self };

        let result = supplier();

        let mut state = self.state.write();
        if let Ok(value) = &result {
            if state.invalidated_since(path, started_at) {
                tracing::debug!(
                    target = "brisk.vfs",
                    path = %path.display(),
                    "discarding snapshot computed during a concurrent invalidation"
                );
            } else {
                for snapshot in recorded(value) {
                    state.record(snapshot);
                }
            }
        }
        finish_store(&mut state);
        drop(state);
        std::mem::forget(guard);
        result
    }

    /// Drops cached state for every path in `paths`, their descendants, and their ancestors.
    pub fn invalidate<I, P>(&self, paths: I)
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut state = self.state.write();
        for path in paths {
            state.invalidate(path.as_ref());
        }
    }

    pub fn invalidate_all(&self) {
        self.state.write().invalidate_all();
    }

    /// Renames `from` to `to` on disk and moves the cached state along, without rehashing.
    ///
    /// The rename runs outside the lock. If either path is invalidated meanwhile, the moved
    /// state is dropped instead of recorded.
    pub fn move_atomically(&self, from: &Path, to: &Path) -> Result<(), VfsError> {
        let (moved, started_at) = {
            let mut state = self.state.write();
            let moved = state.find_snapshot(from);
            state.invalidate(from);
            state.invalidate(to);
            state.stores_in_flight += 1;
            (moved, state.version)
        };
        let _guard = InFlight { vfs: self };

        fs::rename(from, to).map_err(|source| VfsError::Move {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
            source,
        })?;

        let mut state = self.state.write();
        let interrupted =
            state.invalidated_since(from, started_at) || state.invalidated_since(to, started_at);
        state.invalidate(from);
        state.invalidate(to);
        match moved {
            Some(snapshot) if !interrupted && snapshot.file_type() != FileType::Missing => {
                state.record(snapshot.relocate(to));
            }
            _ => {}
        }
        Ok(())
    }

    /// Number of top-level entries.
    pub fn entry_count(&self) -> usize {
        self.state.read().entries.len()
    }

    /// Paths that currently have their own entry, in order.
    pub fn entry_paths(&self) -> Vec<PathBuf> {
        self.state.read().entries.keys().cloned().collect()
    }
}

fn finish_store(state: &mut VfsState) {
    state.stores_in_flight = state.stores_in_flight.saturating_sub(1);
    if state.stores_in_flight == 0 {
        state.invalidated.clear();
    }
}

/// Balances the in-flight counter if a supplier panics.
struct InFlight<'a> {
    vfs: &'a Vfs,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        finish_store(&mut self.vfs.state.write());
    }
}

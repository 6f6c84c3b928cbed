use std::fs::{self, Metadata};
use std::io;
use std::path::{Path, PathBuf};

use brisk_core::FileType;
use walkdir::WalkDir;

use crate::excludes::DefaultExcludes;
use crate::filter::SnapshottingFilter;
use crate::tree::{
    AccessType, DirectorySnapshot, FileMetadata, MissingSnapshot, RegularFileSnapshot, Snapshot,
};
use crate::SnapshotError;

/// Result of a walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotOutcome {
    /// The (possibly filtered) snapshot of the root.
    pub snapshot: Snapshot,
    /// The largest subtrees and leaves that the filter left untouched. When nothing was filtered
    /// this is just `[snapshot]`.
    pub unfiltered: Vec<Snapshot>,
    pub is_filtered: bool,
}

impl SnapshotOutcome {
    fn complete(snapshot: Snapshot) -> Self {
        Self {
            unfiltered: vec![snapshot.clone()],
            snapshot,
            is_filtered: false,
        }
    }
}

struct DirBuilder {
    path: PathBuf,
    access_type: AccessType,
    /// Children with a flag telling whether the child subtree is complete.
    children: Vec<(Snapshot, bool)>,
    filtered: bool,
}

impl DirBuilder {
    fn new(path: PathBuf, access_type: AccessType) -> Self {
        Self {
            path,
            access_type,
            children: Vec::new(),
            filtered: false,
        }
    }

    /// Builds the directory snapshot. For a filtered directory, its complete children are handed
    /// to `unfiltered`.
    fn finish(self, unfiltered: &mut Vec<Snapshot>) -> (Snapshot, bool) {
        let complete = !self.filtered;
        let children = self
            .children
            .into_iter()
            .map(|(child, child_complete)| {
                if !complete && child_complete {
                    unfiltered.push(child.clone());
                }
                child
            })
            .collect();
        let snapshot =
            Snapshot::Directory(DirectorySnapshot::new(self.path, self.access_type, children));
        (snapshot, complete)
    }
}

/// Walks the filesystem and produces [`Snapshot`] trees.
///
/// Symlinks are always followed. Entries reached through a symlink are tagged
/// [`AccessType::ViaSymlink`], a dangling symlink becomes a missing entry, and an entry that
/// would close a symlink loop is left out. Sockets, fifos, and devices are skipped.
#[derive(Debug, Clone, Default)]
pub struct DirectorySnapshotter {
    excludes: DefaultExcludes,
}

impl DirectorySnapshotter {
    pub fn new(excludes: DefaultExcludes) -> Self {
        Self { excludes }
    }

    pub fn excludes(&self) -> &DefaultExcludes {
        &self.excludes
    }

    pub fn snapshot(
        &self,
        root: &Path,
        filter: &SnapshottingFilter,
    ) -> Result<SnapshotOutcome, SnapshotError> {
        let (metadata, access_type) = match stat_following_links(root)? {
            Some(stat) => stat,
            None => {
                let access_type = if is_symlink(root) {
                    AccessType::ViaSymlink
                } else {
                    AccessType::Direct
                };
                return Ok(SnapshotOutcome::complete(Snapshot::Missing(
                    MissingSnapshot::new(root.to_path_buf(), access_type),
                )));
            }
        };

        if metadata.is_file() {
            let file = snapshot_file(root, &metadata, access_type)?;
            return Ok(SnapshotOutcome::complete(file));
        }
        if !metadata.is_dir() {
            tracing::debug!(
                target = "brisk.snapshot",
                path = %root.display(),
                "root is neither a file nor a directory; treating it as missing"
            );
            return Ok(SnapshotOutcome::complete(Snapshot::Missing(
                MissingSnapshot::new(root.to_path_buf(), access_type),
            )));
        }

        self.walk_directory(root, access_type, filter)
    }

    fn walk_directory(
        &self,
        root: &Path,
        root_access: AccessType,
        filter: &SnapshottingFilter,
    ) -> Result<SnapshotOutcome, SnapshotError> {
        let mut unfiltered = Vec::new();
        let mut stack = vec![DirBuilder::new(root.to_path_buf(), root_access)];
        let mut walker = WalkDir::new(root)
            .follow_links(true)
            .sort_by_file_name()
            .min_depth(1)
            .into_iter();

        while let Some(next) = walker.next() {
            let entry = match next {
                Ok(entry) => entry,
                Err(err) => {
                    if err.loop_ancestor().is_some() {
                        tracing::debug!(
                            target = "brisk.snapshot",
                            path = ?err.path(),
                            "skipping symlink that closes a loop"
                        );
                        continue;
                    }
                    let dangling = match (err.path(), err.io_error()) {
                        (Some(path), Some(io_err))
                            if io_err.kind() == io::ErrorKind::NotFound && is_symlink(path) =>
                        {
                            Some(path.to_path_buf())
                        }
                        _ => None,
                    };
                    let Some(path) = dangling else {
                        let path = err.path().unwrap_or(root).to_path_buf();
                        return Err(SnapshotError::Walk { path, source: err });
                    };
                    unwind_to(&mut stack, err.depth(), &mut unfiltered);
                    let name = brisk_core::file_name_of(&path);
                    let relative = relative_of(root, &path);
                    let parent = top(&mut stack);
                    if self.excludes.excludes_file(&name) {
                        continue;
                    }
                    if !filter.accepts(&relative, FileType::Missing) {
                        parent.filtered = true;
                        continue;
                    }
                    let missing =
                        Snapshot::Missing(MissingSnapshot::new(path, AccessType::ViaSymlink));
                    parent.children.push((missing, true));
                    continue;
                }
            };

            unwind_to(&mut stack, entry.depth(), &mut unfiltered);

            let path = entry.path();
            let name = entry.file_name().to_string_lossy();
            let relative = relative_of(root, path);
            let access_type = if entry.path_is_symlink() {
                AccessType::ViaSymlink
            } else {
                AccessType::Direct
            };
            let file_type = entry.file_type();

            if file_type.is_dir() {
                if self.excludes.excludes_dir(&name) {
                    walker.skip_current_dir();
                    continue;
                }
                if !filter.accepts(&relative, FileType::Directory) {
                    top(&mut stack).filtered = true;
                    walker.skip_current_dir();
                    continue;
                }
                stack.push(DirBuilder::new(path.to_path_buf(), access_type));
            } else if file_type.is_file() {
                if self.excludes.excludes_file(&name) {
                    continue;
                }
                if !filter.accepts(&relative, FileType::RegularFile) {
                    top(&mut stack).filtered = true;
                    continue;
                }
                let metadata = entry.metadata().map_err(|source| SnapshotError::Walk {
                    path: path.to_path_buf(),
                    source,
                })?;
                let file = snapshot_file(path, &metadata, access_type)?;
                top(&mut stack).children.push((file, true));
            } else {
                tracing::trace!(
                    target = "brisk.snapshot",
                    path = %path.display(),
                    "skipping special file"
                );
            }
        }

        unwind_to(&mut stack, 1, &mut unfiltered);
        let Some(root_builder) = stack.pop() else {
            return Err(SnapshotError::io(
                root,
                io::Error::new(io::ErrorKind::Other, "walk lost its root directory"),
            ));
        };
        let (snapshot, complete) = root_builder.finish(&mut unfiltered);
        if complete {
            return Ok(SnapshotOutcome::complete(snapshot));
        }
        tracing::trace!(
            target = "brisk.snapshot",
            path = %root.display(),
            unfiltered = unfiltered.len(),
            "walk was filtered"
        );
        Ok(SnapshotOutcome {
            snapshot,
            unfiltered,
            is_filtered: true,
        })
    }
}

/// Finishes open directories until the top of the stack is the parent of an entry at `depth`.
fn unwind_to(stack: &mut Vec<DirBuilder>, depth: usize, unfiltered: &mut Vec<Snapshot>) {
    while stack.len() > depth.max(1) {
        let Some(builder) = stack.pop() else {
            return;
        };
        let (snapshot, complete) = builder.finish(unfiltered);
        let parent = top(stack);
        if !complete {
            parent.filtered = true;
        }
        parent.children.push((snapshot, complete));
    }
}

fn top(stack: &mut [DirBuilder]) -> &mut DirBuilder {
    // The root builder is only popped after the walk.
    let last = stack.len() - 1;
    &mut stack[last]
}

fn relative_of(root: &Path, path: &Path) -> String {
    brisk_core::relative_path_string(root, path).unwrap_or_else(|| brisk_core::file_name_of(path))
}

fn is_symlink(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|meta| meta.file_type().is_symlink())
        .unwrap_or(false)
}

/// Returns the metadata of `path` (following symlinks) and how it was reached, or `None` if
/// nothing exists there.
fn stat_following_links(path: &Path) -> Result<Option<(Metadata, AccessType)>, SnapshotError> {
    let link_meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(SnapshotError::io(path, err)),
    };
    if !link_meta.file_type().is_symlink() {
        return Ok(Some((link_meta, AccessType::Direct)));
    }
    match fs::metadata(path) {
        Ok(meta) => Ok(Some((meta, AccessType::ViaSymlink))),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(SnapshotError::io(path, err)),
    }
}

fn snapshot_file(
    path: &Path,
    metadata: &Metadata,
    access_type: AccessType,
) -> Result<Snapshot, SnapshotError> {
    let last_modified = metadata
        .modified()
        .map(brisk_core::system_time_to_nanos)
        .map_err(|err| SnapshotError::io(path, err))?;
    let content_hash = brisk_hash::hash_file(path).map_err(|err| SnapshotError::io(path, err))?;
    Ok(Snapshot::RegularFile(RegularFileSnapshot::new(
        path.to_path_buf(),
        content_hash,
        FileMetadata {
            length: metadata.len(),
            last_modified,
            access_type,
        },
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_root_is_missing() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().join("absent");
        let outcome = DirectorySnapshotter::default()
            .snapshot(&root, &SnapshottingFilter::empty())
            .unwrap();
        assert_eq!(outcome.snapshot.file_type(), FileType::Missing);
        assert!(!outcome.is_filtered);
        assert_eq!(outcome.unfiltered, vec![outcome.snapshot.clone()]);
    }

    #[test]
    fn file_root_is_hashed() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().join("a.txt");
        fs::write(&root, "hello").unwrap();
        let outcome = DirectorySnapshotter::default()
            .snapshot(&root, &SnapshottingFilter::empty())
            .unwrap();
        let Snapshot::RegularFile(file) = &outcome.snapshot else {
            panic!("expected a regular file, got {:?}", outcome.snapshot);
        };
        assert_eq!(file.length(), 5);
        assert_eq!(file.content_hash(), brisk_hash::hash_bytes(b"hello"));
        assert_eq!(file.name(), "a.txt");
    }

    #[test]
    fn default_excludes_do_not_count_as_filtering() {
        let temp = tempfile::tempdir().unwrap();
        fs::create_dir(temp.path().join(".git")).unwrap();
        fs::write(temp.path().join(".git").join("HEAD"), "ref").unwrap();
        fs::write(temp.path().join(".gitignore"), "target").unwrap();
        fs::write(temp.path().join("a.txt"), "a").unwrap();

        let outcome = DirectorySnapshotter::default()
            .snapshot(temp.path(), &SnapshottingFilter::empty())
            .unwrap();
        assert!(!outcome.is_filtered);
        let mut seen = Vec::new();
        outcome
            .snapshot
            .for_each(&mut |_, rel| seen.push(rel.to_string()));
        assert_eq!(seen, ["", "a.txt"]);
    }

    #[test]
    fn filtered_walk_reports_unfiltered_parts() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("keep")).unwrap();
        fs::create_dir_all(root.join("mixed")).unwrap();
        fs::write(root.join("keep").join("a.txt"), "a").unwrap();
        fs::write(root.join("mixed").join("b.txt"), "b").unwrap();
        fs::write(root.join("mixed").join("c.log"), "c").unwrap();

        let filter = SnapshottingFilter::new(Vec::<&str>::new(), vec!["**/*.log"]).unwrap();
        let outcome = DirectorySnapshotter::default()
            .snapshot(root, &filter)
            .unwrap();
        assert!(outcome.is_filtered);

        let mut unfiltered: Vec<_> = outcome
            .unfiltered
            .iter()
            .map(|s| s.absolute_path().to_path_buf())
            .collect();
        unfiltered.sort();
        assert_eq!(
            unfiltered,
            vec![root.join("keep"), root.join("mixed").join("b.txt")]
        );

        let mut seen = Vec::new();
        outcome
            .snapshot
            .for_each(&mut |_, rel| seen.push(rel.to_string()));
        assert_eq!(seen, ["", "keep", "keep/a.txt", "mixed", "mixed/b.txt"]);
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_followed_and_tagged() {
        use std::os::unix::fs::symlink;

        let temp = tempfile::tempdir().unwrap();
        let target = temp.path().join("target");
        fs::create_dir(&target).unwrap();
        fs::write(target.join("t.txt"), "t").unwrap();

        let root = temp.path().join("root");
        fs::create_dir(&root).unwrap();
        symlink(&target, root.join("linked")).unwrap();
        symlink(root.join("nowhere"), root.join("dangling")).unwrap();
        symlink(&root, root.join("loop")).unwrap();

        let outcome = DirectorySnapshotter::default()
            .snapshot(&root, &SnapshottingFilter::empty())
            .unwrap();

        let linked = outcome.snapshot.find(&root.join("linked")).unwrap();
        assert_eq!(linked.file_type(), FileType::Directory);
        assert_eq!(linked.access_type(), AccessType::ViaSymlink);
        let inner = outcome
            .snapshot
            .find(&root.join("linked").join("t.txt"))
            .unwrap();
        assert_eq!(inner.hash(), brisk_hash::hash_bytes(b"t"));

        let dangling = outcome.snapshot.find(&root.join("dangling")).unwrap();
        assert_eq!(dangling.file_type(), FileType::Missing);
        assert_eq!(dangling.access_type(), AccessType::ViaSymlink);

        let Snapshot::Directory(dir) = &outcome.snapshot else {
            panic!("expected a directory");
        };
        let names: Vec<_> = dir.children().iter().map(|c| c.name()).collect();
        assert_eq!(names, ["dangling", "linked"]);
    }
}

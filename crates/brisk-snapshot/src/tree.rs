use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, OnceLock};

use brisk_core::FileType;
use brisk_hash::{HashCode, Hasher};

/// Tag folded into [`directory_signature`].
const DIRECTORY_TAG: &str = "DIRECTORY";
/// Tag folded into [`missing_file_signature`].
const MISSING_TAG: &str = "MISSING";

/// Placeholder hash used for directory entries. Directory identity is path based; the
/// signature never depends on the children.
pub fn directory_signature() -> HashCode {
    static SIGNATURE: OnceLock<HashCode> = OnceLock::new();
    *SIGNATURE.get_or_init(|| HashCode::signature(DIRECTORY_TAG))
}

/// Placeholder hash used for missing paths.
pub fn missing_file_signature() -> HashCode {
    static SIGNATURE: OnceLock<HashCode> = OnceLock::new();
    *SIGNATURE.get_or_init(|| HashCode::signature(MISSING_TAG))
}

/// How a location was reached during a walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessType {
    Direct,
    ViaSymlink,
}

/// Metadata of a regular file that identifies it physically (without reading its content).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileMetadata {
    pub length: u64,
    /// Nanoseconds since the unix epoch.
    pub last_modified: i64,
    pub access_type: AccessType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegularFileSnapshot {
    absolute_path: PathBuf,
    name: String,
    content_hash: HashCode,
    metadata: FileMetadata,
}

impl RegularFileSnapshot {
    pub fn new(absolute_path: PathBuf, content_hash: HashCode, metadata: FileMetadata) -> Self {
        let name = brisk_core::file_name_of(&absolute_path);
        Self {
            absolute_path,
            name,
            content_hash,
            metadata,
        }
    }

    pub fn absolute_path(&self) -> &Path {
        &self.absolute_path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn content_hash(&self) -> HashCode {
        self.content_hash
    }

    pub fn metadata(&self) -> &FileMetadata {
        &self.metadata
    }

    pub fn length(&self) -> u64 {
        self.metadata.length
    }

    pub fn last_modified(&self) -> i64 {
        self.metadata.last_modified
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectorySnapshot {
    absolute_path: PathBuf,
    name: String,
    access_type: AccessType,
    children: Arc<[Snapshot]>,
}

impl DirectorySnapshot {
    /// Creates a directory snapshot. `children` are sorted by name.
    pub fn new(absolute_path: PathBuf, access_type: AccessType, mut children: Vec<Snapshot>) -> Self {
        children.sort_by(|a, b| a.name().cmp(b.name()));
        let name = brisk_core::file_name_of(&absolute_path);
        Self {
            absolute_path,
            name,
            access_type,
            children: children.into(),
        }
    }

    pub fn absolute_path(&self) -> &Path {
        &self.absolute_path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn access_type(&self) -> AccessType {
        self.access_type
    }

    pub fn children(&self) -> &[Snapshot] {
        &self.children
    }

    /// Synthesizes a hash from the `(name, hash)` pairs of the whole subtree.
    ///
    /// This is computed on demand and is never part of [`Snapshot::hash`].
    pub fn merkle_hash(&self) -> HashCode {
        let mut hasher = Hasher::new();
        hasher.put_str(DIRECTORY_TAG);
        for child in self.children.iter() {
            hasher.put_str(child.name());
            let child_hash = match child {
                Snapshot::Directory(dir) => dir.merkle_hash(),
                other => other.hash(),
            };
            hasher.put_hash(&child_hash);
        }
        hasher.finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingSnapshot {
    absolute_path: PathBuf,
    name: String,
    access_type: AccessType,
}

impl MissingSnapshot {
    pub fn new(absolute_path: PathBuf, access_type: AccessType) -> Self {
        let name = brisk_core::file_name_of(&absolute_path);
        Self {
            absolute_path,
            name,
            access_type,
        }
    }

    pub fn absolute_path(&self) -> &Path {
        &self.absolute_path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn access_type(&self) -> AccessType {
        self.access_type
    }
}

/// Immutable observation of a filesystem location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Snapshot {
    RegularFile(RegularFileSnapshot),
    Directory(DirectorySnapshot),
    Missing(MissingSnapshot),
}

impl Snapshot {
    pub fn absolute_path(&self) -> &Path {
        match self {
            Snapshot::RegularFile(file) => file.absolute_path(),
            Snapshot::Directory(dir) => dir.absolute_path(),
            Snapshot::Missing(missing) => missing.absolute_path(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Snapshot::RegularFile(file) => file.name(),
            Snapshot::Directory(dir) => dir.name(),
            Snapshot::Missing(missing) => missing.name(),
        }
    }

    pub fn file_type(&self) -> FileType {
        match self {
            Snapshot::RegularFile(_) => FileType::RegularFile,
            Snapshot::Directory(_) => FileType::Directory,
            Snapshot::Missing(_) => FileType::Missing,
        }
    }

    pub fn access_type(&self) -> AccessType {
        match self {
            Snapshot::RegularFile(file) => file.metadata().access_type,
            Snapshot::Directory(dir) => dir.access_type(),
            Snapshot::Missing(missing) => missing.access_type(),
        }
    }

    /// The content hash of a file, or the fixed signature for directories and missing paths.
    pub fn hash(&self) -> HashCode {
        match self {
            Snapshot::RegularFile(file) => file.content_hash(),
            Snapshot::Directory(_) => directory_signature(),
            Snapshot::Missing(_) => missing_file_signature(),
        }
    }

    /// Looks up the snapshot of `path` inside this tree.
    ///
    /// Returns a `Missing` snapshot when `path` lies under a known directory but is not one of
    /// its entries, and `None` when `path` is not covered by this tree at all.
    pub fn find(&self, path: &Path) -> Option<Snapshot> {
        let relative = path.strip_prefix(self.absolute_path()).ok()?;
        let mut current = self;
        for component in relative.components() {
            let Component::Normal(segment) = component else {
                continue;
            };
            let segment = segment.to_string_lossy();
            match current {
                Snapshot::Directory(dir) => {
                    match dir
                        .children()
                        .binary_search_by(|child| child.name().cmp(segment.as_ref()))
                    {
                        Ok(index) => current = &dir.children()[index],
                        Err(_) => {
                            return Some(Snapshot::Missing(MissingSnapshot::new(
                                path.to_path_buf(),
                                AccessType::Direct,
                            )))
                        }
                    }
                }
                // Below a file or a missing path everything is missing.
                Snapshot::RegularFile(_) | Snapshot::Missing(_) => {
                    return Some(Snapshot::Missing(MissingSnapshot::new(
                        path.to_path_buf(),
                        AccessType::Direct,
                    )))
                }
            }
        }
        Some(current.clone())
    }

    /// Returns the same tree rooted at `new_root`, without touching content hashes.
    pub fn relocate(&self, new_root: &Path) -> Snapshot {
        match self {
            Snapshot::RegularFile(file) => Snapshot::RegularFile(RegularFileSnapshot::new(
                new_root.to_path_buf(),
                file.content_hash(),
                *file.metadata(),
            )),
            Snapshot::Missing(missing) => Snapshot::Missing(MissingSnapshot::new(
                new_root.to_path_buf(),
                missing.access_type(),
            )),
            Snapshot::Directory(dir) => {
                let children = dir
                    .children()
                    .iter()
                    .map(|child| child.relocate(&new_root.join(child.name())))
                    .collect();
                Snapshot::Directory(DirectorySnapshot::new(
                    new_root.to_path_buf(),
                    dir.access_type(),
                    children,
                ))
            }
        }
    }

    /// Visits this snapshot and all descendants depth-first (parents before children, children
    /// in name order). The second argument is the `/`-separated path relative to `self` (`""`
    /// for `self`).
    pub fn for_each(&self, visitor: &mut dyn FnMut(&Snapshot, &str)) {
        let mut relative = String::new();
        self.for_each_inner(&mut relative, visitor);
    }

    fn for_each_inner(&self, relative: &mut String, visitor: &mut dyn FnMut(&Snapshot, &str)) {
        visitor(self, relative);
        if let Snapshot::Directory(dir) = self {
            for child in dir.children() {
                let len = relative.len();
                if !relative.is_empty() {
                    relative.push('/');
                }
                relative.push_str(child.name());
                child.for_each_inner(relative, visitor);
                relative.truncate(len);
            }
        }
    }

    /// Number of nodes in the tree, including `self`.
    pub fn node_count(&self) -> usize {
        let mut count = 0;
        self.for_each(&mut |_, _| count += 1);
        count
    }
}

use std::fmt;
use std::path::PathBuf;

use brisk_core::FileType;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use crate::tree::{DirectorySnapshot, Snapshot};
use crate::SnapshotError;

/// Include/exclude patterns matched against `/`-separated paths relative to the walk root.
///
/// Patterns use glob syntax where `*` never crosses a `/` and `**` matches any number of
/// segments. Excludes apply to every entry; a matching directory is pruned with its subtree.
/// Includes apply to files (and missing entries) only, so directories are always descended.
#[derive(Clone)]
pub struct SnapshottingFilter {
    includes: Vec<String>,
    excludes: Vec<String>,
    include_set: GlobSet,
    exclude_set: GlobSet,
}

impl SnapshottingFilter {
    pub fn new<I, E, S>(includes: I, excludes: E) -> Result<Self, SnapshotError>
    where
        I: IntoIterator<Item = S>,
        E: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let includes: Vec<String> = includes.into_iter().map(Into::into).collect();
        let excludes: Vec<String> = excludes.into_iter().map(Into::into).collect();
        let include_set = build_set(&includes)?;
        let exclude_set = build_set(&excludes)?;
        Ok(Self {
            includes,
            excludes,
            include_set,
            exclude_set,
        })
    }

    /// A filter that accepts everything.
    pub fn empty() -> Self {
        Self {
            includes: Vec::new(),
            excludes: Vec::new(),
            include_set: GlobSet::empty(),
            exclude_set: GlobSet::empty(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.includes.is_empty() && self.excludes.is_empty()
    }

    /// Stable description of the patterns, folded into fingerprint strategy identifiers.
    pub fn identifier(&self) -> String {
        format!(
            "include[{}]exclude[{}]",
            self.includes.join(","),
            self.excludes.join(",")
        )
    }

    /// Whether an entry at `relative_path` survives the filter.
    ///
    /// The walk root (`""`) is always accepted.
    pub fn accepts(&self, relative_path: &str, file_type: FileType) -> bool {
        if relative_path.is_empty() {
            return true;
        }
        if self.exclude_set.is_match(relative_path) {
            return false;
        }
        match file_type {
            FileType::Directory => true,
            FileType::RegularFile | FileType::Missing => {
                self.includes.is_empty() || self.include_set.is_match(relative_path)
            }
        }
    }

    /// Applies the filter to an already captured tree.
    ///
    /// Returns the filtered tree and whether anything was removed from it. Filters apply to the
    /// contents of a directory; a root regular file or missing root is returned unchanged.
    pub fn apply(&self, snapshot: &Snapshot) -> (Snapshot, bool) {
        match snapshot {
            Snapshot::Directory(dir) if !self.is_empty() => {
                let mut filtered = false;
                let result = self.filter_directory(dir, "", &mut filtered);
                (Snapshot::Directory(result), filtered)
            }
            other => (other.clone(), false),
        }
    }

    fn filter_directory(
        &self,
        dir: &DirectorySnapshot,
        relative: &str,
        filtered: &mut bool,
    ) -> DirectorySnapshot {
        let mut children = Vec::with_capacity(dir.children().len());
        for child in dir.children() {
            let child_relative = if relative.is_empty() {
                child.name().to_string()
            } else {
                format!("{relative}/{}", child.name())
            };
            if !self.accepts(&child_relative, child.file_type()) {
                *filtered = true;
                continue;
            }
            match child {
                Snapshot::Directory(sub) => {
                    let sub = self.filter_directory(sub, &child_relative, filtered);
                    children.push(Snapshot::Directory(sub));
                }
                other => children.push(other.clone()),
            }
        }
        DirectorySnapshot::new(
            PathBuf::from(dir.absolute_path()),
            dir.access_type(),
            children,
        )
    }
}

impl Default for SnapshottingFilter {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for SnapshottingFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshottingFilter")
            .field("includes", &self.includes)
            .field("excludes", &self.excludes)
            .finish()
    }
}

impl PartialEq for SnapshottingFilter {
    fn eq(&self, other: &Self) -> bool {
        self.includes == other.includes && self.excludes == other.excludes
    }
}

impl Eq for SnapshottingFilter {}

fn build_set(patterns: &[String]) -> Result<GlobSet, SnapshotError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|source| SnapshotError::InvalidPattern {
                pattern: pattern.clone(),
                source,
            })?;
        builder.add(glob);
    }
    builder.build().map_err(|source| SnapshotError::InvalidPattern {
        pattern: patterns.join(","),
        source,
    })
}

use std::fmt;

use serde::{Deserialize, Serialize};

/// How entries of an archive are combined into the archive's hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FingerprintHashingStrategy {
    /// Entries are sorted before folding; the result ignores listing order.
    Sort,
    /// Entries are folded in encounter order.
    KeepOrder,
}

impl FingerprintHashingStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            FingerprintHashingStrategy::Sort => "SORT",
            FingerprintHashingStrategy::KeepOrder => "KEEP_ORDER",
        }
    }
}

/// Whether directory entries appear in a fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DirectorySensitivity {
    /// Directories are entries with a fixed placeholder hash.
    #[default]
    Default,
    IgnoreDirectories,
}

impl DirectorySensitivity {
    pub fn as_str(self) -> &'static str {
        match self {
            DirectorySensitivity::Default => "DEFAULT",
            DirectorySensitivity::IgnoreDirectories => "IGNORE_DIRECTORIES",
        }
    }
}

/// Treatment of files on a classpath that are not class files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NonClassFiles {
    UseFileHash,
    Ignore,
}

/// Treatment of class files on a classpath.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClassContent {
    /// The bytes are hashed as they are.
    Bytes,
    /// Only the class ABI is hashed; classes without an ABI are dropped.
    Abi,
}

/// Classpath normalization, as two independent layers: how archive entries are ordered, and how
/// each entry is reduced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClasspathNormalization {
    pub archive_entry_order: FingerprintHashingStrategy,
    pub class_content: ClassContent,
    pub non_class_files: NonClassFiles,
}

impl ClasspathNormalization {
    /// Everything that can affect a program at run time.
    pub const fn runtime() -> Self {
        Self {
            archive_entry_order: FingerprintHashingStrategy::Sort,
            class_content: ClassContent::Bytes,
            non_class_files: NonClassFiles::UseFileHash,
        }
    }

    /// Only what a compiler sees.
    pub const fn compile() -> Self {
        Self {
            archive_entry_order: FingerprintHashingStrategy::Sort,
            class_content: ClassContent::Abi,
            non_class_files: NonClassFiles::Ignore,
        }
    }

    pub fn identifier(&self) -> String {
        let content = match self.class_content {
            ClassContent::Bytes => "BYTES",
            ClassContent::Abi => "ABI",
        };
        let non_class = match self.non_class_files {
            NonClassFiles::UseFileHash => "USE_FILE_HASH",
            NonClassFiles::Ignore => "IGNORE",
        };
        format!(
            "CLASSPATH(entries={},classes={content},resources={non_class})",
            self.archive_entry_order.as_str()
        )
    }
}

/// Maps a physical file to the logical key used for comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Normalization {
    AbsolutePath,
    /// Paths relative to the fingerprinted root.
    RelativePath,
    /// Only the final path segment.
    NameOnly,
    /// Content only; directories and missing files never appear.
    IgnorePath,
    Classpath(ClasspathNormalization),
}

impl Normalization {
    /// The hashing strategy that combines the entries of a fingerprint under this normalization.
    pub fn hashing_strategy(&self) -> FingerprintHashingStrategy {
        match self {
            Normalization::Classpath(_) => FingerprintHashingStrategy::KeepOrder,
            Normalization::AbsolutePath
            | Normalization::RelativePath
            | Normalization::NameOnly
            | Normalization::IgnorePath => FingerprintHashingStrategy::Sort,
        }
    }

    pub fn identifier(&self) -> String {
        match self {
            Normalization::AbsolutePath => "ABSOLUTE_PATH".to_string(),
            Normalization::RelativePath => "RELATIVE_PATH".to_string(),
            Normalization::NameOnly => "NAME_ONLY".to_string(),
            Normalization::IgnorePath => "IGNORED_PATH".to_string(),
            Normalization::Classpath(classpath) => classpath.identifier(),
        }
    }
}

impl fmt::Display for Normalization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identifier())
    }
}

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of thing found at a filesystem location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FileType {
    RegularFile,
    Directory,
    Missing,
}

impl FileType {
    pub fn as_str(self) -> &'static str {
        match self {
            FileType::RegularFile => "file",
            FileType::Directory => "directory",
            FileType::Missing => "missing",
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

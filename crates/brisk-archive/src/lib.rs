//! Reading zip-based archives (`.jar`, `.zip`, `.war`, ...).
//!
//! Entries are visited in their physical order; callers that need an order-independent view sort
//! on their side.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use zip::result::ZipError;
use zip::ZipArchive;

/// File extensions treated as zip archives.
pub const ARCHIVE_EXTENSIONS: &[&str] = &["jar", "zip", "war", "ear", "aar", "jmod"];

const ZIP_MAGIC: [u8; 4] = *b"PK\x03\x04";
const EMPTY_ZIP_MAGIC: [u8; 4] = *b"PK\x05\x06";

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("failed to open archive {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read zip {}: {source}", .path.display())]
    Zip {
        path: PathBuf,
        #[source]
        source: ZipError,
    },

    #[error("failed to read {entry} from {}: {source}", .path.display())]
    Entry {
        path: PathBuf,
        entry: String,
        #[source]
        source: io::Error,
    },
}

/// One entry of an archive with its uncompressed content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub is_dir: bool,
    pub bytes: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct Archive {
    path: PathBuf,
}

impl Archive {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> Result<ZipArchive<File>, ArchiveError> {
        let file = File::open(&self.path).map_err(|source| ArchiveError::Open {
            path: self.path.clone(),
            source,
        })?;
        ZipArchive::new(file).map_err(|source| ArchiveError::Zip {
            path: self.path.clone(),
            source,
        })
    }

    /// Read a file from the archive.
    ///
    /// Returns `Ok(None)` when the file isn't present.
    pub fn read(&self, name: &str) -> Result<Option<Vec<u8>>, ArchiveError> {
        let mut zip = self.open()?;
        let result = match zip.by_name(name) {
            Ok(mut entry) => {
                let mut buf = Vec::new();
                entry
                    .read_to_end(&mut buf)
                    .map_err(|source| ArchiveError::Entry {
                        path: self.path.clone(),
                        entry: name.to_string(),
                        source,
                    })?;
                Ok(Some(buf))
            }
            Err(ZipError::FileNotFound) => Ok(None),
            Err(source) => Err(ArchiveError::Zip {
                path: self.path.clone(),
                source,
            }),
        };
        result
    }

    /// Calls `visit` for every entry, in the order the entries are stored.
    ///
    /// A corrupt entry aborts the iteration with an error; nothing is skipped silently.
    pub fn for_each_entry<E>(
        &self,
        mut visit: impl FnMut(ArchiveEntry) -> Result<(), E>,
    ) -> Result<(), E>
    where
        E: From<ArchiveError>,
    {
        let mut zip = self.open()?;
        for index in 0..zip.len() {
            let mut entry = zip.by_index(index).map_err(|source| ArchiveError::Zip {
                path: self.path.clone(),
                source,
            })?;
            let name = entry.name().to_string();
            let is_dir = entry.is_dir();
            let mut bytes = Vec::new();
            if !is_dir {
                entry
                    .read_to_end(&mut bytes)
                    .map_err(|source| ArchiveError::Entry {
                        path: self.path.clone(),
                        entry: name.clone(),
                        source,
                    })?;
            }
            visit(ArchiveEntry {
                name,
                is_dir,
                bytes,
            })?;
        }
        Ok(())
    }

    /// Entry names in stored order.
    pub fn entry_names(&self) -> Result<Vec<String>, ArchiveError> {
        let zip = self.open()?;
        Ok(zip.file_names().map(str::to_string).collect())
    }
}

/// Whether `path` names an archive by extension (case-insensitive).
pub fn has_archive_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            ARCHIVE_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
}

/// Whether `bytes` start with a zip local-file or end-of-central-directory signature.
pub fn looks_like_zip(bytes: &[u8]) -> bool {
    bytes.starts_with(&ZIP_MAGIC) || bytes.starts_with(&EMPTY_ZIP_MAGIC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;

    fn write_jar(path: &Path, entries: &[(&str, &[u8])]) {
        let mut jar = zip::ZipWriter::new(File::create(path).unwrap());
        let options = FileOptions::<()>::default();
        for (name, bytes) in entries {
            if name.ends_with('/') {
                jar.add_directory(*name, options).unwrap();
            } else {
                jar.start_file(*name, options).unwrap();
                jar.write_all(bytes).unwrap();
            }
        }
        jar.finish().unwrap();
    }

    #[test]
    fn entries_are_visited_in_stored_order() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("lib.jar");
        write_jar(&path, &[("b.txt", b"b"), ("META-INF/", b""), ("a.txt", b"a")]);

        let mut seen = Vec::new();
        Archive::new(&path)
            .for_each_entry(|entry| {
                seen.push((entry.name, entry.is_dir, entry.bytes));
                Ok::<_, ArchiveError>(())
            })
            .unwrap();
        assert_eq!(
            seen,
            vec![
                ("b.txt".to_string(), false, b"b".to_vec()),
                ("META-INF/".to_string(), true, Vec::new()),
                ("a.txt".to_string(), false, b"a".to_vec()),
            ]
        );
    }

    #[test]
    fn read_returns_none_for_absent_entries() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("lib.jar");
        write_jar(&path, &[("a.txt", b"hello")]);

        let archive = Archive::new(&path);
        assert_eq!(archive.read("a.txt").unwrap(), Some(b"hello".to_vec()));
        assert_eq!(archive.read("missing.txt").unwrap(), None);
        assert_eq!(archive.entry_names().unwrap(), vec!["a.txt".to_string()]);
    }

    #[test]
    fn corrupt_archives_are_errors() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("broken.jar");
        std::fs::write(&path, b"PK\x03\x04 definitely not a zip").unwrap();

        let err = Archive::new(&path)
            .for_each_entry(|_| Ok::<_, ArchiveError>(()))
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Zip { .. }));
    }

    #[test]
    fn archive_detection() {
        assert!(has_archive_extension(Path::new("/x/lib.JAR")));
        assert!(has_archive_extension(Path::new("dist.zip")));
        assert!(!has_archive_extension(Path::new("Main.class")));
        assert!(looks_like_zip(b"PK\x03\x04rest"));
        assert!(!looks_like_zip(b"\xCA\xFE\xBA\xBE"));
    }
}

use std::fmt;
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use brisk_archive::{Archive, ArchiveEntry};
use brisk_hash::{HashCode, Hasher};
use brisk_snapshot::RegularFileSnapshot;
use lru::LruCache;
use parking_lot::Mutex;

use crate::error::ResourceHashError;
use crate::normalization::{
    ClassContent, ClasspathNormalization, FingerprintHashingStrategy, NonClassFiles,
};

/// Computes the normalized hash of a single regular file.
pub trait ResourceHasher: Send + Sync {
    /// Stable description of the hashing rules. Two hashers with the same identifier produce the
    /// same hash for the same file.
    fn identifier(&self) -> String;

    /// Returns `None` when the file does not contribute to a fingerprint at all.
    fn hash(&self, file: &RegularFileSnapshot) -> Result<Option<HashCode>, ResourceHashError>;
}

/// Uses the content hash recorded in the snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawContentHasher;

impl ResourceHasher for RawContentHasher {
    fn identifier(&self) -> String {
        "RAW".to_string()
    }

    fn hash(&self, file: &RegularFileSnapshot) -> Result<Option<HashCode>, ResourceHashError> {
        Ok(Some(file.content_hash()))
    }
}

/// Hashes class files, archives, and resources found on a classpath.
#[derive(Debug, Clone, Copy)]
pub struct ClasspathResourceHasher {
    normalization: ClasspathNormalization,
}

impl ClasspathResourceHasher {
    pub fn new(normalization: ClasspathNormalization) -> Self {
        Self { normalization }
    }

    fn hash_class(
        &self,
        path: &Path,
        entry: Option<&str>,
        bytes: &[u8],
    ) -> Result<Option<HashCode>, ResourceHashError> {
        match self.normalization.class_content {
            ClassContent::Bytes => Ok(Some(brisk_hash::hash_bytes(bytes))),
            ClassContent::Abi => brisk_classfile::abi_hash(bytes).map_err(|source| {
                ResourceHashError::ClassFile {
                    path: path.to_path_buf(),
                    entry: entry.map(str::to_string),
                    source,
                }
            }),
        }
    }

    fn hash_resource(&self, content_hash: impl FnOnce() -> HashCode) -> Option<HashCode> {
        match self.normalization.non_class_files {
            NonClassFiles::UseFileHash => Some(content_hash()),
            NonClassFiles::Ignore => None,
        }
    }

    fn hash_archive(&self, path: &Path) -> Result<HashCode, ResourceHashError> {
        let mut entries: Vec<(String, HashCode)> = Vec::new();
        Archive::new(path).for_each_entry(|entry: ArchiveEntry| {
            if entry.is_dir {
                return Ok::<_, ResourceHashError>(());
            }
            let hash = if is_class_file_name(&entry.name) {
                self.hash_class(path, Some(&entry.name), &entry.bytes)?
            } else {
                self.hash_resource(|| brisk_hash::hash_bytes(&entry.bytes))
            };
            if let Some(hash) = hash {
                entries.push((entry.name, hash));
            }
            Ok(())
        })?;

        if self.normalization.archive_entry_order == FingerprintHashingStrategy::Sort {
            entries.sort();
        }
        let mut hasher = Hasher::new();
        hasher.put_str("ARCHIVE");
        hasher.put_u64(entries.len() as u64);
        for (name, hash) in &entries {
            hasher.put_str(name);
            hasher.put_hash(hash);
        }
        Ok(hasher.finish())
    }
}

impl ResourceHasher for ClasspathResourceHasher {
    fn identifier(&self) -> String {
        self.normalization.identifier()
    }

    fn hash(&self, file: &RegularFileSnapshot) -> Result<Option<HashCode>, ResourceHashError> {
        let path = file.absolute_path();
        if is_class_file_name(file.name()) {
            let bytes = fs::read(path).map_err(|source| ResourceHashError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            return self.hash_class(path, None, &bytes);
        }
        if brisk_archive::has_archive_extension(path) {
            return self.hash_archive(path).map(Some);
        }
        Ok(self.hash_resource(|| file.content_hash()))
    }
}

fn is_class_file_name(name: &str) -> bool {
    name.ends_with(".class")
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ResourceKey {
    path: PathBuf,
    length: u64,
    last_modified: i64,
    hasher: String,
}

/// Bounded in-memory cache of normalized file hashes.
///
/// Entries are keyed by `(path, length, last modified, hasher identifier)`. A file whose length
/// and modification time are unchanged is assumed to be unchanged.
pub struct ResourceHashCache {
    entries: Mutex<LruCache<ResourceKey, Option<HashCode>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResourceHashCache {
    pub const DEFAULT_CAPACITY: usize = 100_000;

    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn key(file: &RegularFileSnapshot, hasher: &str) -> ResourceKey {
        ResourceKey {
            path: file.absolute_path().to_path_buf(),
            length: file.length(),
            last_modified: file.last_modified(),
            hasher: hasher.to_string(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl Default for ResourceHashCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl fmt::Debug for ResourceHashCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHashCache")
            .field("len", &self.len())
            .field("hits", &self.hits())
            .field("misses", &self.misses())
            .finish()
    }
}

/// Decorates a [`ResourceHasher`] with a [`ResourceHashCache`].
pub struct CachingResourceHasher<H> {
    inner: H,
    identifier: String,
    cache: Arc<ResourceHashCache>,
}

impl<H: ResourceHasher> CachingResourceHasher<H> {
    pub fn new(inner: H, cache: Arc<ResourceHashCache>) -> Self {
        let identifier = inner.identifier();
        Self {
            inner,
            identifier,
            cache,
        }
    }
}

impl<H: ResourceHasher> ResourceHasher for CachingResourceHasher<H> {
    fn identifier(&self) -> String {
        self.identifier.clone()
    }

    fn hash(&self, file: &RegularFileSnapshot) -> Result<Option<HashCode>, ResourceHashError> {
        let key = ResourceHashCache::key(file, &self.identifier);
        if let Some(cached) = self.cache.entries.lock().get(&key) {
            self.cache.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(*cached);
        }
        self.cache.misses.fetch_add(1, Ordering::Relaxed);

        // Computed outside the lock; concurrent misses for one file may both compute.
        let hash = self.inner.hash(file)?;
        self.cache.entries.lock().put(key, hash);
        Ok(hash)
    }
}

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use brisk_core::FileType;
use brisk_hash::{HashCode, Hasher};
use brisk_snapshot::{Snapshot, SnapshottingFilter};
use serde::{Deserialize, Serialize};

use crate::error::FingerprintingError;
use crate::hasher::{
    CachingResourceHasher, ClasspathResourceHasher, RawContentHasher, ResourceHashCache,
    ResourceHasher,
};
use crate::normalization::{DirectorySensitivity, FingerprintHashingStrategy, Normalization};

/// The policy a fingerprint is computed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintingStrategy {
    normalization: Normalization,
    directory_sensitivity: DirectorySensitivity,
    filter: Option<String>,
}

impl FingerprintingStrategy {
    pub fn new(normalization: Normalization, directory_sensitivity: DirectorySensitivity) -> Self {
        Self {
            normalization,
            directory_sensitivity,
            filter: None,
        }
    }

    /// Records that the fingerprinted trees were read through `filter`.
    pub fn with_filter(mut self, filter: &SnapshottingFilter) -> Self {
        self.filter = (!filter.is_empty()).then(|| filter.identifier());
        self
    }

    pub fn normalization(&self) -> Normalization {
        self.normalization
    }

    pub fn directory_sensitivity(&self) -> DirectorySensitivity {
        self.directory_sensitivity
    }

    pub fn hashing_strategy(&self) -> FingerprintHashingStrategy {
        self.normalization.hashing_strategy()
    }

    /// Identifier of fingerprints produced with `hasher`. Fingerprints are comparable only if
    /// their identifiers are equal.
    pub fn identifier(&self, hasher: &dyn ResourceHasher) -> String {
        let mut id = format!(
            "{}|{}|{}|{}",
            self.normalization.identifier(),
            self.directory_sensitivity.as_str(),
            self.hashing_strategy().as_str(),
            hasher.identifier()
        );
        if let Some(filter) = &self.filter {
            id.push_str("|filter:");
            id.push_str(filter);
        }
        id
    }

    fn includes(&self, file_type: FileType) -> bool {
        match (self.normalization, file_type) {
            (_, FileType::RegularFile) => true,
            (Normalization::IgnorePath | Normalization::Classpath(_), FileType::Missing) => false,
            (_, FileType::Missing) => true,
            (Normalization::IgnorePath, FileType::Directory) => false,
            (_, FileType::Directory) => {
                self.directory_sensitivity == DirectorySensitivity::Default
            }
        }
    }

    fn normalized_path(&self, snapshot: &Snapshot, relative: &str) -> String {
        match self.normalization {
            Normalization::AbsolutePath => snapshot.absolute_path().to_string_lossy().into_owned(),
            Normalization::IgnorePath => String::new(),
            Normalization::RelativePath | Normalization::Classpath(_) => {
                if relative.is_empty() {
                    root_key(snapshot)
                } else {
                    relative.to_string()
                }
            }
            Normalization::NameOnly => {
                if relative.is_empty() {
                    root_key(snapshot)
                } else {
                    snapshot.name().to_string()
                }
            }
        }
    }
}

/// A root directory has the empty key; a root file or missing root is keyed by its name.
fn root_key(snapshot: &Snapshot) -> String {
    match snapshot {
        Snapshot::Directory(_) => String::new(),
        other => other.name().to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintEntry {
    pub absolute_path: PathBuf,
    pub normalized_path: String,
    pub hash: HashCode,
    pub file_type: FileType,
}

/// Normalized, comparable signature of a collection of files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionFingerprint {
    strategy_identifier: String,
    hashing: FingerprintHashingStrategy,
    entries: Vec<FingerprintEntry>,
    combined_hash: HashCode,
}

impl CollectionFingerprint {
    pub fn new(
        strategy_identifier: String,
        hashing: FingerprintHashingStrategy,
        entries: Vec<FingerprintEntry>,
    ) -> Self {
        let combined_hash = combine(hashing, &entries);
        Self {
            strategy_identifier,
            hashing,
            entries,
            combined_hash,
        }
    }

    pub fn empty(strategy_identifier: String, hashing: FingerprintHashingStrategy) -> Self {
        Self::new(strategy_identifier, hashing, Vec::new())
    }

    pub fn strategy_identifier(&self) -> &str {
        &self.strategy_identifier
    }

    pub fn hashing_strategy(&self) -> FingerprintHashingStrategy {
        self.hashing
    }

    /// Entries in encounter order.
    pub fn entries(&self) -> &[FingerprintEntry] {
        &self.entries
    }

    pub fn combined_hash(&self) -> HashCode {
        self.combined_hash
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// The first entry with the given normalized key.
    pub fn get(&self, normalized_path: &str) -> Option<&FingerprintEntry> {
        self.entries
            .iter()
            .find(|entry| entry.normalized_path == normalized_path)
    }
}

/// Folds entries under `strategy`.
pub fn combine(strategy: FingerprintHashingStrategy, entries: &[FingerprintEntry]) -> HashCode {
    let mut pairs: Vec<(&str, &HashCode)> = entries
        .iter()
        .map(|entry| (entry.normalized_path.as_str(), &entry.hash))
        .collect();
    if strategy == FingerprintHashingStrategy::Sort {
        pairs.sort();
    }
    let mut hasher = Hasher::new();
    hasher.put_str(strategy.as_str());
    hasher.put_u64(pairs.len() as u64);
    for (path, hash) in pairs {
        hasher.put_str(path);
        hasher.put_hash(hash);
    }
    hasher.finish()
}

/// Turns snapshot trees into [`CollectionFingerprint`]s.
#[derive(Debug, Clone, Default)]
pub struct Fingerprinter {
    hash_cache: Arc<ResourceHashCache>,
}

impl Fingerprinter {
    pub fn new(hash_cache: Arc<ResourceHashCache>) -> Self {
        Self { hash_cache }
    }

    pub fn hash_cache(&self) -> &Arc<ResourceHashCache> {
        &self.hash_cache
    }

    /// Fingerprints `roots` in order. A path reachable from several roots is counted once.
    pub fn fingerprint(
        &self,
        property: &str,
        strategy: &FingerprintingStrategy,
        roots: &[Snapshot],
    ) -> Result<CollectionFingerprint, FingerprintingError> {
        match strategy.normalization() {
            Normalization::Classpath(classpath) => {
                let hasher = CachingResourceHasher::new(
                    ClasspathResourceHasher::new(classpath),
                    self.hash_cache.clone(),
                );
                self.fingerprint_with(property, strategy, roots, &hasher)
            }
            _ => self.fingerprint_with(property, strategy, roots, &RawContentHasher),
        }
    }

    /// Like [`Fingerprinter::fingerprint`] with an explicit per-file hasher.
    pub fn fingerprint_with(
        &self,
        property: &str,
        strategy: &FingerprintingStrategy,
        roots: &[Snapshot],
        hasher: &dyn ResourceHasher,
    ) -> Result<CollectionFingerprint, FingerprintingError> {
        let mut seen: HashSet<PathBuf> = HashSet::new();
        let mut entries = Vec::new();
        let mut failure: Option<FingerprintingError> = None;

        for root in roots {
            root.for_each(&mut |snapshot, relative| {
                if failure.is_some() || !strategy.includes(snapshot.file_type()) {
                    return;
                }
                if !seen.insert(snapshot.absolute_path().to_path_buf()) {
                    return;
                }
                let hash = match snapshot {
                    Snapshot::RegularFile(file) => match hasher.hash(file) {
                        Ok(Some(hash)) => hash,
                        Ok(None) => return,
                        Err(source) => {
                            failure = Some(FingerprintingError {
                                property: property.to_string(),
                                path: file.absolute_path().to_path_buf(),
                                source,
                            });
                            return;
                        }
                    },
                    other => other.hash(),
                };
                entries.push(FingerprintEntry {
                    absolute_path: snapshot.absolute_path().to_path_buf(),
                    normalized_path: strategy.normalized_path(snapshot, relative),
                    hash,
                    file_type: snapshot.file_type(),
                });
            });
            if let Some(err) = failure.take() {
                return Err(err);
            }
        }

        tracing::trace!(
            target = "brisk.fingerprint",
            property,
            roots = roots.len(),
            entries = entries.len(),
            "computed fingerprint"
        );
        Ok(CollectionFingerprint::new(
            strategy.identifier(hasher),
            strategy.hashing_strategy(),
            entries,
        ))
    }
}

/// Convenience for keys in tests and diagnostics.
pub fn normalized_keys(fingerprint: &CollectionFingerprint) -> Vec<&str> {
    fingerprint
        .entries()
        .iter()
        .map(|entry| entry.normalized_path.as_str())
        .collect()
}

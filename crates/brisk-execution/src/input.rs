use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use brisk_config::BriskConfig;
use brisk_fingerprint::{
    CollectionFingerprint, DirectorySensitivity, Fingerprinter, FingerprintingStrategy,
    Normalization, ResourceHashCache,
};
use brisk_hash::{HashCode, Hasher};
use brisk_snapshot::{DirectorySnapshotter, SnapshottingFilter};
use brisk_vfs::{FileSystemAccess, Vfs};

use crate::error::ExecutionError;
use crate::history::PersistedFingerprint;

/// A named set of input files and the policy they are compared under.
#[derive(Debug, Clone)]
pub struct InputProperty {
    name: String,
    roots: Vec<PathBuf>,
    normalization: Normalization,
    directory_sensitivity: DirectorySensitivity,
    filter: SnapshottingFilter,
}

impl InputProperty {
    pub fn new<I, P>(name: impl Into<String>, roots: I, normalization: Normalization) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            name: name.into(),
            roots: roots.into_iter().map(Into::into).collect(),
            normalization,
            directory_sensitivity: DirectorySensitivity::default(),
            filter: SnapshottingFilter::empty(),
        }
    }

    pub fn with_directory_sensitivity(mut self, sensitivity: DirectorySensitivity) -> Self {
        self.directory_sensitivity = sensitivity;
        self
    }

    pub fn with_filter(mut self, filter: SnapshottingFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    pub fn filter(&self) -> &SnapshottingFilter {
        &self.filter
    }

    pub fn strategy(&self) -> FingerprintingStrategy {
        FingerprintingStrategy::new(self.normalization, self.directory_sensitivity)
            .with_filter(&self.filter)
    }
}

/// Fingerprints of every input property of one unit of work, keyed by property name.
///
/// Failures are kept per property rather than dropped, so that a property that could not be
/// fingerprinted is never mistaken for an empty one.
#[derive(Debug, Default)]
pub struct CurrentInputs {
    results: BTreeMap<String, Result<CollectionFingerprint, ExecutionError>>,
}

impl CurrentInputs {
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.results.keys().map(String::as_str)
    }

    pub fn get(&self, property: &str) -> Option<&Result<CollectionFingerprint, ExecutionError>> {
        self.results.get(property)
    }

    pub fn fingerprint(&self, property: &str) -> Option<&CollectionFingerprint> {
        self.results.get(property).and_then(|result| result.as_ref().ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &ExecutionError)> {
        self.results.iter().filter_map(|(name, result)| match result {
            Ok(_) => None,
            Err(err) => Some((name.as_str(), err)),
        })
    }

    pub fn has_failures(&self) -> bool {
        self.failures().next().is_some()
    }

    /// All fingerprints, or the first failure in property order.
    pub fn into_fingerprints(self) -> Result<BTreeMap<String, CollectionFingerprint>, ExecutionError> {
        self.results
            .into_iter()
            .map(|(name, result)| result.map(|fingerprint| (name, fingerprint)))
            .collect()
    }

    /// The form recorded in the execution history: failures become placeholders.
    pub fn to_persisted(&self) -> BTreeMap<String, PersistedFingerprint> {
        self.results
            .iter()
            .map(|(name, result)| (name.clone(), PersistedFingerprint::from_result(result)))
            .collect()
    }

    /// Build cache key derived from the unit of work's identity and its input fingerprints.
    ///
    /// `None` when any property failed to fingerprint.
    pub fn cache_key(&self, identity: &str) -> Option<HashCode> {
        let mut hasher = Hasher::new();
        hasher.put_str(identity);
        hasher.put_u64(self.results.len() as u64);
        for (name, result) in &self.results {
            let fingerprint = result.as_ref().ok()?;
            hasher.put_str(name);
            hasher.put_str(fingerprint.strategy_identifier());
            hasher.put_hash(&fingerprint.combined_hash());
        }
        Some(hasher.finish())
    }

    pub(crate) fn insert(
        &mut self,
        property: String,
        result: Result<CollectionFingerprint, ExecutionError>,
    ) {
        self.results.insert(property, result);
    }
}

/// Snapshots input roots through the VFS and fingerprints them.
#[derive(Debug, Clone)]
pub struct InputFingerprinter {
    access: FileSystemAccess,
    fingerprinter: Fingerprinter,
}

impl InputFingerprinter {
    pub fn new(access: FileSystemAccess, fingerprinter: Fingerprinter) -> Self {
        Self {
            access,
            fingerprinter,
        }
    }

    /// Builds a fingerprinter over a fresh VFS, with the configured default excludes and
    /// resource hash cache capacity.
    pub fn from_config(config: &BriskConfig) -> Self {
        let snapshotter = DirectorySnapshotter::new(config.snapshot.excludes());
        let hash_cache = ResourceHashCache::new(config.cache.resource_hash_cache_capacity);
        Self::new(
            FileSystemAccess::new(Arc::new(Vfs::new()), snapshotter),
            Fingerprinter::new(Arc::new(hash_cache)),
        )
    }

    pub fn access(&self) -> &FileSystemAccess {
        &self.access
    }

    pub fn fingerprinter(&self) -> &Fingerprinter {
        &self.fingerprinter
    }

    pub fn fingerprint(
        &self,
        property: &InputProperty,
    ) -> Result<CollectionFingerprint, ExecutionError> {
        let mut snapshots = Vec::with_capacity(property.roots.len());
        for root in &property.roots {
            let snapshot =
                self.access
                    .read(root, &property.filter)
                    .map_err(|source| ExecutionError::Snapshot {
                        property: property.name.clone(),
                        root: root.clone(),
                        source,
                    })?;
            snapshots.push(snapshot);
        }
        Ok(self
            .fingerprinter
            .fingerprint(&property.name, &property.strategy(), &snapshots)?)
    }

    /// Fingerprints every property, keeping per-property failures.
    ///
    /// Fails only when two properties share a name.
    pub fn fingerprint_all(
        &self,
        properties: &[InputProperty],
    ) -> Result<CurrentInputs, ExecutionError> {
        let mut names = HashSet::new();
        if let Some(duplicate) = properties.iter().find(|p| !names.insert(p.name.as_str())) {
            return Err(ExecutionError::DuplicateProperty(duplicate.name.clone()));
        }

        let mut inputs = CurrentInputs::default();
        for property in properties {
            let result = self.fingerprint(property);
            if let Err(err) = &result {
                tracing::debug!(
                    target = "brisk.execution",
                    property = %property.name,
                    error = %err,
                    "failed to fingerprint input property"
                );
            }
            inputs.insert(property.name.clone(), result);
        }
        Ok(inputs)
    }
}

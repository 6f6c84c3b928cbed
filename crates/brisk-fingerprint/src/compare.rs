use std::collections::HashMap;
use std::ops::ControlFlow;
use std::path::Path;

use crate::error::IncompatibleFingerprints;
use crate::fingerprint::{CollectionFingerprint, FingerprintEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Added,
    Removed,
    Modified,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Added => "added",
            ChangeKind::Removed => "removed",
            ChangeKind::Modified => "modified",
        }
    }
}

/// One differing entry between two fingerprints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub kind: ChangeKind,
    pub normalized_path: String,
    pub previous: Option<FingerprintEntry>,
    pub current: Option<FingerprintEntry>,
}

impl Change {
    /// The current location of the file, or its previous one if it was removed.
    pub fn absolute_path(&self) -> &Path {
        match (&self.current, &self.previous) {
            (Some(entry), _) | (None, Some(entry)) => &entry.absolute_path,
            (None, None) => Path::new(""),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FingerprintComparison {
    pub added: Vec<Change>,
    pub removed: Vec<Change>,
    pub modified: Vec<Change>,
    up_to_date: bool,
}

impl FingerprintComparison {
    /// True iff nothing changed and both fingerprints combine to the same hash.
    ///
    /// Under an order-sensitive hashing strategy a reordering is out of date even though no
    /// entry changed.
    pub fn is_up_to_date(&self) -> bool {
        self.up_to_date
    }

    pub fn has_changes(&self) -> bool {
        !(self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty())
    }

    pub fn change_count(&self) -> usize {
        self.added.len() + self.removed.len() + self.modified.len()
    }

    /// Visits removed, then modified, then added changes until `visitor` breaks.
    pub fn visit<B>(&self, mut visitor: impl FnMut(&Change) -> ControlFlow<B>) -> ControlFlow<B> {
        for change in self
            .removed
            .iter()
            .chain(&self.modified)
            .chain(&self.added)
        {
            visitor(change)?;
        }
        ControlFlow::Continue(())
    }
}

#[derive(Default)]
struct Group<'a> {
    previous: Vec<&'a FingerprintEntry>,
    current: Vec<&'a FingerprintEntry>,
}

/// Diffs `current` against `previous`.
///
/// Entries are matched by normalized path. When several entries share a path, entries with equal
/// hashes are matched first and the rest are paired in encounter order; what remains is added or
/// removed.
pub fn compare(
    previous: &CollectionFingerprint,
    current: &CollectionFingerprint,
) -> Result<FingerprintComparison, IncompatibleFingerprints> {
    if previous.strategy_identifier() != current.strategy_identifier() {
        return Err(IncompatibleFingerprints {
            previous: previous.strategy_identifier().to_string(),
            current: current.strategy_identifier().to_string(),
        });
    }

    let mut order: Vec<&str> = Vec::new();
    let mut groups: HashMap<&str, Group<'_>> = HashMap::new();
    for (entries, is_current) in [(previous.entries(), false), (current.entries(), true)] {
        for entry in entries {
            let key = entry.normalized_path.as_str();
            let group = groups.entry(key).or_insert_with(|| {
                order.push(key);
                Group::default()
            });
            if is_current {
                group.current.push(entry);
            } else {
                group.previous.push(entry);
            }
        }
    }

    let mut comparison = FingerprintComparison::default();
    for key in order {
        let Some(group) = groups.remove(key) else {
            continue;
        };
        diff_group(key, group, &mut comparison);
    }

    comparison.up_to_date = !comparison.has_changes()
        && previous.combined_hash() == current.combined_hash();
    tracing::trace!(
        target = "brisk.fingerprint",
        added = comparison.added.len(),
        removed = comparison.removed.len(),
        modified = comparison.modified.len(),
        up_to_date = comparison.up_to_date,
        "compared fingerprints"
    );
    Ok(comparison)
}

fn diff_group(key: &str, group: Group<'_>, comparison: &mut FingerprintComparison) {
    let Group {
        mut previous,
        current,
    } = group;

    let mut unmatched_current = Vec::new();
    for entry in current {
        match previous.iter().position(|old| old.hash == entry.hash) {
            Some(index) => {
                previous.remove(index);
            }
            None => unmatched_current.push(entry),
        }
    }

    let mut previous = previous.into_iter();
    for entry in unmatched_current {
        let change = |kind, previous: Option<&FingerprintEntry>| Change {
            kind,
            normalized_path: key.to_string(),
            previous: previous.cloned(),
            current: Some(entry.clone()),
        };
        match previous.next() {
            Some(old) => comparison
                .modified
                .push(change(ChangeKind::Modified, Some(old))),
            None => comparison.added.push(change(ChangeKind::Added, None)),
        }
    }
    for old in previous {
        comparison.removed.push(Change {
            kind: ChangeKind::Removed,
            normalized_path: key.to_string(),
            previous: Some(old.clone()),
            current: None,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalization::FingerprintHashingStrategy;
    use brisk_core::FileType;
    use std::path::PathBuf;

    fn entry(path: &str, key: &str, content: &str) -> FingerprintEntry {
        FingerprintEntry {
            absolute_path: PathBuf::from(path),
            normalized_path: key.to_string(),
            hash: brisk_hash::hash_bytes(content),
            file_type: FileType::RegularFile,
        }
    }

    fn fingerprint(entries: Vec<FingerprintEntry>) -> CollectionFingerprint {
        CollectionFingerprint::new("NAME_ONLY".into(), FingerprintHashingStrategy::Sort, entries)
    }

    #[test]
    fn shared_keys_match_equal_hashes_first() {
        let previous = fingerprint(vec![
            entry("/a/x.txt", "x.txt", "one"),
            entry("/b/x.txt", "x.txt", "two"),
        ]);
        let current = fingerprint(vec![
            entry("/b/x.txt", "x.txt", "two"),
            entry("/c/x.txt", "x.txt", "three"),
            entry("/d/x.txt", "x.txt", "four"),
        ]);

        let comparison = compare(&previous, &current).unwrap();
        assert_eq!(comparison.modified.len(), 1);
        let modified = &comparison.modified[0];
        assert_eq!(
            modified.previous.as_ref().map(|e| e.absolute_path.clone()),
            Some(PathBuf::from("/a/x.txt"))
        );
        assert_eq!(modified.absolute_path(), Path::new("/c/x.txt"));
        assert_eq!(comparison.added.len(), 1);
        assert_eq!(comparison.added[0].absolute_path(), Path::new("/d/x.txt"));
        assert!(comparison.removed.is_empty());
    }

    #[test]
    fn visiting_stops_when_the_visitor_breaks() {
        let previous = fingerprint(vec![entry("/a", "a", "1"), entry("/b", "b", "1")]);
        let current = fingerprint(vec![entry("/c", "c", "1")]);
        let comparison = compare(&previous, &current).unwrap();
        assert_eq!(comparison.change_count(), 3);

        let mut seen = Vec::new();
        let flow = comparison.visit(|change| {
            seen.push(change.kind);
            if seen.len() == 2 {
                ControlFlow::Break(change.normalized_path.clone())
            } else {
                ControlFlow::Continue(())
            }
        });
        assert_eq!(flow, ControlFlow::Break("b".to_string()));
        assert_eq!(seen, [ChangeKind::Removed, ChangeKind::Removed]);
    }
}

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use brisk_cache::{CacheOptions, FileLockManager, LockManagerOptions, LockMode, PersistentCache};
use brisk_execution::{
    ExecutionError, ExecutionHistoryStore, IncrementalExecution, InputFingerprinter,
    InputProperty, PersistedFingerprint, PropertyOutcome, MAX_CHANGE_MESSAGES,
};
use brisk_config::BriskConfig;
use brisk_fingerprint::{normalized_keys, ClasspathNormalization, Fingerprinter, Normalization};
use brisk_snapshot::DirectorySnapshotter;
use brisk_vfs::{FileSystemAccess, Vfs};
use tempfile::TempDir;

struct Fixture {
    tmp: TempDir,
    sources: PathBuf,
    cache_dir: PathBuf,
    manager: Arc<FileLockManager>,
    access: FileSystemAccess,
}

impl Fixture {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let sources = tmp.path().join("src");
        fs::create_dir_all(&sources).unwrap();
        fs::write(sources.join("a.txt"), "a").unwrap();
        fs::write(sources.join("b.txt"), "b").unwrap();
        Self {
            cache_dir: tmp.path().join("cache"),
            sources,
            tmp: tmp,
            manager: Arc::new(FileLockManager::new(LockManagerOptions::default())),
            access: FileSystemAccess::new(Arc::new(Vfs::new()), DirectorySnapshotter::default()),
        }
    }

    fn execution(&self) -> (PersistentCache, IncrementalExecution) {
        let cache = PersistentCache::open(
            &self.cache_dir,
            CacheOptions::new("execution history", LockMode::Exclusive),
            self.manager.clone(),
        )
        .unwrap();
        let history = ExecutionHistoryStore::new(&cache).unwrap();
        let fingerprinter = InputFingerprinter::new(self.access.clone(), Fingerprinter::default());
        (cache, IncrementalExecution::new(fingerprinter, history))
    }

    fn sources(&self) -> InputProperty {
        InputProperty::new("sources", [&self.sources], Normalization::RelativePath)
    }

    fn write(&self, path: &Path, contents: &str) {
        self.access
            .write(&[path], || fs::write(path, contents))
            .unwrap();
    }
}

#[test]
fn unchanged_inputs_are_up_to_date_after_a_successful_run() {
    let fixture = Fixture::new();
    let (_cache, execution) = fixture.execution();
    let properties = [fixture.sources()];

    let first = execution.check(":compile", &properties).unwrap();
    assert!(!first.verdict().is_up_to_date());
    assert_eq!(first.verdict().reasons(), ["No history is available."]);
    assert!(!first.verdict().is_incremental());
    execution.record(&first, true, Some("build-1")).unwrap();

    let second = execution.check(":compile", &properties).unwrap();
    assert!(second.verdict().is_up_to_date(), "{:?}", second.verdict().reasons());
    assert!(second.verdict().is_incremental());
    assert_eq!(
        second.verdict().outcome("sources"),
        Some(&PropertyOutcome::UpToDate)
    );
    assert_eq!(second.cache_key(), first.cache_key());
    assert_eq!(
        second.previous().unwrap().build_invocation_id.as_deref(),
        Some("build-1")
    );
}

#[test]
fn modified_files_are_reported_as_changes() {
    let fixture = Fixture::new();
    let (_cache, execution) = fixture.execution();
    let properties = [fixture.sources()];
    let first = execution.check(":compile", &properties).unwrap();
    execution.record(&first, true, None).unwrap();

    fixture.write(&fixture.sources.join("a.txt"), "changed");
    let state = execution.check(":compile", &properties).unwrap();
    let verdict = state.verdict();
    assert!(!verdict.is_up_to_date());
    assert!(verdict.is_incremental());

    let changes = verdict.changes("sources").unwrap();
    assert!(changes.added.is_empty());
    assert!(changes.removed.is_empty());
    assert_eq!(changes.modified.len(), 1);
    assert_eq!(changes.modified[0].normalized_path, "a.txt");
    assert_eq!(verdict.reasons().len(), 1);
    assert!(verdict.reasons()[0].contains("has been modified"), "{:?}", verdict.reasons());
    assert_ne!(state.cache_key(), first.cache_key());
}

#[test]
fn failed_executions_are_never_up_to_date() {
    let fixture = Fixture::new();
    let (_cache, execution) = fixture.execution();
    let properties = [fixture.sources()];
    let first = execution.check(":test", &properties).unwrap();
    execution.record(&first, false, None).unwrap();

    let second = execution.check(":test", &properties).unwrap();
    assert!(!second.verdict().is_up_to_date());
    assert_eq!(second.verdict().reasons(), ["The previous execution failed."]);
    assert!(!second.verdict().is_incremental());
}

#[test]
fn added_and_removed_properties_are_out_of_date() {
    let fixture = Fixture::new();
    let (_cache, execution) = fixture.execution();
    let resources = fixture.tmp.path().join("resources");
    fs::create_dir_all(&resources).unwrap();

    let first = execution.check(":jar", &[fixture.sources()]).unwrap();
    execution.record(&first, true, None).unwrap();

    let resources = InputProperty::new("resources", [&resources], Normalization::RelativePath);
    let added = execution.check(":jar", &[fixture.sources(), resources.clone()]).unwrap();
    assert_eq!(added.verdict().outcome("resources"), Some(&PropertyOutcome::Added));
    assert_eq!(
        added.verdict().reasons(),
        ["Input property 'resources' has been added."]
    );
    execution.record(&added, true, None).unwrap();

    let removed = execution.check(":jar", &[resources]).unwrap();
    assert_eq!(removed.verdict().outcome("sources"), Some(&PropertyOutcome::Removed));
    assert!(!removed.verdict().is_incremental());
}

#[test]
fn fingerprinting_failures_are_kept_and_recorded() {
    let fixture = Fixture::new();
    let (_cache, execution) = fixture.execution();
    let classes = fixture.tmp.path().join("classes");
    fs::create_dir_all(&classes).unwrap();
    let broken = classes.join("Broken.class");
    fs::write(&broken, b"not a class file").unwrap();
    let properties = [InputProperty::new(
        "classpath",
        [&classes],
        Normalization::Classpath(ClasspathNormalization::compile()),
    )];

    let state = execution.check(":compile", &properties).unwrap();
    let failures: Vec<_> = state.inputs().failures().map(|(name, _)| name).collect();
    assert_eq!(failures, ["classpath"]);
    assert!(matches!(
        state.verdict().outcome("classpath"),
        Some(PropertyOutcome::Failed(_))
    ));
    assert_eq!(state.cache_key(), None);

    let record = execution.record(&state, false, None).unwrap();
    assert!(matches!(
        record.inputs.get("classpath"),
        Some(PersistedFingerprint::Failed { .. })
    ));

    fixture
        .access
        .write(&[broken.as_path()], || fs::remove_file(&broken))
        .unwrap();
    let fixed = execution.check(":compile", &properties).unwrap();
    assert!(!fixed.inputs().has_failures());
    assert_eq!(
        fixed.verdict().outcome("classpath"),
        Some(&PropertyOutcome::PreviouslyFailed)
    );
    assert!(!fixed.verdict().is_up_to_date());

    let err = state_inputs_error(&execution, &properties);
    assert_eq!(err, None);
}

/// The error of the first failing property when the fingerprints are taken strictly.
fn state_inputs_error(
    execution: &IncrementalExecution,
    properties: &[InputProperty],
) -> Option<String> {
    execution
        .fingerprinter()
        .fingerprint_all(properties)
        .unwrap()
        .into_fingerprints()
        .err()
        .and_then(|err| err.property().map(str::to_string))
}

#[test]
fn strict_fingerprints_carry_the_failing_property() {
    let fixture = Fixture::new();
    let (_cache, execution) = fixture.execution();
    let classes = fixture.tmp.path().join("classes");
    fs::create_dir_all(&classes).unwrap();
    fs::write(classes.join("Broken.class"), b"\xCA\xFE").unwrap();
    let properties = [
        fixture.sources(),
        InputProperty::new(
            "classpath",
            [&classes],
            Normalization::Classpath(ClasspathNormalization::compile()),
        ),
    ];

    let err = execution
        .fingerprinter()
        .fingerprint_all(&properties)
        .unwrap()
        .into_fingerprints()
        .unwrap_err();
    assert_eq!(err.property(), Some("classpath"));
    assert!(matches!(err, ExecutionError::Fingerprinting(_)));
    assert!(err.to_string().contains("Broken.class"), "{err}");
}

#[test]
fn duplicate_property_names_are_rejected() {
    let fixture = Fixture::new();
    let (_cache, execution) = fixture.execution();
    let err = execution
        .check(":compile", &[fixture.sources(), fixture.sources()])
        .unwrap_err();
    assert!(matches!(err, ExecutionError::DuplicateProperty(name) if name == "sources"));
}

#[test]
fn history_survives_reopening_the_cache() {
    let fixture = Fixture::new();
    let properties = [fixture.sources()];
    {
        let (_cache, execution) = fixture.execution();
        let state = execution.check(":compile", &properties).unwrap();
        execution.record(&state, true, None).unwrap();
    }

    let (_cache, execution) = fixture.execution();
    let state = execution.check(":compile", &properties).unwrap();
    assert!(state.verdict().is_up_to_date(), "{:?}", state.verdict().reasons());

    execution.history().remove(":compile").unwrap();
    let state = execution.check(":compile", &properties).unwrap();
    assert_eq!(state.verdict().reasons(), ["No history is available."]);
}

#[test]
fn change_messages_are_capped_per_property() {
    let fixture = Fixture::new();
    let (_cache, execution) = fixture.execution();
    let properties = [fixture.sources()];
    let first = execution.check(":compile", &properties).unwrap();
    execution.record(&first, true, None).unwrap();

    for i in 0..5 {
        fixture.write(&fixture.sources.join(format!("new{i}.txt")), "new");
    }
    let state = execution.check(":compile", &properties).unwrap();
    let reasons = state.verdict().reasons();
    assert_eq!(reasons.len(), MAX_CHANGE_MESSAGES + 1, "{reasons:?}");
    assert_eq!(
        reasons.last().unwrap(),
        "Input property 'sources' has 2 more changes."
    );
    assert_eq!(state.verdict().changes("sources").unwrap().added.len(), 5);
}

#[test]
fn fingerprinters_follow_the_configuration() {
    let fixture = Fixture::new();
    fs::write(fixture.sources.join("old.bak"), "backup").unwrap();
    let config = BriskConfig::load_from_str(
        "[cache]\nresource_hash_cache_capacity = 3\n\n[snapshot]\ndefault_excludes = [\"**/*.bak\"]\n",
    )
    .unwrap();

    let fingerprinter = InputFingerprinter::from_config(&config);
    assert_eq!(fingerprinter.fingerprinter().hash_cache().capacity(), 3);
    let fingerprint = fingerprinter.fingerprint(&fixture.sources()).unwrap();
    assert_eq!(normalized_keys(&fingerprint), ["", "a.txt", "b.txt"]);
}

use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use brisk_cache::{
    BuildCache, CacheError, CacheOptions, ContentionHandler, FileLockManager, LockManagerOptions,
    LockMode, LockStateFormat, OriginMetadata, PersistentCache,
};
use brisk_hash::{hash_bytes, HashCode};
use tempfile::TempDir;

fn manager() -> Arc<FileLockManager> {
    Arc::new(FileLockManager::with_contention_handler(
        LockManagerOptions {
            lock_timeout: Duration::from_secs(10),
            ping_delay: Duration::from_millis(10),
        },
        Arc::new(ContentionHandler::new()),
    ))
}

fn open(dir: &Path, mode: LockMode, manager: &Arc<FileLockManager>) -> PersistentCache {
    PersistentCache::open(dir, CacheOptions::new("test cache", mode), manager.clone()).unwrap()
}

fn cache_dir(tmp: &TempDir) -> PathBuf {
    tmp.path().join("cache")
}

#[test]
fn entries_survive_reopening() {
    let tmp = TempDir::new().unwrap();
    let dir = cache_dir(&tmp);
    let manager = manager();
    {
        let cache = open(&dir, LockMode::Exclusive, &manager);
        let counts = cache.indexed_cache::<String, u64>("counts").unwrap();
        counts.put(&"a".to_string(), 1).unwrap();
        counts.put(&"b".to_string(), 2).unwrap();
        counts.remove(&"b".to_string()).unwrap();
        assert_eq!(counts.get(&"a".to_string()).unwrap(), Some(1));
    }

    let cache = open(&dir, LockMode::Exclusive, &manager);
    let counts = cache.indexed_cache::<String, u64>("counts").unwrap();
    assert_eq!(counts.get(&"a".to_string()).unwrap(), Some(1));
    assert_eq!(counts.get(&"b".to_string()).unwrap(), None);
    assert_eq!(counts.get(&"c".to_string()).unwrap(), None);
}

#[test]
fn crashed_caches_are_rebuilt() {
    let tmp = TempDir::new().unwrap();
    let dir = cache_dir(&tmp);
    let manager = manager();
    {
        let cache = open(&dir, LockMode::Exclusive, &manager);
        let counts = cache.indexed_cache::<String, u64>("counts").unwrap();
        counts.put(&"a".to_string(), 1).unwrap();
    }

    // Reset the sequence number to the in-progress marker, as a crash mid-write leaves it.
    let lock_file = dir.join("cache.lock");
    let mut state = fs::read(&lock_file).unwrap();
    assert_eq!(state.len(), 17);
    state[9..].copy_from_slice(&0_i64.to_be_bytes());
    fs::write(&lock_file, state).unwrap();

    let cache = open(&dir, LockMode::Exclusive, &manager);
    assert!(!cache.lock_state().unwrap().is_dirty());
    assert!(!dir.join("counts").exists());
    let counts = cache.indexed_cache::<String, u64>("counts").unwrap();
    assert_eq!(counts.get(&"a".to_string()).unwrap(), None);
}

#[test]
fn shared_caches_read_but_never_write() {
    let tmp = TempDir::new().unwrap();
    let dir = cache_dir(&tmp);
    {
        let cache = open(&dir, LockMode::Exclusive, &manager());
        let names = cache.indexed_cache::<u32, String>("names").unwrap();
        names.put(&1, "one".to_string()).unwrap();
    }

    let first = open(&dir, LockMode::Shared, &manager());
    let second = open(&dir, LockMode::Shared, &manager());
    for cache in [&first, &second] {
        let names = cache.indexed_cache::<u32, String>("names").unwrap();
        assert_eq!(names.get(&1).unwrap().as_deref(), Some("one"));
    }
    let names = first.indexed_cache::<u32, String>("names").unwrap();
    assert!(matches!(
        names.put(&2, "two".to_string()),
        Err(CacheError::InsufficientLockMode { .. })
    ));
}

#[test]
fn shared_openers_treat_unwritten_caches_as_empty() {
    let tmp = TempDir::new().unwrap();
    let dir = cache_dir(&tmp);
    let cache = open(&dir, LockMode::Shared, &manager());
    let names = cache.indexed_cache::<u32, String>("names").unwrap();
    assert_eq!(names.get(&1).unwrap(), None);
}

#[test]
fn indexed_caches_are_typed_by_name() {
    let tmp = TempDir::new().unwrap();
    let cache = open(&cache_dir(&tmp), LockMode::Exclusive, &manager());
    let first = cache.indexed_cache::<String, u64>("counts").unwrap();
    first.put(&"a".to_string(), 3).unwrap();

    let again = cache.indexed_cache::<String, u64>("counts").unwrap();
    assert_eq!(again.get(&"a".to_string()).unwrap(), Some(3));
    assert!(matches!(
        cache.indexed_cache::<String, String>("counts"),
        Err(CacheError::IncompatibleIndexedCache { .. })
    ));
    assert!(matches!(
        cache.indexed_cache::<String, u64>("../outside"),
        Err(CacheError::InvalidCacheName { .. })
    ));
}

#[test]
fn corrupt_entries_are_misses() {
    let tmp = TempDir::new().unwrap();
    let dir = cache_dir(&tmp);
    let cache = open(&dir, LockMode::Exclusive, &manager());
    let counts = cache.indexed_cache::<String, u64>("counts").unwrap();
    counts.put(&"a".to_string(), 1).unwrap();

    let entry = fs::read_dir(dir.join("counts"))
        .unwrap()
        .next()
        .unwrap()
        .unwrap()
        .path();
    fs::write(&entry, b"garbage").unwrap();
    drop(counts);
    drop(cache);

    let cache = open(&dir, LockMode::Exclusive, &manager());
    let counts = cache.indexed_cache::<String, u64>("counts").unwrap();
    assert_eq!(counts.get(&"a".to_string()).unwrap(), None);
    assert!(!entry.exists());
}

#[test]
fn closed_caches_refuse_use() {
    let tmp = TempDir::new().unwrap();
    let cache = open(&cache_dir(&tmp), LockMode::Exclusive, &manager());
    let counts = cache.indexed_cache::<String, u64>("counts").unwrap();
    cache.close();
    assert!(!cache.holds_file_lock());
    assert!(matches!(
        counts.get(&"a".to_string()),
        Err(CacheError::LockProtocolViolation(_))
    ));
}

#[test]
fn on_demand_needs_the_sequenced_lock_format() {
    let tmp = TempDir::new().unwrap();
    let err = PersistentCache::open(
        cache_dir(&tmp),
        CacheOptions::new("legacy", LockMode::OnDemand).with_format(LockStateFormat::DirtyFlag),
        manager(),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        CacheError::UnsupportedLockStateOperation { .. }
    ));
}

#[test]
fn idle_on_demand_caches_hand_over_and_notice_foreign_writes() {
    let tmp = TempDir::new().unwrap();
    let dir = cache_dir(&tmp);
    let ours = open(&dir, LockMode::OnDemand, &manager());
    let theirs = open(&dir, LockMode::OnDemand, &manager());
    assert!(!ours.holds_file_lock());

    let our_counts = ours.indexed_cache::<String, u64>("counts").unwrap();
    our_counts.put(&"k".to_string(), 1).unwrap();
    assert!(ours.holds_file_lock());

    let their_counts = theirs.indexed_cache::<String, u64>("counts").unwrap();
    assert_eq!(their_counts.get(&"k".to_string()).unwrap(), Some(1));
    assert!(theirs.holds_file_lock());
    assert!(!ours.holds_file_lock());
    their_counts.put(&"k".to_string(), 2).unwrap();

    // Our in-memory copy still says 1; taking the lock back must discard it.
    assert_eq!(our_counts.get(&"k".to_string()).unwrap(), Some(2));
    assert!(ours.holds_file_lock());
}

#[test]
fn busy_on_demand_caches_release_after_the_current_use() {
    let tmp = TempDir::new().unwrap();
    let dir = cache_dir(&tmp);
    let ours = open(&dir, LockMode::OnDemand, &manager());
    let our_counts = ours.indexed_cache::<String, u64>("counts").unwrap();
    our_counts.put(&"k".to_string(), 7).unwrap();

    let (tx, rx) = mpsc::channel();
    let contender_dir = dir.clone();
    let contender = ours
        .use_cache(|| {
            let contender = thread::spawn(move || {
                let theirs = open(&contender_dir, LockMode::OnDemand, &manager());
                let counts = theirs.indexed_cache::<String, u64>("counts").unwrap();
                let value = counts.get(&"k".to_string()).unwrap();
                tx.send(()).unwrap();
                value
            });
            thread::sleep(Duration::from_millis(300));
            assert!(rx.try_recv().is_err(), "lock was taken while in use");
            assert!(ours.holds_file_lock());
            Ok(contender)
        })
        .unwrap();

    assert_eq!(contender.join().unwrap(), Some(7));
    assert!(!ours.holds_file_lock());
}

#[test]
fn use_cache_is_reentrant() {
    let tmp = TempDir::new().unwrap();
    let cache = open(&cache_dir(&tmp), LockMode::Exclusive, &manager());
    let counts = cache.indexed_cache::<String, u64>("counts").unwrap();
    let value = cache
        .use_cache(|| {
            assert!(cache.operations().is_in_cache_action());
            counts.put(&"a".to_string(), 5)?;
            cache.use_cache(|| counts.get(&"a".to_string()))
        })
        .unwrap();
    assert_eq!(value, Some(5));
    assert!(!cache.operations().is_in_cache_action());
    assert_eq!(cache.operations().depth(), 0);
}

#[test]
fn long_running_operations_let_other_threads_in() {
    let tmp = TempDir::new().unwrap();
    let cache = open(&cache_dir(&tmp), LockMode::Exclusive, &manager());
    let (started_tx, started_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel();

    let other = {
        let cache = cache.clone();
        thread::spawn(move || {
            started_rx.recv().unwrap();
            let counts = cache.indexed_cache::<String, u64>("counts").unwrap();
            counts.put(&"other".to_string(), 1).unwrap();
            done_tx.send(()).unwrap();
        })
    };

    let other_finished = cache
        .use_cache(|| {
            cache.long_running_operation(|| {
                assert!(!cache.operations().is_in_cache_action());
                started_tx.send(()).unwrap();
                done_rx.recv_timeout(Duration::from_secs(5)).is_ok()
            })
        })
        .unwrap();
    assert!(other_finished);
    other.join().unwrap();

    let counts = cache.indexed_cache::<String, u64>("counts").unwrap();
    assert_eq!(counts.get(&"other".to_string()).unwrap(), Some(1));
}

#[test]
fn reentrant_long_running_operations_wait_for_cache_actions() {
    let tmp = TempDir::new().unwrap();
    let cache = open(&cache_dir(&tmp), LockMode::Exclusive, &manager());
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let holder = {
        let cache = cache.clone();
        thread::spawn(move || {
            cache
                .use_cache(|| {
                    entered_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                    Ok(())
                })
                .unwrap();
        })
    };
    entered_rx.recv().unwrap();

    let waiter = {
        let cache = cache.clone();
        thread::spawn(move || {
            cache
                .maybe_reentrant_long_running_operation(|| cache.operations().any_thread_in_cache_action())
                .unwrap()
        })
    };
    thread::sleep(Duration::from_millis(100));
    assert!(!waiter.is_finished());
    release_tx.send(()).unwrap();

    assert!(!waiter.join().unwrap());
    holder.join().unwrap();

    // Inside a cache action it delegates to a plain long-running operation.
    let nested = cache
        .use_cache(|| {
            cache.maybe_reentrant_long_running_operation(|| cache.operations().is_in_cache_action())
        })
        .unwrap();
    assert!(!nested);
}

#[test]
fn panicking_actions_give_the_cache_back() {
    let tmp = TempDir::new().unwrap();
    let cache = open(&cache_dir(&tmp), LockMode::Exclusive, &manager());

    let panicked = {
        let cache = cache.clone();
        thread::spawn(move || {
            cache
                .use_cache(|| -> Result<(), CacheError> { panic!("action failed") })
                .ok();
        })
        .join()
    };
    assert!(panicked.is_err());

    let counts = cache.indexed_cache::<String, u64>("counts").unwrap();
    counts.put(&"after".to_string(), 2).unwrap();
    assert_eq!(counts.get(&"after".to_string()).unwrap(), Some(2));
    assert_eq!(cache.operations().depth(), 0);
}

#[test]
fn panicking_long_running_operations_restore_the_enclosing_action() {
    let tmp = TempDir::new().unwrap();
    let cache = open(&cache_dir(&tmp), LockMode::Exclusive, &manager());

    let caught = panic::catch_unwind(AssertUnwindSafe(|| {
        cache.use_cache(|| {
            cache.long_running_operation(|| panic!("operation failed"))?;
            Ok(())
        })
    }));
    assert!(caught.is_err());
    assert_eq!(cache.operations().depth(), 0);

    let caught = panic::catch_unwind(AssertUnwindSafe(|| {
        cache.maybe_reentrant_long_running_operation(|| panic!("operation failed"))
    }));
    assert!(caught.is_err());
    assert_eq!(cache.operations().depth(), 0);

    let other = {
        let cache = cache.clone();
        thread::spawn(move || cache.use_cache(|| Ok(cache.operations().is_in_cache_action())))
    };
    assert!(other.join().unwrap().unwrap());
}

fn key(text: &str) -> HashCode {
    hash_bytes(text.as_bytes())
}

#[test]
fn build_cache_entries_round_trip_with_their_origin() {
    let tmp = TempDir::new().unwrap();
    let cache = open(&cache_dir(&tmp), LockMode::Exclusive, &manager());
    let build_cache = BuildCache::new(&cache).unwrap();
    let origin = OriginMetadata::for_current_host(
        "compile",
        ":app:compileJava",
        "/work/app",
        Duration::from_millis(1500),
    )
    .with_build_invocation_id("build-1");

    build_cache.store(&key("inputs"), &origin, b"classes").unwrap();
    let entry = build_cache.load(&key("inputs")).unwrap().unwrap();
    assert_eq!(entry.origin, origin);
    assert_eq!(entry.output, b"classes");
    assert!(build_cache.load(&key("other inputs")).unwrap().is_none());
}

#[test]
fn corrupt_build_cache_entries_are_misses() {
    let tmp = TempDir::new().unwrap();
    let cache = open(&cache_dir(&tmp), LockMode::Exclusive, &manager());
    let build_cache = BuildCache::new(&cache).unwrap();
    let raw = cache
        .indexed_cache::<HashCode, Vec<u8>>(BuildCache::CACHE_NAME)
        .unwrap();

    // Metadata lacking most required keys.
    let mut builder = tar::Builder::new(Vec::new());
    let metadata = b"type=compile\nidentity=:app\n";
    let mut header = tar::Header::new_gnu();
    header.set_size(metadata.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, brisk_cache::METADATA_ENTRY, &metadata[..])
        .unwrap();
    raw.put(&key("partial"), builder.into_inner().unwrap()).unwrap();
    raw.put(&key("garbage"), b"not a tar archive".to_vec()).unwrap();

    assert!(build_cache.load(&key("partial")).unwrap().is_none());
    assert!(build_cache.load(&key("garbage")).unwrap().is_none());
    assert_eq!(raw.get(&key("garbage")).unwrap(), None);
}

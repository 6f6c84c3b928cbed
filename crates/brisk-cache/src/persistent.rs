use std::any::Any;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use brisk_hash::HashCode;
use parking_lot::{Condvar, Mutex};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::contention::ContendedAction;
use crate::error::{CacheError, Result};
use crate::lock::{FileLock, FileLockManager, LockMode, LockOptions};
use crate::lock_state::{LockState, LockStateFormat};
use crate::operations::OperationStack;
use crate::util::{
    atomic_write, bincode_deserialize, bincode_serialize, read_file_limited,
    remove_file_best_effort,
};

pub const INDEXED_CACHE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheOptions {
    pub display_name: String,
    pub mode: LockMode,
    pub format: LockStateFormat,
}

impl CacheOptions {
    pub fn new(display_name: impl Into<String>, mode: LockMode) -> Self {
        Self {
            display_name: display_name.into(),
            mode,
            format: LockStateFormat::default(),
        }
    }

    pub fn with_format(mut self, format: LockStateFormat) -> Self {
        self.format = format;
        self
    }
}

trait InMemory: Send + Sync {
    fn discard(&self);
}

struct Registered {
    any: Arc<dyn Any + Send + Sync>,
    in_memory: Arc<dyn InMemory>,
}

#[derive(Default)]
struct State {
    owner: Option<ThreadId>,
    file_lock: Option<FileLock>,
    /// Lock state when an on-demand lock was last given up.
    released_state: Option<LockState>,
    contended: bool,
    /// Opened shared after an unclean release: every read misses.
    suspect: bool,
    closed: bool,
}

struct Inner {
    dir: PathBuf,
    options: CacheOptions,
    lock_manager: Arc<FileLockManager>,
    state: Mutex<State>,
    ownership: Condvar,
    operations: OperationStack,
    caches: Mutex<HashMap<String, Registered>>,
}

/// A directory of indexed caches guarded by one cross-process file lock.
///
/// All access happens inside [`PersistentCache::use_cache`]; a thread owns the cache for the
/// duration of its outermost `use_cache` call and other threads wait. In shared and exclusive
/// mode the file lock is held from [`PersistentCache::open`] until [`PersistentCache::close`].
/// In on-demand mode it is taken on first use and kept until another process asks for it while
/// no thread is using the cache.
#[derive(Clone)]
pub struct PersistentCache {
    inner: Arc<Inner>,
}

impl PersistentCache {
    pub fn open(
        dir: impl AsRef<Path>,
        options: CacheOptions,
        lock_manager: Arc<FileLockManager>,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        if options.mode == LockMode::OnDemand && options.format != LockStateFormat::Sequenced {
            // Re-acquisition relies on detecting writes by other processes.
            return Err(CacheError::UnsupportedLockStateOperation {
                operation: "on-demand locking",
                format: options.format.as_str(),
            });
        }

        let inner = Arc::new(Inner {
            dir,
            options,
            lock_manager,
            state: Mutex::new(State::default()),
            ownership: Condvar::new(),
            operations: OperationStack::new(),
            caches: Mutex::new(HashMap::new()),
        });
        if inner.options.mode != LockMode::OnDemand {
            let (lock, suspect) = inner.acquire_file_lock()?;
            let mut state = inner.state.lock();
            state.file_lock = Some(lock);
            state.suspect = suspect;
        }
        tracing::debug!(
            target = "brisk.cache",
            cache = %inner.options.display_name,
            dir = %inner.dir.display(),
            mode = %inner.options.mode,
            "opened cache"
        );
        Ok(Self { inner })
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    pub fn display_name(&self) -> &str {
        &self.inner.options.display_name
    }

    pub fn mode(&self) -> LockMode {
        self.inner.options.mode
    }

    /// Whether this process currently holds the cache's file lock.
    pub fn holds_file_lock(&self) -> bool {
        self.inner.state.lock().file_lock.is_some()
    }

    /// State of the held file lock.
    pub fn lock_state(&self) -> Option<LockState> {
        self.inner
            .state
            .lock()
            .file_lock
            .as_ref()
            .map(FileLock::state)
    }

    pub fn operations(&self) -> &OperationStack {
        &self.inner.operations
    }

    /// Runs `action` as the owner of this cache, acquiring the file lock if needed.
    ///
    /// Reentrant on the owning thread.
    pub fn use_cache<T>(&self, action: impl FnOnce() -> Result<T>) -> Result<T> {
        self.inner.take_ownership();
        let frame = FrameGuard::new(&self.inner, Frame::CacheAction);
        if let Err(err) = self.inner.ensure_file_lock() {
            return Err(frame.finish().err().unwrap_or(err));
        }
        let result = action();
        let released = frame.finish();
        let value = result?;
        released?;
        Ok(value)
    }

    /// Runs `action` without owning the cache, so that other threads can use it meanwhile.
    ///
    /// Called inside [`PersistentCache::use_cache`], ownership is given up for the duration of
    /// `action` and taken back afterwards.
    pub fn long_running_operation<T>(&self, action: impl FnOnce() -> T) -> Result<T> {
        self.inner.start_long_running_operation()?;
        let frame = FrameGuard::new(&self.inner, Frame::LongRunningOperation);
        let value = action();
        frame.finish()?;
        Ok(value)
    }

    /// Like [`PersistentCache::long_running_operation`], for work that may itself use the cache.
    ///
    /// Outside a cache action on this thread, waits until no thread at all is inside a cache
    /// action, re-checking every time the cache changes hands.
    pub fn maybe_reentrant_long_running_operation<T>(
        &self,
        action: impl FnOnce() -> T,
    ) -> Result<T> {
        if self.inner.operations.is_in_cache_action() {
            return self.long_running_operation(action);
        }
        {
            let mut state = self.inner.state.lock();
            while self.inner.operations.any_thread_in_cache_action() {
                self.inner.ownership.wait(&mut state);
            }
            self.inner.operations.push_long_running_operation();
        }
        let frame = FrameGuard::new(&self.inner, Frame::DetachedLongRunningOperation);
        let value = action();
        frame.finish()?;
        Ok(value)
    }

    /// Opens, or returns the already open, indexed cache called `name`.
    pub fn indexed_cache<K, V>(&self, name: &str) -> Result<IndexedCache<K, V>>
    where
        K: Serialize + 'static,
        V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        validate_cache_name(name)?;
        let mut caches = self.inner.caches.lock();
        let store = match caches.get(name) {
            Some(registered) => registered
                .any
                .clone()
                .downcast::<EntryStore<K, V>>()
                .map_err(|_| CacheError::IncompatibleIndexedCache {
                    name: name.to_string(),
                })?,
            None => {
                let store = Arc::new(EntryStore::<K, V> {
                    name: name.to_string(),
                    dir: self.inner.dir.join(name),
                    memory: Mutex::new(HashMap::new()),
                    _key: PhantomData,
                });
                caches.insert(
                    name.to_string(),
                    Registered {
                        any: store.clone(),
                        in_memory: store.clone(),
                    },
                );
                store
            }
        };
        Ok(IndexedCache {
            cache: self.clone(),
            store,
        })
    }

    /// Releases the file lock. Later use fails, except in on-demand mode.
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        if self.inner.options.mode != LockMode::OnDemand {
            state.closed = true;
        }
        self.inner.release_file_lock(&mut state);
    }
}

impl std::fmt::Debug for PersistentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentCache")
            .field("display_name", &self.inner.options.display_name)
            .field("dir", &self.inner.dir)
            .field("mode", &self.inner.options.mode)
            .finish()
    }
}

impl Inner {
    fn acquire_file_lock(self: &Arc<Self>) -> Result<(FileLock, bool)> {
        let mode = match self.options.mode {
            LockMode::Shared => LockMode::Shared,
            LockMode::Exclusive | LockMode::OnDemand => LockMode::Exclusive,
        };
        let when_contended = (self.options.mode == LockMode::OnDemand).then(|| {
            let inner = Arc::downgrade(self);
            Arc::new(move || {
                if let Some(inner) = inner.upgrade() {
                    inner.on_contended();
                }
            }) as ContendedAction
        });
        let mut lock = self.lock_manager.lock(
            &self.dir,
            LockOptions::new(mode).with_format(self.options.format),
            &self.options.display_name,
            "use cache",
            when_contended,
        )?;
        let suspect = self.initialize(&mut lock)?;
        Ok((lock, suspect))
    }

    /// Rebuilds the cache if its previous holder did not release it cleanly. Returns whether the
    /// contents must be treated as empty instead.
    fn initialize(&self, lock: &mut FileLock) -> Result<bool> {
        if lock.unlocked_cleanly() {
            return Ok(false);
        }
        if lock.mode() == LockMode::Shared {
            tracing::debug!(
                target = "brisk.cache",
                cache = %self.options.display_name,
                "cache was not released cleanly; treating it as empty"
            );
            return Ok(true);
        }

        tracing::debug!(
            target = "brisk.cache",
            cache = %self.options.display_name,
            "cache was not released cleanly; rebuilding"
        );
        let lock_file = lock.lock_file().to_path_buf();
        let dir = self.dir.clone();
        lock.write_file(|| wipe_entries(&dir, &lock_file))?;
        self.discard_in_memory();
        Ok(false)
    }

    fn on_contended(&self) {
        let mut state = self.state.lock();
        if state.file_lock.is_none() {
            return;
        }
        if state.owner.is_none() {
            self.release_file_lock(&mut state);
        } else {
            state.contended = true;
        }
    }

    fn release_file_lock(&self, state: &mut State) {
        if let Some(lock) = state.file_lock.take() {
            state.released_state = Some(lock.state());
            state.contended = false;
            tracing::debug!(
                target = "brisk.cache",
                cache = %self.options.display_name,
                "releasing cache lock"
            );
            drop(lock);
        }
    }

    fn ensure_file_lock(self: &Arc<Self>) -> Result<()> {
        {
            let state = self.state.lock();
            if state.file_lock.is_some() {
                return Ok(());
            }
            if state.closed || self.options.mode != LockMode::OnDemand {
                return Err(CacheError::LockProtocolViolation(format!(
                    "{} has been closed",
                    self.options.display_name
                )));
            }
        }

        // This thread owns the cache, so nobody else installs a lock meanwhile.
        let (lock, suspect) = self.acquire_file_lock()?;
        let mut state = self.state.lock();
        if let Some(prior) = state.released_state.take() {
            if lock.state().has_been_updated_since(&prior)? {
                tracing::debug!(
                    target = "brisk.cache",
                    cache = %self.options.display_name,
                    "cache was written by another process; discarding in-memory entries"
                );
                self.discard_in_memory();
            }
        }
        state.file_lock = Some(lock);
        state.suspect = suspect;
        Ok(())
    }

    fn take_ownership(&self) {
        let mut state = self.state.lock();
        self.wait_for_ownership(&mut state);
        self.operations.push_cache_action();
    }

    fn wait_for_ownership(&self, state: &mut parking_lot::MutexGuard<'_, State>) {
        let me = thread::current().id();
        while state.owner.is_some_and(|owner| owner != me) {
            self.ownership.wait(state);
        }
        state.owner = Some(me);
    }

    fn release_ownership(&self) -> Result<()> {
        let mut state = self.state.lock();
        let popped = self.operations.pop_cache_action();
        if !self.operations.is_in_cache_action() {
            self.give_up_ownership(&mut state);
        }
        popped
    }

    fn give_up_ownership(&self, state: &mut State) {
        state.owner = None;
        if state.contended {
            self.release_file_lock(state);
        }
        self.ownership.notify_all();
    }

    fn start_long_running_operation(&self) -> Result<()> {
        let mut state = self.state.lock();
        if self.operations.is_in_cache_action() {
            if state.owner != Some(thread::current().id()) {
                return Err(CacheError::LockProtocolViolation(format!(
                    "{} is in a cache action on a thread that does not own it",
                    self.options.display_name
                )));
            }
            self.give_up_ownership(&mut state);
        }
        self.operations.push_long_running_operation();
        self.ownership.notify_all();
        Ok(())
    }

    fn finish_long_running_operation(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.operations.pop_long_running_operation()?;
        if self.operations.is_in_cache_action() {
            self.wait_for_ownership(&mut state);
        }
        Ok(())
    }

    fn finish_detached_long_running_operation(&self) -> Result<()> {
        let _state = self.state.lock();
        let popped = self.operations.pop_long_running_operation();
        self.ownership.notify_all();
        popped
    }

    fn finish_frame(&self, frame: Frame) -> Result<()> {
        match frame {
            Frame::CacheAction => self.release_ownership(),
            Frame::LongRunningOperation => self.finish_long_running_operation(),
            Frame::DetachedLongRunningOperation => self.finish_detached_long_running_operation(),
        }
    }

    fn with_file_lock<T>(&self, action: impl FnOnce(&mut FileLock, bool) -> Result<T>) -> Result<T> {
        let mut state = self.state.lock();
        if state.owner != Some(thread::current().id()) {
            return Err(CacheError::LockProtocolViolation(format!(
                "{} has not been locked for this thread",
                self.options.display_name
            )));
        }
        let suspect = state.suspect;
        let Some(lock) = state.file_lock.as_mut() else {
            return Err(CacheError::LockProtocolViolation(format!(
                "{} is in use without a file lock",
                self.options.display_name
            )));
        };
        action(lock, suspect)
    }

    fn discard_in_memory(&self) {
        for registered in self.caches.lock().values() {
            registered.in_memory.discard();
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Frame {
    CacheAction,
    LongRunningOperation,
    /// Started outside any cache action on this thread.
    DetachedLongRunningOperation,
}

/// Pops a frame pushed by this thread, also when the action inside it unwinds.
struct FrameGuard<'a> {
    inner: &'a Inner,
    frame: Frame,
    armed: bool,
}

impl<'a> FrameGuard<'a> {
    fn new(inner: &'a Inner, frame: Frame) -> Self {
        Self {
            inner,
            frame,
            armed: true,
        }
    }

    fn finish(mut self) -> Result<()> {
        self.armed = false;
        self.inner.finish_frame(self.frame)
    }
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(err) = self.inner.finish_frame(self.frame) {
            tracing::warn!(
                target = "brisk.cache",
                cache = %self.inner.options.display_name,
                error = %err,
                "failed to unwind cache operation"
            );
        }
    }
}

fn validate_cache_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && !name.ends_with(".lock")
        && !name.ends_with(".owner")
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(CacheError::InvalidCacheName {
            name: name.to_string(),
        })
    }
}

/// Removes everything in `dir` except the lock file and its owner file.
fn wipe_entries(dir: &Path, lock_file: &Path) -> Result<()> {
    let mut owner_file = lock_file.as_os_str().to_os_string();
    owner_file.push(".owner");
    let owner_file = PathBuf::from(owner_file);

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    for entry in entries {
        let path = entry?.path();
        if path == lock_file || path == owner_file {
            continue;
        }
        let removed = match fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&path),
            Ok(_) => fs::remove_file(&path),
            Err(err) => Err(err),
        };
        match removed {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct PersistedEntryRef<'a, V> {
    schema_version: u32,
    brisk_version: &'a str,
    key: &'a [u8],
    value: &'a V,
}

#[derive(Deserialize)]
struct PersistedEntry<V> {
    schema_version: u32,
    brisk_version: String,
    key: Vec<u8>,
    value: V,
}

struct EntryStore<K, V> {
    name: String,
    dir: PathBuf,
    /// Decoded entries; `None` records a known miss.
    memory: Mutex<HashMap<HashCode, Option<V>>>,
    _key: PhantomData<fn(&K)>,
}

impl<K, V> InMemory for EntryStore<K, V>
where
    V: Send + Sync,
{
    fn discard(&self) {
        self.memory.lock().clear();
    }
}

impl<K, V> EntryStore<K, V>
where
    V: Serialize + DeserializeOwned,
{
    fn entry_path(&self, id: &HashCode) -> PathBuf {
        self.dir.join(format!("{}.bin", id.to_hex()))
    }

    fn read(&self, id: &HashCode, key: &[u8], can_write: bool) -> Option<V> {
        let path = self.entry_path(id);
        let bytes = read_file_limited(&path)?;
        let discard = |reason: &'static str| {
            tracing::debug!(
                target = "brisk.cache",
                cache = %self.name,
                path = %path.display(),
                reason,
                "discarding corrupt cache entry"
            );
            if can_write {
                remove_file_best_effort(&path, reason);
            }
        };

        let entry: PersistedEntry<V> = match bincode_deserialize(&bytes) {
            Ok(entry) => entry,
            Err(_) => {
                discard("undecodable");
                return None;
            }
        };
        if entry.schema_version != INDEXED_CACHE_SCHEMA_VERSION
            || entry.brisk_version != brisk_core::BRISK_VERSION
        {
            discard("version_mismatch");
            return None;
        }
        if entry.key != key {
            // A hash collision, not corruption: keep the other key's entry.
            return None;
        }
        Some(entry.value)
    }

    fn write(&self, id: &HashCode, key: &[u8], value: &V) -> Result<()> {
        let bytes = bincode_serialize(&PersistedEntryRef {
            schema_version: INDEXED_CACHE_SCHEMA_VERSION,
            brisk_version: brisk_core::BRISK_VERSION,
            key,
            value,
        })?;
        atomic_write(&self.entry_path(id), &bytes)
    }

    fn remove(&self, id: &HashCode) -> Result<()> {
        match fs::remove_file(self.entry_path(id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// A typed key/value store inside a [`PersistentCache`].
///
/// Each entry is one file named after the hash of its encoded key; the full key is stored
/// alongside the value and checked on read.
pub struct IndexedCache<K, V> {
    cache: PersistentCache,
    store: Arc<EntryStore<K, V>>,
}

impl<K, V> Clone for IndexedCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            store: self.store.clone(),
        }
    }
}

impl<K, V> IndexedCache<K, V>
where
    K: Serialize,
    V: Serialize + DeserializeOwned + Clone,
{
    pub fn name(&self) -> &str {
        &self.store.name
    }

    fn key_id(key: &K) -> Result<(HashCode, Vec<u8>)> {
        let bytes = bincode_serialize(key)?;
        Ok((brisk_hash::hash_bytes(&bytes), bytes))
    }

    pub fn get(&self, key: &K) -> Result<Option<V>> {
        let (id, key_bytes) = Self::key_id(key)?;
        self.cache.use_cache(|| {
            if let Some(known) = self.store.memory.lock().get(&id) {
                return Ok(known.clone());
            }
            let value = self.cache.inner.with_file_lock(|lock, suspect| {
                if suspect {
                    return Ok(None);
                }
                let can_write = lock.mode() == LockMode::Exclusive;
                lock.read_file(|| Ok(self.store.read(&id, &key_bytes, can_write)))
            })?;
            self.store.memory.lock().insert(id, value.clone());
            Ok(value)
        })
    }

    pub fn put(&self, key: &K, value: V) -> Result<()> {
        let (id, key_bytes) = Self::key_id(key)?;
        self.cache.use_cache(|| {
            self.cache.inner.with_file_lock(|lock, _| {
                lock.update_file(|| self.store.write(&id, &key_bytes, &value))
            })?;
            self.store.memory.lock().insert(id, Some(value));
            Ok(())
        })
    }

    pub fn remove(&self, key: &K) -> Result<()> {
        let (id, _) = Self::key_id(key)?;
        self.cache.use_cache(|| {
            self.cache
                .inner
                .with_file_lock(|lock, _| lock.update_file(|| self.store.remove(&id)))?;
            self.store.memory.lock().insert(id, None);
            Ok(())
        })
    }
}

use std::collections::HashSet;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fs2::FileExt;
use parking_lot::Mutex;

use crate::contention::{ContendedAction, ContentionHandler};
use crate::error::{CacheError, Result};
use crate::lock_state::{DecodeError, LockState, LockStateFormat};
use crate::util::{atomic_write, remove_file_best_effort};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_PING_DELAY: Duration = Duration::from_secs(1);
const INITIAL_BACKOFF: Duration = Duration::from_millis(1);
const MAX_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Many readers across processes; no writes.
    Shared,
    /// One holder across all processes.
    Exclusive,
    /// Exclusive while in use, released when another process asks for it while idle.
    OnDemand,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LockMode::Shared => "shared",
            LockMode::Exclusive => "exclusive",
            LockMode::OnDemand => "on-demand",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    pub mode: LockMode,
    pub format: LockStateFormat,
}

impl LockOptions {
    pub fn new(mode: LockMode) -> Self {
        Self {
            mode,
            format: LockStateFormat::default(),
        }
    }

    pub fn with_format(mut self, format: LockStateFormat) -> Self {
        self.format = format;
        self
    }
}

/// What an exclusive holder publishes about itself next to the lock file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOwner {
    pub port: u16,
    pub lock_id: i64,
    pub pid: u32,
    pub operation: String,
}

impl LockOwner {
    fn encode(&self) -> String {
        format!(
            "port={}\nlock_id={}\npid={}\noperation={}\n",
            self.port,
            self.lock_id,
            self.pid,
            self.operation.replace('\n', " ")
        )
    }

    fn decode(text: &str) -> Option<Self> {
        let mut port = None;
        let mut lock_id = None;
        let mut pid = None;
        let mut operation = String::new();
        for line in text.lines() {
            let (key, value) = line.split_once('=')?;
            match key {
                "port" => port = value.parse().ok(),
                "lock_id" => lock_id = value.parse().ok(),
                "pid" => pid = value.parse().ok(),
                "operation" => operation = value.to_string(),
                _ => {}
            }
        }
        Some(Self {
            port: port?,
            lock_id: lock_id?,
            pid: pid?,
            operation,
        })
    }

    pub fn read(owner_file: &Path) -> Option<Self> {
        let text = fs::read_to_string(owner_file).ok()?;
        Self::decode(&text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockManagerOptions {
    pub lock_timeout: Duration,
    /// Minimum delay between two pings to the same owner.
    pub ping_delay: Duration,
}

impl Default for LockManagerOptions {
    fn default() -> Self {
        Self {
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            ping_delay: DEFAULT_PING_DELAY,
        }
    }
}

/// Acquires cross-process file locks.
///
/// Each lock is an OS lock on the file named by [`FileLockManager::lock_file_for`]. A target can
/// be locked at most once per manager at a time; locking it again before release is a protocol
/// violation.
pub struct FileLockManager {
    options: LockManagerOptions,
    contention: Arc<ContentionHandler>,
    locked: Arc<Mutex<HashSet<PathBuf>>>,
}

impl FileLockManager {
    pub fn new(options: LockManagerOptions) -> Self {
        Self::with_contention_handler(options, ContentionHandler::shared())
    }

    pub fn with_contention_handler(
        options: LockManagerOptions,
        contention: Arc<ContentionHandler>,
    ) -> Self {
        Self {
            options,
            contention,
            locked: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn options(&self) -> &LockManagerOptions {
        &self.options
    }

    pub fn contention_handler(&self) -> &Arc<ContentionHandler> {
        &self.contention
    }

    /// The lock file guarding `target`: inside it for a directory, next to it otherwise.
    pub fn lock_file_for(target: &Path) -> PathBuf {
        let name = target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "cache".to_string());
        if target.is_dir() {
            target.join(format!("{name}.lock"))
        } else {
            target.with_file_name(format!("{name}.lock"))
        }
    }

    /// Blocks until `target` is locked in `options.mode` or the lock timeout expires.
    ///
    /// `when_contended` is invoked, on the contention listener thread, each time another
    /// process asks for this lock.
    pub fn lock(
        &self,
        target: &Path,
        options: LockOptions,
        display_name: &str,
        operation: &str,
        when_contended: Option<ContendedAction>,
    ) -> Result<FileLock> {
        if options.mode == LockMode::OnDemand {
            return Err(CacheError::UnsupportedLockMode {
                display_name: display_name.to_string(),
                mode: options.mode,
            });
        }
        if !self.locked.lock().insert(target.to_path_buf()) {
            return Err(CacheError::LockProtocolViolation(format!(
                "cannot lock {display_name} as it has already been locked by this process"
            )));
        }

        let result = self.acquire(target, options, display_name, operation, when_contended);
        if result.is_err() {
            self.locked.lock().remove(target);
        }
        result
    }

    fn acquire(
        &self,
        target: &Path,
        options: LockOptions,
        display_name: &str,
        operation: &str,
        when_contended: Option<ContendedAction>,
    ) -> Result<FileLock> {
        let lock_file = Self::lock_file_for(target);
        if let Some(parent) = lock_file.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_file)?;
        let lock_id = random_lock_id()?;
        let port = self.contention.reserve_port()?;

        tracing::debug!(
            target = "brisk.cache.lock",
            lock = display_name,
            mode = %options.mode,
            "waiting to acquire lock"
        );
        let owner_file = owner_file_for(&lock_file);
        self.wait_for_lock(&file, &lock_file, &owner_file, options.mode, display_name, operation)?;

        let mut lock = FileLock {
            target: target.to_path_buf(),
            lock_file,
            owner_file,
            display_name: display_name.to_string(),
            mode: options.mode,
            format: options.format,
            file,
            state: LockState::DirtyFlag { dirty: true },
            lock_id,
            contention: self.contention.clone(),
            locked: self.locked.clone(),
        };
        lock.state = match options.mode {
            LockMode::Exclusive => {
                let state = lock.ensure_lock_state()?;
                let owner = LockOwner {
                    port,
                    lock_id,
                    pid: std::process::id(),
                    operation: operation.to_string(),
                };
                atomic_write(&lock.owner_file, owner.encode().as_bytes())?;
                state
            }
            _ => lock.read_lock_state()?,
        };
        if let Some(action) = when_contended {
            self.contention.start(lock_id, action)?;
        }

        tracing::debug!(
            target = "brisk.cache.lock",
            lock = display_name,
            mode = %options.mode,
            lock_id,
            "lock acquired"
        );
        Ok(lock)
    }

    fn wait_for_lock(
        &self,
        file: &File,
        lock_file: &Path,
        owner_file: &Path,
        mode: LockMode,
        display_name: &str,
        operation: &str,
    ) -> Result<()> {
        let mut backoff = Backoff::new(self.options.lock_timeout);
        let mut last_owner: Option<(u16, i64)> = None;
        let mut last_ping: Option<Instant> = None;
        loop {
            let attempt = match mode {
                // Qualified: newer std has inherent `File` lock methods with other signatures.
                LockMode::Shared => FileExt::try_lock_shared(file),
                _ => FileExt::try_lock_exclusive(file),
            };
            match attempt {
                Ok(()) => return Ok(()),
                Err(err) if is_contended(&err) => {}
                Err(err) => return Err(err.into()),
            }

            let owner = LockOwner::read(owner_file);
            if let Some(owner) = &owner {
                let identity = (owner.port, owner.lock_id);
                if last_owner != Some(identity) {
                    // A new holder gets the full timeout.
                    backoff.restart();
                    last_owner = Some(identity);
                    last_ping = None;
                }
                let due = last_ping.map_or(true, |at| at.elapsed() >= self.options.ping_delay);
                if due && self.contention.ping_owner(owner.port, owner.lock_id, display_name) {
                    last_ping = Some(Instant::now());
                }
            }

            if !backoff.sleep() {
                let our_pid = std::process::id();
                return Err(CacheError::LockTimeout {
                    display_name: display_name.to_string(),
                    lock_file: lock_file.to_path_buf(),
                    held_by_this_process: owner.as_ref().is_some_and(|o| o.pid == our_pid),
                    owner_pid: owner.as_ref().map(|o| o.pid),
                    owner_operation: owner.map(|o| o.operation),
                    our_pid,
                    our_operation: operation.to_string(),
                });
            }
        }
    }
}

impl Default for FileLockManager {
    fn default() -> Self {
        Self::new(LockManagerOptions::default())
    }
}

impl fmt::Debug for FileLockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileLockManager")
            .field("options", &self.options)
            .field("locked", &self.locked.lock().len())
            .finish()
    }
}

fn owner_file_for(lock_file: &Path) -> PathBuf {
    let mut name = lock_file.as_os_str().to_os_string();
    name.push(".owner");
    PathBuf::from(name)
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn random_lock_id() -> Result<i64> {
    let mut bytes = [0u8; 8];
    getrandom::getrandom(&mut bytes)?;
    Ok(i64::from_be_bytes(bytes))
}

/// Exponential backoff between lock attempts, bounded by a deadline.
struct Backoff {
    timeout: Duration,
    started: Instant,
    next: Duration,
}

impl Backoff {
    fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            started: Instant::now(),
            next: INITIAL_BACKOFF,
        }
    }

    fn restart(&mut self) {
        self.started = Instant::now();
        self.next = INITIAL_BACKOFF;
    }

    /// Sleeps for the next interval; false once the deadline has passed.
    fn sleep(&mut self) -> bool {
        let elapsed = self.started.elapsed();
        if elapsed >= self.timeout {
            return false;
        }
        std::thread::sleep(self.next.min(self.timeout - elapsed));
        self.next = (self.next * 2).min(MAX_BACKOFF);
        true
    }
}

/// A held cross-process lock. Released on drop.
pub struct FileLock {
    target: PathBuf,
    lock_file: PathBuf,
    owner_file: PathBuf,
    display_name: String,
    mode: LockMode,
    format: LockStateFormat,
    file: File,
    state: LockState,
    lock_id: i64,
    contention: Arc<ContentionHandler>,
    locked: Arc<Mutex<HashSet<PathBuf>>>,
}

impl FileLock {
    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn lock_file(&self) -> &Path {
        &self.lock_file
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn lock_id(&self) -> i64 {
        self.lock_id
    }

    /// The state as of acquisition or the last write through this lock.
    pub fn state(&self) -> LockState {
        self.state
    }

    /// Whether the previous holder released the lock after completing its writes.
    pub fn unlocked_cleanly(&self) -> bool {
        !self.state.is_dirty()
    }

    /// Runs a read of the protected files. Fails if their contents are suspect.
    pub fn read_file<T>(&self, action: impl FnOnce() -> Result<T>) -> Result<T> {
        self.ensure_integral()?;
        action()
    }

    /// Runs a write that depends on the current contents. Fails if they are suspect.
    pub fn update_file<T>(&mut self, action: impl FnOnce() -> Result<T>) -> Result<T> {
        self.ensure_integral()?;
        self.write_transaction(action)
    }

    /// Runs a write that replaces the contents, such as a rebuild after an unclean release.
    pub fn write_file<T>(&mut self, action: impl FnOnce() -> Result<T>) -> Result<T> {
        self.write_transaction(action)
    }

    fn ensure_integral(&self) -> Result<()> {
        if self.state.is_dirty() {
            return Err(CacheError::FileIntegrityViolation {
                target: self.target.clone(),
            });
        }
        Ok(())
    }

    fn write_transaction<T>(&mut self, action: impl FnOnce() -> Result<T>) -> Result<T> {
        if self.mode != LockMode::Exclusive {
            return Err(CacheError::InsufficientLockMode {
                display_name: self.display_name.clone(),
            });
        }
        let dirty = self.state.before_update();
        self.write_state(&dirty)?;
        self.state = dirty;

        // A failed action leaves the state dirty on disk.
        let value = action()?;

        let clean = self.state.complete_update();
        self.write_state(&clean)?;
        self.state = clean;
        Ok(value)
    }

    fn read_raw(&self) -> Result<Vec<u8>> {
        let mut file = &self.file;
        file.seek(SeekFrom::Start(0))?;
        let mut bytes = Vec::with_capacity(self.format.encoded_len());
        file.take(self.format.encoded_len() as u64)
            .read_to_end(&mut bytes)?;
        Ok(bytes)
    }

    fn read_lock_state(&self) -> Result<LockState> {
        let bytes = self.read_raw()?;
        if bytes.is_empty() {
            return self.format.initial_state();
        }
        self.decode(&bytes)
    }

    /// Reads the state, first writing an initial state into a new lock file.
    fn ensure_lock_state(&mut self) -> Result<LockState> {
        let bytes = self.read_raw()?;
        if bytes.is_empty() {
            let initial = self.format.initial_state()?;
            self.write_state(&initial)?;
            return Ok(initial);
        }
        self.decode(&bytes)
    }

    fn decode(&self, bytes: &[u8]) -> Result<LockState> {
        self.format.decode(bytes).map_err(|err| match err {
            DecodeError::Truncated => CacheError::TruncatedLockState {
                lock_file: self.lock_file.clone(),
            },
            DecodeError::UnexpectedVersion { expected, found } => {
                CacheError::UnexpectedLockStateFormat {
                    lock_file: self.lock_file.clone(),
                    expected,
                    found,
                }
            }
        })
    }

    fn write_state(&mut self, state: &LockState) -> Result<()> {
        let bytes = self.format.encode(state)?;
        let mut file = &self.file;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&bytes)?;
        file.set_len(bytes.len() as u64)?;
        file.sync_data()?;
        Ok(())
    }
}

impl fmt::Debug for FileLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileLock")
            .field("display_name", &self.display_name)
            .field("lock_file", &self.lock_file)
            .field("mode", &self.mode)
            .field("state", &self.state)
            .field("lock_id", &self.lock_id)
            .finish()
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        tracing::debug!(
            target = "brisk.cache.lock",
            lock = %self.display_name,
            "releasing lock"
        );
        self.contention.stop(self.lock_id);
        if self.mode == LockMode::Exclusive {
            remove_file_best_effort(&self.owner_file, "file_lock.release");
        }
        if let Err(err) = FileExt::unlock(&self.file) {
            tracing::debug!(
                target = "brisk.cache.lock",
                lock = %self.display_name,
                error = %err,
                "failed to unlock lock file"
            );
        }
        self.locked.lock().remove(&self.target);
    }
}

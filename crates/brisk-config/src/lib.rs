//! Brisk configuration loaded from `brisk.toml`, and `tracing` initialization.

use std::path::{Path, PathBuf};
use std::sync::{Once, OnceLock};
use std::time::Duration;

use brisk_cache::LockManagerOptions;
use brisk_snapshot::{DefaultExcludes, DEFAULT_EXCLUDES};
use parking_lot::ReentrantMutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const BRISK_CONFIG_ENV_VAR: &str = "BRISK_CONFIG_PATH";
pub const BRISK_CACHE_DIR_ENV_VAR: &str = "BRISK_CACHE_DIR";
pub const CONFIG_FILE_NAME: &str = "brisk.toml";

/// Top-level configuration.
///
/// ```toml
/// [cache]
/// dir = "/var/cache/brisk"
/// lock_timeout_ms = 60000
/// ping_delay_ms = 1000
/// resource_hash_cache_capacity = 100000
///
/// [snapshot]
/// default_excludes = ["**/.git/**", "**/*~"]
///
/// [logging]
/// level = "debug"
/// json = false
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BriskConfig {
    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub snapshot: SnapshotConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Root directory for persistent caches. Relative paths are resolved against the directory
    /// of the config file.
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// How long to wait for a cache lock held by another process.
    #[serde(default = "CacheConfig::default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Minimum delay between two release requests sent to the same lock owner.
    #[serde(default = "CacheConfig::default_ping_delay_ms")]
    pub ping_delay_ms: u64,

    /// Number of resource hashes kept in memory.
    #[serde(default = "CacheConfig::default_resource_hash_cache_capacity")]
    pub resource_hash_cache_capacity: usize,
}

impl CacheConfig {
    fn default_lock_timeout_ms() -> u64 {
        60_000
    }

    fn default_ping_delay_ms() -> u64 {
        1_000
    }

    fn default_resource_hash_cache_capacity() -> usize {
        100_000
    }

    /// The cache root: `BRISK_CACHE_DIR`, then `dir`, then `$HOME/.brisk/caches`.
    pub fn resolved_dir(&self) -> PathBuf {
        if let Some(dir) = std::env::var_os(BRISK_CACHE_DIR_ENV_VAR).filter(|v| !v.is_empty()) {
            return PathBuf::from(dir);
        }
        if let Some(dir) = &self.dir {
            return dir.clone();
        }
        default_cache_root()
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn ping_delay(&self) -> Duration {
        Duration::from_millis(self.ping_delay_ms)
    }

    pub fn lock_manager_options(&self) -> LockManagerOptions {
        LockManagerOptions {
            lock_timeout: self.lock_timeout(),
            ping_delay: self.ping_delay(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            lock_timeout_ms: Self::default_lock_timeout_ms(),
            ping_delay_ms: Self::default_ping_delay_ms(),
            resource_hash_cache_capacity: Self::default_resource_hash_cache_capacity(),
        }
    }
}

fn default_cache_root() -> PathBuf {
    let home = ["HOME", "USERPROFILE"]
        .into_iter()
        .find_map(|name| std::env::var_os(name).filter(|v| !v.is_empty()))
        .map(PathBuf::from);
    match home {
        Some(home) => home.join(".brisk").join("caches"),
        None => {
            static REPORTED: OnceLock<()> = OnceLock::new();
            if REPORTED.set(()).is_ok() {
                tracing::warn!(
                    target = "brisk.config",
                    "no home directory; using the temp directory for caches"
                );
            }
            std::env::temp_dir().join("brisk-caches")
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SnapshotConfig {
    /// Ant-style name patterns excluded from every walk.
    #[serde(default = "SnapshotConfig::default_excludes_list")]
    pub default_excludes: Vec<String>,
}

impl SnapshotConfig {
    fn default_excludes_list() -> Vec<String> {
        DEFAULT_EXCLUDES.iter().map(|p| p.to_string()).collect()
    }

    pub fn excludes(&self) -> DefaultExcludes {
        DefaultExcludes::new(&self.default_excludes)
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            default_excludes: Self::default_excludes_list(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// A level (`info`, `debug`, ...) or a full `EnvFilter` directive string.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Emit logs as JSON lines.
    #[serde(default)]
    pub json: bool,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_owned()
    }

    fn normalize_level_directives(input: &str) -> String {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Self::default_level();
        }
        match trimmed.to_ascii_lowercase().as_str() {
            "trace" => "trace".to_owned(),
            "debug" => "debug".to_owned(),
            "info" => "info".to_owned(),
            "warn" | "warning" => "warn".to_owned(),
            "error" => "error".to_owned(),
            _ => trimmed.to_owned(),
        }
    }

    fn config_env_filter(&self) -> tracing_subscriber::EnvFilter {
        let directives = Self::normalize_level_directives(&self.level);
        tracing_subscriber::EnvFilter::try_new(directives).unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::default()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        })
    }

    /// The effective filter: the configured level, with `RUST_LOG` merged in when set.
    pub fn env_filter(&self) -> tracing_subscriber::EnvFilter {
        let env_directives = std::env::var("RUST_LOG")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());
        let config_directives = Self::normalize_level_directives(&self.level);

        match env_directives {
            Some(env_directives) => {
                let combined = format!("{config_directives},{env_directives}");
                tracing_subscriber::EnvFilter::try_new(combined)
                    .or_else(|_| tracing_subscriber::EnvFilter::try_new(env_directives))
                    .unwrap_or_else(|_| self.config_env_filter())
            }
            None => self.config_env_filter(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
    #[error("invalid config value for {field}: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // The default `Display` quotes the offending source line.
        ConfigError::Toml(err.message().to_owned())
    }
}

impl BriskConfig {
    pub fn load_from_str(text: &str) -> Result<Self, ConfigError> {
        let config: BriskConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config = Self::load_from_str(&text)?;
        if let (Some(dir), Some(base)) = (&config.cache.dir, path.parent()) {
            if dir.is_relative() {
                config.cache.dir = Some(base.join(dir));
            }
        }
        tracing::debug!(
            target = "brisk.config",
            path = %path.display(),
            "loaded config"
        );
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.lock_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "cache.lock_timeout_ms",
                message: "must be at least 1".to_string(),
            });
        }
        if self.cache.resource_hash_cache_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "cache.resource_hash_cache_capacity",
                message: "must be at least 1".to_string(),
            });
        }
        if let Some(pattern) = self
            .snapshot
            .default_excludes
            .iter()
            .find(|pattern| name_wildcards(pattern) > 1 && !is_dir_pattern(pattern))
        {
            return Err(ConfigError::Invalid {
                field: "snapshot.default_excludes",
                message: format!("pattern '{pattern}' has more than one wildcard in its name"),
            });
        }
        Ok(())
    }
}

/// Wildcards in the name part of `**/name`.
fn name_wildcards(pattern: &str) -> usize {
    let name = pattern.strip_prefix("**/").unwrap_or(pattern);
    name.matches('*').count()
}

/// `**/name/**` or `name/**`.
fn is_dir_pattern(pattern: &str) -> bool {
    let name = pattern.strip_prefix("**/").unwrap_or(pattern);
    name.strip_suffix("/**").is_some_and(|dir| !dir.contains('*'))
}

static CONFIG_ENV_LOCK: OnceLock<ReentrantMutex<()>> = OnceLock::new();

fn config_env_lock() -> &'static ReentrantMutex<()> {
    CONFIG_ENV_LOCK.get_or_init(|| ReentrantMutex::new(()))
}

/// Runs `f` while holding the lock that serializes config discovery.
///
/// Environment variables are process-global; tests that set [`BRISK_CONFIG_ENV_VAR`] or
/// [`BRISK_CACHE_DIR_ENV_VAR`] wrap the mutation and the lookup in this helper.
pub fn with_config_env_lock<R>(f: impl FnOnce() -> R) -> R {
    let _guard = config_env_lock().lock();
    f()
}

/// Finds the config file for a workspace: `BRISK_CONFIG_PATH` (absolute or relative to
/// `workspace_root`), then `brisk.toml` in `workspace_root`.
pub fn discover_config_path(workspace_root: &Path) -> Option<PathBuf> {
    let _guard = config_env_lock().lock();
    if let Some(value) = std::env::var_os(BRISK_CONFIG_ENV_VAR).filter(|v| !v.is_empty()) {
        let candidate = PathBuf::from(value);
        let path = if candidate.is_absolute() {
            candidate
        } else {
            workspace_root.join(candidate)
        };
        return Some(path.canonicalize().unwrap_or(path));
    }

    let path = workspace_root.join(CONFIG_FILE_NAME);
    path.is_file()
        .then(|| path.canonicalize().unwrap_or(path))
}

/// Loads the configuration for a workspace, or the defaults when there is no config file.
pub fn load_for_workspace(
    workspace_root: &Path,
) -> Result<(BriskConfig, Option<PathBuf>), ConfigError> {
    let Some(path) = discover_config_path(workspace_root) else {
        return Ok((BriskConfig::default(), None));
    };
    let config = BriskConfig::load_from_path(&path)?;
    Ok((config, Some(path)))
}

static TRACING_INIT: Once = Once::new();

/// Installs a global `fmt` subscriber writing to stderr.
///
/// Safe to call more than once; only the first call has an effect, and an already installed
/// global subscriber is left in place.
pub fn init_tracing(config: &LoggingConfig) {
    TRACING_INIT.call_once(|| {
        let filter = config.env_filter();
        let installed = if config.json {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .try_init()
        } else {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .try_init()
        };
        if installed.is_err() {
            tracing::debug!(
                target = "brisk.config",
                "a global tracing subscriber is already installed"
            );
        }
    });
}

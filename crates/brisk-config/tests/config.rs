use std::ffi::OsString;
use std::path::Path;
use std::time::Duration;

use brisk_config::{
    discover_config_path, load_for_workspace, with_config_env_lock, BriskConfig, ConfigError,
    LoggingConfig, BRISK_CACHE_DIR_ENV_VAR, BRISK_CONFIG_ENV_VAR,
};
use brisk_snapshot::DEFAULT_EXCLUDES;
use tempfile::tempdir;

struct EnvVarGuard {
    key: &'static str,
    prev: Option<OsString>,
}

impl EnvVarGuard {
    fn set(key: &'static str, value: &Path) -> Self {
        let prev = std::env::var_os(key);
        std::env::set_var(key, value);
        Self { key, prev }
    }

    fn unset(key: &'static str) -> Self {
        let prev = std::env::var_os(key);
        std::env::remove_var(key);
        Self { key, prev }
    }
}

impl Drop for EnvVarGuard {
    fn drop(&mut self) {
        match &self.prev {
            Some(v) => std::env::set_var(self.key, v),
            None => std::env::remove_var(self.key),
        }
    }
}

#[test]
fn empty_config_uses_defaults() {
    let config = BriskConfig::load_from_str("").unwrap();
    assert_eq!(config, BriskConfig::default());
    assert_eq!(config.cache.lock_timeout(), Duration::from_secs(60));
    assert_eq!(config.cache.ping_delay(), Duration::from_secs(1));
    assert_eq!(config.cache.resource_hash_cache_capacity, 100_000);
    assert_eq!(config.snapshot.default_excludes.len(), DEFAULT_EXCLUDES.len());
    assert_eq!(config.logging.level, "info");
    assert!(!config.logging.json);
}

#[test]
fn sections_override_defaults() {
    let config = BriskConfig::load_from_str(
        r#"
[cache]
dir = "/var/cache/brisk"
lock_timeout_ms = 250
ping_delay_ms = 20

[snapshot]
default_excludes = ["**/.git/**", "**/*.bak"]

[logging]
level = "debug"
json = true
"#,
    )
    .unwrap();

    let options = config.cache.lock_manager_options();
    assert_eq!(options.lock_timeout, Duration::from_millis(250));
    assert_eq!(options.ping_delay, Duration::from_millis(20));

    let excludes = config.snapshot.excludes();
    assert!(excludes.excludes_dir(".git"));
    assert!(excludes.excludes_file("notes.bak"));
    assert!(!excludes.excludes_file(".gitignore"));
    assert!(config.logging.json);
}

#[test]
fn unknown_keys_are_rejected() {
    let err = BriskConfig::load_from_str("[cache]\nlock_timeout = 5\n").unwrap_err();
    assert!(matches!(err, ConfigError::Toml(_)), "{err}");

    let err = BriskConfig::load_from_str("[caches]\n").unwrap_err();
    assert!(matches!(err, ConfigError::Toml(_)), "{err}");
}

#[test]
fn nonsensical_values_are_rejected() {
    assert!(matches!(
        BriskConfig::load_from_str("[cache]\nlock_timeout_ms = 0\n"),
        Err(ConfigError::Invalid {
            field: "cache.lock_timeout_ms",
            ..
        })
    ));
    assert!(matches!(
        BriskConfig::load_from_str("[snapshot]\ndefault_excludes = [\"**/a*b*c\"]\n"),
        Err(ConfigError::Invalid {
            field: "snapshot.default_excludes",
            ..
        })
    ));
}

#[test]
fn relative_cache_dirs_resolve_against_the_config_file() {
    with_config_env_lock(|| {
        let _env = EnvVarGuard::unset(BRISK_CACHE_DIR_ENV_VAR);
        let dir = tempdir().unwrap();
        let path = dir.path().join("brisk.toml");
        std::fs::write(&path, "[cache]\ndir = \"caches\"\n").unwrap();

        let config = BriskConfig::load_from_path(&path).unwrap();
        assert_eq!(config.cache.resolved_dir(), dir.path().join("caches"));
    });
}

#[test]
fn cache_dir_env_var_wins() {
    with_config_env_lock(|| {
        let dir = tempdir().unwrap();
        let _env = EnvVarGuard::set(BRISK_CACHE_DIR_ENV_VAR, dir.path());
        let config = BriskConfig::load_from_str("[cache]\ndir = \"/elsewhere\"\n").unwrap();
        assert_eq!(config.cache.resolved_dir(), dir.path());
    });
}

#[test]
fn discovery_prefers_the_env_var() {
    with_config_env_lock(|| {
        let workspace = tempdir().unwrap();
        std::fs::write(workspace.path().join("brisk.toml"), "[logging]\nlevel = \"warn\"\n")
            .unwrap();

        {
            let _env = EnvVarGuard::unset(BRISK_CONFIG_ENV_VAR);
            let (config, path) = load_for_workspace(workspace.path()).unwrap();
            assert_eq!(config.logging.level, "warn");
            assert!(path.unwrap().ends_with("brisk.toml"));
        }

        let other = tempdir().unwrap();
        let custom = other.path().join("custom.toml");
        std::fs::write(&custom, "[logging]\nlevel = \"trace\"\n").unwrap();
        let _env = EnvVarGuard::set(BRISK_CONFIG_ENV_VAR, &custom);
        let (config, _) = load_for_workspace(workspace.path()).unwrap();
        assert_eq!(config.logging.level, "trace");
    });
}

#[test]
fn missing_config_falls_back_to_defaults() {
    with_config_env_lock(|| {
        let _env = EnvVarGuard::unset(BRISK_CONFIG_ENV_VAR);
        let workspace = tempdir().unwrap();
        assert_eq!(discover_config_path(workspace.path()), None);
        let (config, path) = load_for_workspace(workspace.path()).unwrap();
        assert_eq!(config, BriskConfig::default());
        assert_eq!(path, None);
    });
}

#[test]
fn unreadable_config_reports_the_path() {
    let dir = tempdir().unwrap();
    let missing = dir.path().join("absent.toml");
    let err = BriskConfig::load_from_path(&missing).unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
    assert!(err.to_string().contains("absent.toml"));
}

#[test]
fn tracing_initialization_is_idempotent() {
    let config = LoggingConfig {
        level: "brisk=debug".to_string(),
        json: false,
    };
    brisk_config::init_tracing(&config);
    brisk_config::init_tracing(&config);
    tracing::debug!(target = "brisk.config", "still alive");
}

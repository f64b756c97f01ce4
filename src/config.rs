// Configuration for the wrapper
//
// Configuration is loaded in order of precedence:
// 1. Command-line flags (highest priority)
// 2. Environment variables (WRAPPER_*)
// 3. Config file (~/.config/codetap/config.json)
// 4. Built-in defaults (lowest priority)

use crate::store::StoreKind;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Mode {
    Development,
    Production,
    /// Forces an ephemeral in-memory store and elevated logging
    Test,
}

/// Core wrapper tunables
#[derive(Debug, Clone)]
pub struct WrapperConfig {
    /// Upper bound on one orchestration step during startup
    pub timeout_ms: u64,
    /// Analysis channel capacity (chunks) and frame buffer sizing
    pub buffer_size: usize,
    /// Total graceful-shutdown window before forced kill
    pub graceful_shutdown_ms: u64,
}

impl Default for WrapperConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            buffer_size: 1_024,
            graceful_shutdown_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PluginsConfig {
    pub directory: PathBuf,
    /// Overrides every manifest timeout when set
    pub timeout_ms: Option<u64>,
    /// Retry budget for persisting plugin-produced records
    pub retry_attempts: u32,
    /// When set, only these plugins load
    pub enabled_plugins: Option<Vec<String>>,
    pub disabled_plugins: Vec<String>,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            directory: data_dir().join("plugins"),
            timeout_ms: None,
            retry_attempts: 3,
            enabled_plugins: None,
            disabled_plugins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// "sqlite" or "memory"
    pub kind: String,
    pub path: PathBuf,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub wal_mode: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            kind: "sqlite".to_string(),
            path: data_dir().join("observations.db"),
            batch_size: 50,
            flush_interval_ms: 1_000,
            wal_mode: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitoringConfig {
    pub enabled: bool,
    /// trace, debug, info, warn, error
    pub log_level: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_level: "info".to_string(),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub mode: Option<Mode>,
    /// The wrapped tool's executable
    pub binary_path: Option<String>,
    pub wrapper: WrapperConfig,
    pub plugins: PluginsConfig,
    pub database: DatabaseConfig,
    pub monitoring: MonitoringConfig,
}

impl Config {
    /// Resolved mode; development unless told otherwise.
    pub fn mode(&self) -> Mode {
        self.mode.unwrap_or(Mode::Development)
    }

    pub fn binary(&self) -> &str {
        self.binary_path.as_deref().unwrap_or("claude")
    }

    pub fn store_kind(&self) -> StoreKind {
        if self.database.kind == "memory" || self.mode() == Mode::Test {
            StoreKind::Memory
        } else {
            StoreKind::File {
                path: self.database.path.clone(),
                wal: self.database.wal_mode,
            }
        }
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.database.flush_interval_ms)
    }

    pub fn graceful_shutdown(&self) -> Duration {
        Duration::from_millis(self.wrapper.graceful_shutdown_ms)
    }

    /// Defaults, then file, then env. CLI flags are applied by the caller.
    pub fn load() -> Self {
        let mut config = Config::default();
        if let Some(file) = ConfigFile::read(&Self::config_path()) {
            config.apply_file(file);
        }
        config.apply_env(&|name| std::env::var(name).ok());
        config
    }

    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("codetap")
            .join("config.json")
    }

    pub fn apply_file(&mut self, file: ConfigFile) {
        if let Some(wrapper) = file.wrapper {
            if let Some(v) = wrapper.timeout_ms {
                self.wrapper.timeout_ms = v;
            }
            if let Some(v) = wrapper.buffer_size {
                self.wrapper.buffer_size = v;
            }
            if let Some(v) = wrapper.graceful_shutdown_ms {
                self.wrapper.graceful_shutdown_ms = v;
            }
        }
        if let Some(plugins) = file.plugins {
            if let Some(v) = plugins.directory {
                self.plugins.directory = v;
            }
            if let Some(v) = plugins.timeout_ms {
                self.plugins.timeout_ms = Some(v);
            }
            if let Some(v) = plugins.retry_attempts {
                self.plugins.retry_attempts = v;
            }
            if let Some(v) = plugins.enabled_plugins {
                self.plugins.enabled_plugins = Some(v);
            }
            if let Some(v) = plugins.disabled_plugins {
                self.plugins.disabled_plugins = v;
            }
        }
        if let Some(database) = file.database {
            if let Some(v) = database.kind {
                self.database.kind = v;
            }
            if let Some(v) = database.path {
                self.database.path = v;
            }
            if let Some(v) = database.batch_size {
                self.database.batch_size = v;
            }
            if let Some(v) = database.flush_interval_ms {
                self.database.flush_interval_ms = v;
            }
            if let Some(v) = database.wal_mode {
                self.database.wal_mode = v;
            }
        }
        if let Some(monitoring) = file.monitoring {
            if let Some(v) = monitoring.enabled {
                self.monitoring.enabled = v;
            }
            if let Some(v) = monitoring.log_level {
                self.monitoring.log_level = v;
            }
        }
    }

    /// Environment overrides. The lookup is injected so tests don't mutate
    /// process state.
    pub fn apply_env(&mut self, lookup: &dyn Fn(&str) -> Option<String>) {
        if let Some(mode) = lookup("WRAPPER_MODE") {
            self.mode = match mode.as_str() {
                "development" => Some(Mode::Development),
                "production" => Some(Mode::Production),
                "test" => Some(Mode::Test),
                other => {
                    tracing::warn!("ignoring unknown WRAPPER_MODE {other:?}");
                    self.mode
                }
            };
        }
        if let Some(dir) = lookup("WRAPPER_PLUGINS_DIR") {
            self.plugins.directory = PathBuf::from(dir);
        }
        if let Some(path) = lookup("WRAPPER_DB_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(level) = lookup("WRAPPER_LOG_LEVEL") {
            self.monitoring.log_level = level;
        }
        if let Some(timeout) = lookup("WRAPPER_PLUGIN_TIMEOUT_MS") {
            match timeout.parse() {
                Ok(v) => self.plugins.timeout_ms = Some(v),
                Err(_) => tracing::warn!("ignoring non-numeric WRAPPER_PLUGIN_TIMEOUT_MS"),
            }
        }
        if let Some(retries) = lookup("WRAPPER_PLUGIN_RETRIES") {
            match retries.parse() {
                Ok(v) => self.plugins.retry_attempts = v,
                Err(_) => tracing::warn!("ignoring non-numeric WRAPPER_PLUGIN_RETRIES"),
            }
        }
        if lookup("WRAPPER_TEST_MODE").is_some_and(|v| v == "1" || v == "true") {
            self.mode = Some(Mode::Test);
        }
        if self.mode == Some(Mode::Test) {
            self.database.kind = "memory".to_string();
            self.monitoring.log_level = "debug".to_string();
        }
    }

    /// JSON template with the built-in defaults, for `config --reset`.
    pub fn default_template() -> serde_json::Value {
        let d = Config::default();
        serde_json::json!({
            "wrapper": {
                "timeoutMs": d.wrapper.timeout_ms,
                "bufferSize": d.wrapper.buffer_size,
                "gracefulShutdownMs": d.wrapper.graceful_shutdown_ms,
            },
            "plugins": {
                "directory": d.plugins.directory,
                "retryAttempts": d.plugins.retry_attempts,
                "enabledPlugins": serde_json::Value::Null,
                "disabledPlugins": [],
            },
            "database": {
                "kind": d.database.kind,
                "path": d.database.path,
                "batchSize": d.database.batch_size,
                "flushIntervalMs": d.database.flush_interval_ms,
                "walMode": d.database.wal_mode,
            },
            "monitoring": {
                "enabled": d.monitoring.enabled,
                "logLevel": d.monitoring.log_level,
            },
        })
    }
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("codetap")
}

// ─────────────────────────────────────────────────────────────────────────────
// On-disk shape: every field optional so partial files merge over defaults
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFile {
    pub wrapper: Option<WrapperFile>,
    pub plugins: Option<PluginsFile>,
    pub database: Option<DatabaseFile>,
    pub monitoring: Option<MonitoringFile>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WrapperFile {
    pub timeout_ms: Option<u64>,
    pub buffer_size: Option<usize>,
    pub graceful_shutdown_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginsFile {
    pub directory: Option<PathBuf>,
    pub timeout_ms: Option<u64>,
    pub retry_attempts: Option<u32>,
    pub enabled_plugins: Option<Vec<String>>,
    pub disabled_plugins: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseFile {
    pub kind: Option<String>,
    pub path: Option<PathBuf>,
    pub batch_size: Option<usize>,
    pub flush_interval_ms: Option<u64>,
    pub wal_mode: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringFile {
    pub enabled: Option<bool>,
    pub log_level: Option<String>,
}

impl ConfigFile {
    pub fn read(path: &std::path::Path) -> Option<Self> {
        let text = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str(&text) {
            Ok(file) => Some(file),
            Err(err) => {
                tracing::warn!("ignoring malformed config at {}: {err}", path.display());
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.mode(), Mode::Development);
        assert_eq!(config.binary(), "claude");
        assert_eq!(config.database.kind, "sqlite");
        assert!(config.monitoring.enabled);
    }

    #[test]
    fn file_overrides_defaults() {
        let mut config = Config::default();
        let file: ConfigFile = serde_json::from_str(
            r#"{
                "wrapper": {"gracefulShutdownMs": 9000},
                "database": {"batchSize": 7, "walMode": false},
                "plugins": {"disabledPlugins": ["model-advisor"]},
                "monitoring": {"logLevel": "warn"}
            }"#,
        )
        .unwrap();
        config.apply_file(file);

        assert_eq!(config.wrapper.graceful_shutdown_ms, 9_000);
        assert_eq!(config.database.batch_size, 7);
        assert!(!config.database.wal_mode);
        assert_eq!(config.plugins.disabled_plugins, vec!["model-advisor"]);
        assert_eq!(config.monitoring.log_level, "warn");
        // Untouched sections keep defaults
        assert_eq!(config.wrapper.timeout_ms, 30_000);
    }

    #[test]
    fn env_overrides_file() {
        let mut config = Config::default();
        let file: ConfigFile = serde_json::from_str(
            r#"{"monitoring": {"logLevel": "warn"}, "database": {"path": "/from/file.db"}}"#,
        )
        .unwrap();
        config.apply_file(file);
        config.apply_env(&lookup(&[
            ("WRAPPER_LOG_LEVEL", "debug"),
            ("WRAPPER_DB_PATH", "/from/env.db"),
            ("WRAPPER_PLUGIN_TIMEOUT_MS", "250"),
        ]));

        assert_eq!(config.monitoring.log_level, "debug");
        assert_eq!(config.database.path, PathBuf::from("/from/env.db"));
        assert_eq!(config.plugins.timeout_ms, Some(250));
    }

    #[test]
    fn test_mode_forces_memory_store_and_debug_logs() {
        let mut config = Config::default();
        config.apply_env(&lookup(&[("WRAPPER_TEST_MODE", "1")]));
        assert_eq!(config.mode(), Mode::Test);
        assert!(matches!(config.store_kind(), StoreKind::Memory));
        assert_eq!(config.monitoring.log_level, "debug");
    }

    #[test]
    fn unknown_mode_is_ignored() {
        let mut config = Config::default();
        config.apply_env(&lookup(&[("WRAPPER_MODE", "sideways")]));
        assert_eq!(config.mode(), Mode::Development);
    }

    #[test]
    fn malformed_config_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(ConfigFile::read(&path).is_none());
    }
}

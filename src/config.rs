//! TOML configuration for the orgcron daemon.
//!
//! Layered: the file named by `ORGCRON_CONFIG`, then the system location,
//! then compiled-in defaults. Command-line flags override individual values
//! after loading.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const CONFIG_ENV: &str = "ORGCRON_CONFIG";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/orgcron/orgcron.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrgcronConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl OrgcronConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded orgcron configuration");
        Ok(config)
    }

    /// Try, in order: `ORGCRON_CONFIG`, `/etc/orgcron/orgcron.toml`,
    /// compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "ORGCRON_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// An explicit path must load; otherwise fall back through the layers.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => Ok(Self::load_or_default()),
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file. Parent directories are created on open.
    pub database_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/orgcron.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// API
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between resyncs against the store. 0 disables the loop.
    pub reconcile_interval_secs: u64,
    /// Largest `timeoutSeconds` a job may declare.
    pub max_timeout_seconds: u64,
    /// Execution records kept per job. 0 keeps everything.
    pub history_limit_per_job: usize,
    /// How long shutdown waits for cancelled runs to record their outcome.
    pub shutdown_grace_secs: u64,
}

impl SchedulerConfig {
    pub fn reconcile_interval(&self) -> Option<Duration> {
        (self.reconcile_interval_secs > 0).then(|| Duration::from_secs(self.reconcile_interval_secs))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: 60,
            max_timeout_seconds: 3600,
            history_limit_per_job: 500,
            shutdown_grace_secs: 10,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = OrgcronConfig::default();
        assert_eq!(cfg.storage.database_path, PathBuf::from("data/orgcron.db"));
        assert_eq!(cfg.api.bind, "0.0.0.0:8080");
        assert_eq!(cfg.scheduler.reconcile_interval(), Some(Duration::from_secs(60)));
        assert_eq!(cfg.scheduler.max_timeout_seconds, 3600);
        assert_eq!(cfg.scheduler.history_limit_per_job, 500);
        assert_eq!(cfg.scheduler.shutdown_grace(), Duration::from_secs(10));
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_parse_example_toml() {
        let toml_str = r#"
[storage]
database_path = "/var/lib/orgcron/jobs.db"

[api]
bind = "127.0.0.1:9090"

[scheduler]
reconcile_interval_secs = 0
max_timeout_seconds = 900
history_limit_per_job = 50
shutdown_grace_secs = 3

[logging]
level = "debug"
format = "json"
"#;
        let cfg: OrgcronConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.storage.database_path, PathBuf::from("/var/lib/orgcron/jobs.db"));
        assert_eq!(cfg.api.bind, "127.0.0.1:9090");
        assert_eq!(cfg.scheduler.reconcile_interval(), None);
        assert_eq!(cfg.scheduler.max_timeout_seconds, 900);
        assert_eq!(cfg.scheduler.history_limit_per_job, 50);
        assert_eq!(cfg.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let cfg: OrgcronConfig = toml::from_str("[scheduler]\nmax_timeout_seconds = 120\n").unwrap();
        assert_eq!(cfg.scheduler.max_timeout_seconds, 120);
        assert_eq!(cfg.scheduler.reconcile_interval_secs, 60);
        assert_eq!(cfg.api.bind, "0.0.0.0:8080");
    }

    #[test]
    fn test_explicit_path_must_exist() {
        assert!(OrgcronConfig::resolve(Some(Path::new("/nonexistent/orgcron.toml"))).is_err());

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("orgcron.toml");
        std::fs::write(&path, "[api]\nbind = \"127.0.0.1:1\"\n").unwrap();
        let cfg = OrgcronConfig::resolve(Some(&path)).unwrap();
        assert_eq!(cfg.api.bind, "127.0.0.1:1");
    }
}

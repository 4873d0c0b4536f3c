//! Orchestrator configuration.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `.env` / process environment overrides (`MAB_*`). Durations are stored as
//! integer milliseconds or seconds so the TOML stays flat and readable.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Database file name inside the data directory.
pub const DEFAULT_DB_FILE: &str = "database.db";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Root directory for the database and log files.
    pub data_dir: PathBuf,
    pub navigation: NavigationConfig,
    pub registry: RegistryConfig,
    pub scheduler: SchedulerConfig,
    pub store: StoreConfig,
    pub maintenance: MaintenanceConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("multi-account-browser");
        Self {
            data_dir,
            navigation: NavigationConfig::default(),
            registry: RegistryConfig::default(),
            scheduler: SchedulerConfig::default(),
            store: StoreConfig::default(),
            maintenance: MaintenanceConfig::default(),
        }
    }
}

/// Timing for navigation settlement. The grace window absorbs redirect chains;
/// the hard timeout bounds the wait even under continuous redirects.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NavigationConfig {
    pub redirect_grace_ms: u64,
    pub hard_timeout_ms: u64,
}

impl Default for NavigationConfig {
    fn default() -> Self {
        Self {
            redirect_grace_ms: 1_500,
            hard_timeout_ms: 15_000,
        }
    }
}

impl NavigationConfig {
    pub fn redirect_grace(&self) -> Duration {
        Duration::from_millis(self.redirect_grace_ms)
    }

    pub fn hard_timeout(&self) -> Duration {
        Duration::from_millis(self.hard_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Delay before the single layout/focus retry after activation.
    pub focus_retry_delay_ms: u64,
    /// Upper bound on graceful driver teardown before falling back.
    pub close_timeout_ms: u64,
    /// Probe attempts for login-state detection.
    pub login_probe_attempts: u32,
    pub login_probe_initial_backoff_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            focus_retry_delay_ms: 100,
            close_timeout_ms: 5_000,
            login_probe_attempts: 5,
            login_probe_initial_backoff_ms: 500,
        }
    }
}

impl RegistryConfig {
    pub fn focus_retry_delay(&self) -> Duration {
        Duration::from_millis(self.focus_retry_delay_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn login_probe_initial_backoff(&self) -> Duration {
        Duration::from_millis(self.login_probe_initial_backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How often the scheduler looks for due tasks.
    pub poll_interval_ms: u64,
    /// Batch concurrency cap.
    pub max_concurrency: usize,
    /// Pause between consecutive batches within one tick.
    pub batch_pause_ms: u64,
    /// Per-execution deadline for the sync function.
    pub task_timeout_ms: u64,
    pub default_interval_minutes: u32,
    pub default_priority: i32,
    /// Maximum retained credential rotation records.
    pub rotation_history_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10_000,
            max_concurrency: 3,
            batch_pause_ms: 2_000,
            task_timeout_ms: 120_000,
            default_interval_minutes: 30,
            default_priority: 0,
            rotation_history_limit: 100,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn batch_pause(&self) -> Duration {
        Duration::from_millis(self.batch_pause_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub database_file: String,
    pub pool_size: u32,
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_file: DEFAULT_DB_FILE.into(),
            pool_size: 8,
            busy_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub enabled: bool,
    pub repair_interval_secs: u64,
    pub checkpoint_interval_secs: u64,
    pub initial_delay_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            repair_interval_secs: 3_600,
            checkpoint_interval_secs: 600,
            initial_delay_secs: 30,
        }
    }
}

impl OrchestratorConfig {
    /// Load config: defaults, then `path` (if it exists), then env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, AppError> {
        // A missing .env file is the normal case.
        let _ = dotenvy::dotenv();

        let mut config = match path {
            Some(p) if p.exists() => {
                let raw = std::fs::read_to_string(p)?;
                tracing::debug!(path = %p.display(), "Loading config file");
                Self::from_toml_str(&raw)?
            }
            Some(p) => {
                tracing::warn!(path = %p.display(), "Config file not found, using defaults");
                Self::default()
            }
            None => Self::default(),
        };

        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, AppError> {
        Ok(toml::from_str(raw)?)
    }

    /// Apply `MAB_*` overrides. `lookup` is injected so tests don't touch the
    /// process environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("MAB_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(v) = lookup("MAB_MAX_CONCURRENCY") {
            self.scheduler.max_concurrency = parse_env("MAB_MAX_CONCURRENCY", &v)?;
        }
        if let Some(v) = lookup("MAB_POLL_INTERVAL_MS") {
            self.scheduler.poll_interval_ms = parse_env("MAB_POLL_INTERVAL_MS", &v)?;
        }
        if let Some(v) = lookup("MAB_TASK_TIMEOUT_MS") {
            self.scheduler.task_timeout_ms = parse_env("MAB_TASK_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("MAB_REDIRECT_GRACE_MS") {
            self.navigation.redirect_grace_ms = parse_env("MAB_REDIRECT_GRACE_MS", &v)?;
        }
        if let Some(v) = lookup("MAB_NAV_TIMEOUT_MS") {
            self.navigation.hard_timeout_ms = parse_env("MAB_NAV_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("MAB_MAINTENANCE_ENABLED") {
            self.maintenance.enabled = parse_env("MAB_MAINTENANCE_ENABLED", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.scheduler.max_concurrency == 0 {
            return Err(AppError::Config("scheduler.max_concurrency must be at least 1".into()));
        }
        if self.scheduler.poll_interval_ms == 0 {
            return Err(AppError::Config("scheduler.poll_interval_ms must be positive".into()));
        }
        if self.scheduler.default_interval_minutes == 0 {
            return Err(AppError::Config(
                "scheduler.default_interval_minutes must be positive".into(),
            ));
        }
        if self.navigation.hard_timeout_ms < self.navigation.redirect_grace_ms {
            return Err(AppError::Config(
                "navigation.hard_timeout_ms must not be shorter than redirect_grace_ms".into(),
            ));
        }
        if self.store.pool_size == 0 {
            return Err(AppError::Config("store.pool_size must be at least 1".into()));
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.store.database_file)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, AppError> {
    value
        .trim()
        .parse()
        .map_err(|_| AppError::Config(format!("Invalid value for {key}: {value:?}")))
}

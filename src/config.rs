//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.pageaudit.toml` files.

use crate::analyzers::PerformanceThresholds;
use crate::models::ModuleKind;
use crate::queue::QueueSettings;
use crate::retry::RetryPolicy;
use crate::worker::WorkerSettings;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE: &str = ".pageaudit.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Status store settings.
    #[serde(default)]
    pub store: StoreConfig,

    /// Asset store settings.
    #[serde(default)]
    pub assets: AssetsConfig,

    /// Job queue settings.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Page capture settings.
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Analyzer pool settings.
    #[serde(default)]
    pub analyzers: AnalyzersConfig,

    /// Per-tenant limits.
    #[serde(default)]
    pub quota: QuotaConfig,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Tenant the CLI submits analyses for.
    #[serde(default = "default_tenant")]
    pub tenant: String,

    /// How long the CLI waits for an analysis before cancelling it.
    #[serde(default = "default_deadline")]
    pub deadline_seconds: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            tenant: default_tenant(),
            deadline_seconds: default_deadline(),
        }
    }
}

impl GeneralConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_seconds.max(1))
    }
}

fn default_tenant() -> String {
    "local".to_string()
}

fn default_deadline() -> u64 {
    600
}

/// Status store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// sqlx SQLite connection URL.
    #[serde(default = "default_database_url")]
    pub database_url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// How long a writer waits on a locked database.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            max_connections: default_max_connections(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

fn default_database_url() -> String {
    "sqlite://pageaudit.db".to_string()
}

fn default_max_connections() -> u32 {
    8
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

/// Asset store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetsConfig {
    /// Directory captured pages are written under, or `:memory:` to keep
    /// them in process memory for the duration of the run.
    #[serde(default = "default_assets_root")]
    pub root: String,
}

impl AssetsConfig {
    pub fn in_memory(&self) -> bool {
        self.root == ":memory:"
    }
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            root: default_assets_root(),
        }
    }
}

fn default_assets_root() -> String {
    ".pageaudit/assets".to_string()
}

/// Job queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Delay before the first redelivery of a failed task.
    #[serde(default = "default_redelivery_base_ms")]
    pub redelivery_base_ms: u64,

    #[serde(default = "default_redelivery_max_ms")]
    pub redelivery_max_ms: u64,

    /// Deliveries before a task is dead-lettered.
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redelivery_base_ms: default_redelivery_base_ms(),
            redelivery_max_ms: default_redelivery_max_ms(),
            max_deliveries: default_max_deliveries(),
        }
    }
}

fn default_redelivery_base_ms() -> u64 {
    500
}

fn default_redelivery_max_ms() -> u64 {
    30_000
}

fn default_max_deliveries() -> u32 {
    5
}

impl QueueConfig {
    pub fn settings(&self) -> QueueSettings {
        QueueSettings {
            redelivery_base: Duration::from_millis(self.redelivery_base_ms),
            redelivery_max: Duration::from_millis(self.redelivery_max_ms),
            max_deliveries: self.max_deliveries.max(1),
        }
    }
}

/// Page capture settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Number of fetch workers.
    #[serde(default = "default_fetch_concurrency")]
    pub concurrency: usize,

    /// Request timeout in seconds.
    #[serde(default = "default_fetch_timeout")]
    pub timeout_seconds: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Capture attempts before the analysis fails.
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Backoff before the second attempt; doubled for each later one.
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            concurrency: default_fetch_concurrency(),
            timeout_seconds: default_fetch_timeout(),
            user_agent: default_user_agent(),
            retries: default_retries(),
            retry_base_ms: default_retry_base_ms(),
        }
    }
}

fn default_fetch_concurrency() -> usize {
    2
}

fn default_fetch_timeout() -> u64 {
    30
}

fn default_user_agent() -> String {
    format!("pageaudit/{}", env!("CARGO_PKG_VERSION"))
}

fn default_retries() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    500
}

/// Analyzer pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzersConfig {
    /// Workers per analysis module.
    #[serde(default = "default_analyzer_concurrency")]
    pub concurrency: usize,

    /// Time one module may spend on a page, in seconds.
    #[serde(default = "default_analyzer_timeout")]
    pub timeout_seconds: u64,

    /// Modules run for every analysis.
    #[serde(default = "default_modules")]
    pub enabled: Vec<String>,

    /// Performance module limits.
    #[serde(default)]
    pub performance: PerformanceThresholds,
}

impl Default for AnalyzersConfig {
    fn default() -> Self {
        Self {
            concurrency: default_analyzer_concurrency(),
            timeout_seconds: default_analyzer_timeout(),
            enabled: default_modules(),
            performance: PerformanceThresholds::default(),
        }
    }
}

fn default_analyzer_concurrency() -> usize {
    2
}

fn default_analyzer_timeout() -> u64 {
    60
}

fn default_modules() -> Vec<String> {
    ModuleKind::ALL.iter().map(|m| m.id().to_string()).collect()
}

impl AnalyzersConfig {
    /// Enabled modules, parsed and deduplicated in catalog order.
    pub fn modules(&self) -> Result<Vec<ModuleKind>> {
        let mut modules = self
            .enabled
            .iter()
            .map(|name| name.parse::<ModuleKind>().map_err(anyhow::Error::msg))
            .collect::<Result<Vec<_>>>()
            .context("Invalid [analyzers] enabled list")?;
        modules.sort();
        modules.dedup();
        Ok(modules)
    }
}

/// Per-tenant limits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Maximum unfinished analyses per tenant; 0 disables the check.
    #[serde(default)]
    pub max_active_per_tenant: u64,
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(CONFIG_FILE);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings, but only
    /// when they were given explicitly.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(ref tenant) = args.tenant {
            self.general.tenant = tenant.clone();
        }
        if let Some(ref database_url) = args.database_url {
            self.store.database_url = database_url.clone();
        }
        if let Some(ref assets_dir) = args.assets_dir {
            self.assets.root = assets_dir.display().to_string();
        }
        if let Some(ref modules) = args.modules {
            self.analyzers.enabled = modules.clone();
        }
        if let Some(concurrency) = args.concurrency {
            self.analyzers.concurrency = concurrency;
        }
        if let Some(timeout) = args.timeout {
            self.analyzers.timeout_seconds = timeout;
        }
        if let Some(timeout) = args.fetch_timeout {
            self.fetch.timeout_seconds = timeout;
        }
    }

    /// Worker pool settings derived from the fetch and analyzer sections.
    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            fetch_concurrency: self.fetch.concurrency.max(1),
            analyzer_concurrency: self.analyzers.concurrency.max(1),
            analyzer_timeout: Duration::from_secs(self.analyzers.timeout_seconds.max(1)),
            capture_retry: RetryPolicy::new(
                self.fetch.retries,
                Duration::from_millis(self.fetch.retry_base_ms),
                Duration::from_secs(self.fetch.timeout_seconds.max(1)),
            ),
            store_retry: RetryPolicy::default(),
            max_deliveries: self.queue.settings().max_deliveries,
        }
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.general.tenant, "local");
        assert_eq!(config.general.deadline(), Duration::from_secs(600));
        assert_eq!(config.store.database_url, "sqlite://pageaudit.db");
        assert_eq!(config.queue.max_deliveries, 5);
        assert_eq!(config.analyzers.modules().unwrap(), ModuleKind::ALL.to_vec());
        assert_eq!(config.quota.max_active_per_tenant, 0);
        assert!(!config.assets.in_memory());
    }

    #[test]
    fn test_parse_config() {
        let toml_content = r#"
[general]
deadline_seconds = 90

[store]
database_url = "sqlite:///var/lib/pageaudit/status.db"

[analyzers]
concurrency = 4
enabled = ["perf", "a11y", "accessibility"]

[analyzers.performance]
max_scripts = 5

[assets]
root = ":memory:"

[quota]
max_active_per_tenant = 10
"#;

        let config: Config = toml::from_str(toml_content).unwrap();
        assert_eq!(config.general.deadline(), Duration::from_secs(90));
        assert_eq!(config.general.tenant, "local");
        assert_eq!(
            config.store.database_url,
            "sqlite:///var/lib/pageaudit/status.db"
        );
        assert_eq!(config.store.max_connections, 8);
        assert_eq!(config.analyzers.concurrency, 4);
        assert_eq!(
            config.analyzers.modules().unwrap(),
            vec![ModuleKind::Accessibility, ModuleKind::Performance]
        );
        assert_eq!(config.analyzers.performance.max_scripts, 5);
        assert_eq!(config.analyzers.performance.slow_response_ms, 3000);
        assert_eq!(config.quota.max_active_per_tenant, 10);
        assert!(config.assets.in_memory());
    }

    #[test]
    fn test_unknown_module_is_an_error() {
        let mut config = Config::default();
        config.analyzers.enabled = vec!["seo".to_string()];
        assert!(config.analyzers.modules().is_err());
    }

    #[test]
    fn test_worker_settings() {
        let mut config = Config::default();
        config.fetch.retries = 4;
        config.analyzers.timeout_seconds = 0;
        config.queue.max_deliveries = 0;

        let settings = config.worker_settings();
        assert_eq!(settings.capture_retry.max_attempts, 4);
        assert_eq!(settings.max_deliveries, 1);
        assert_eq!(settings.analyzer_timeout, Duration::from_secs(1));
        assert_eq!(
            config.queue.settings().redelivery_base,
            Duration::from_millis(500)
        );
    }

    #[test]
    fn test_default_toml_generation() {
        let toml_str = Config::default_toml();
        assert!(!toml_str.is_empty());
        assert!(toml_str.contains("[general]"));
        assert!(toml_str.contains("[store]"));
        assert!(toml_str.contains("[analyzers.performance]"));

        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.fetch.timeout_seconds, 30);
    }
}

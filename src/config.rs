use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::distribution::PushType;
use crate::error::{PublishError, Result};

/// Worker pool sizing and cadence.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Number of concurrent workers per job
    pub workers: usize,
    /// Post a progress message every this many processed documents
    pub progress_every: usize,
    /// How often the controller polls worker liveness
    pub poll_interval_ms: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            progress_every: 100,
            poll_interval_ms: 100,
        }
    }
}

impl WorkerPoolConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Per-worker self-throttling.
///
/// When `max_docs_per_sec` is set and a worker has processed documents faster
/// than that over the last `window_ms`, it sleeps for `pause_ms` before
/// claiming the next one.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub max_docs_per_sec: Option<f64>,
    pub window_ms: u64,
    pub pause_ms: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_docs_per_sec: None,
            window_ms: 1000,
            pause_ms: 500,
        }
    }
}

/// Output tree settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Delay before the single retry of a failed document write
    pub retry_delay_ms: u64,
    /// Doctype whose documents carry a binary blob instead of filtered text
    pub media_doctype: String,
    /// Name of the media manifest written at the top of the output tree
    pub manifest_name: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: 1000,
            media_doctype: "Media".to_string(),
            manifest_name: "media_catalog.txt".to_string(),
        }
    }
}

/// Downstream gateway connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Base URL of the gateway's HTTP endpoint (e.g. "http://gk.example:8080")
    pub base_url: Option<String>,
    /// Seconds between status polls while a push waits for operator approval
    pub approval_poll_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            approval_poll_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Timeout applied to every repository query
    pub query_timeout_secs: u64,
    /// JSON fixture backing the in-memory repository
    pub fixture: Option<PathBuf>,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            query_timeout_secs: 60,
            fixture: None,
        }
    }
}

impl RepositoryConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}

/// Process-level configuration, read once at startup.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// SQLite URL of the job store (e.g. "sqlite://pub.db?mode=rwc")
    pub database_url: String,
    pub workers: WorkerPoolConfig,
    pub throttle: ThrottleConfig,
    pub output: OutputConfig,
    pub gateway: GatewayConfig,
    pub repository: RepositoryConfig,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://docpub.db?mode=rwc".to_string(),
            workers: WorkerPoolConfig::default(),
            throttle: ThrottleConfig::default(),
            output: OutputConfig::default(),
            gateway: GatewayConfig::default(),
            repository: RepositoryConfig::default(),
        }
    }
}

impl PublisherConfig {
    /// Load from a TOML file. Missing sections fall back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| PublishError::Config(e.to_string()))
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers.workers = workers;
        self
    }
}

/// How many errors a job tolerates before it is aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorBudget {
    #[default]
    Unlimited,
    /// Abort as soon as the count exceeds this value (0 = first error aborts)
    Max(u32),
}

impl ErrorBudget {
    /// Negative values mean "never abort".
    pub fn from_setting(value: i64) -> Self {
        if value < 0 {
            ErrorBudget::Unlimited
        } else {
            ErrorBudget::Max(u32::try_from(value).unwrap_or(u32::MAX))
        }
    }

    pub fn is_exceeded_by(&self, count: u32) -> bool {
        match self {
            ErrorBudget::Unlimited => false,
            ErrorBudget::Max(max) => count > *max,
        }
    }
}

/// What to do with documents whose only problems are warnings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WarningPolicy {
    #[default]
    Publish,
    Reject,
}

/// Distribution settings for jobs that push to the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributionSettings {
    pub push_type: PushType,
    pub target: String,
    pub description: Option<String>,
}

/// Typed job options, resolved once when the job is loaded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOptions {
    pub validate: bool,
    pub push_all_docs: bool,
    pub report_only: bool,
    pub abort_on_error: ErrorBudget,
    pub publish_if_warnings: WarningPolicy,
    pub per_doctype_max_errors: BTreeMap<String, u32>,
    /// Block the push until an operator releases it
    pub interactive: bool,
    /// Adopt the gateway's last job ID instead of failing on a mismatch
    pub ignore_last_job_mismatch: bool,
    pub distribution: Option<DistributionSettings>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_pool_config_default() {
        let cfg = WorkerPoolConfig::default();
        assert_eq!(cfg.workers, 4);
        assert_eq!(cfg.progress_every, 100);
        assert_eq!(cfg.poll_interval(), Duration::from_millis(100));
    }

    #[test]
    fn throttle_disabled_by_default() {
        let cfg = ThrottleConfig::default();
        assert!(cfg.max_docs_per_sec.is_none());
        assert_eq!(cfg.window_ms, 1000);
        assert_eq!(cfg.pause_ms, 500);
    }

    #[test]
    fn output_config_default() {
        let cfg = OutputConfig::default();
        assert_eq!(cfg.retry_delay_ms, 1000);
        assert_eq!(cfg.media_doctype, "Media");
        assert_eq!(cfg.manifest_name, "media_catalog.txt");
    }

    #[test]
    fn gateway_config_default_polls_every_ten_seconds() {
        let cfg = GatewayConfig::default();
        assert!(cfg.base_url.is_none());
        assert_eq!(cfg.approval_poll_secs, 10);
    }

    #[test]
    fn publisher_config_from_partial_toml() {
        let cfg = PublisherConfig::from_toml(
            r#"
            database_url = "sqlite::memory:"

            [workers]
            workers = 8

            [throttle]
            max_docs_per_sec = 40.0

            [gateway]
            base_url = "http://127.0.0.1:9000"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.database_url, "sqlite::memory:");
        assert_eq!(cfg.workers.workers, 8);
        assert_eq!(cfg.workers.progress_every, 100);
        assert_eq!(cfg.throttle.max_docs_per_sec, Some(40.0));
        assert_eq!(cfg.gateway.base_url.as_deref(), Some("http://127.0.0.1:9000"));
        assert_eq!(cfg.gateway.approval_poll_secs, 10);
        assert_eq!(cfg.repository.query_timeout_secs, 60);
    }

    #[test]
    fn publisher_config_rejects_bad_toml() {
        let err = PublisherConfig::from_toml("workers = [").unwrap_err();
        assert!(matches!(err, PublishError::Config(_)));
    }

    #[test]
    fn publisher_config_with_workers() {
        let cfg = PublisherConfig::default().with_workers(2);
        assert_eq!(cfg.workers.workers, 2);
    }

    #[test]
    fn error_budget_from_setting() {
        assert_eq!(ErrorBudget::from_setting(-1), ErrorBudget::Unlimited);
        assert_eq!(ErrorBudget::from_setting(0), ErrorBudget::Max(0));
        assert_eq!(ErrorBudget::from_setting(7), ErrorBudget::Max(7));
    }

    #[test]
    fn error_budget_boundary() {
        let budget = ErrorBudget::Max(3);
        assert!(!budget.is_exceeded_by(3));
        assert!(budget.is_exceeded_by(4));

        let first_error = ErrorBudget::Max(0);
        assert!(!first_error.is_exceeded_by(0));
        assert!(first_error.is_exceeded_by(1));

        assert!(!ErrorBudget::Unlimited.is_exceeded_by(u32::MAX));
    }
}

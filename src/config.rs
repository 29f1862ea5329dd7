use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::index::{PipelineSettings, ReconcilePolicy};
use crate::jobs::LeasePolicy;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub callindex: CallIndexConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub http_server: HttpServerConfig,
}

/// Paths and process-level settings
#[derive(Debug, Clone, Deserialize)]
pub struct CallIndexConfig {
    /// Root directory holding one sub-directory per agent.
    pub recordings_root: PathBuf,
    pub db_path: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_migrations_dir")]
    pub migrations_dir: PathBuf,
}

/// Indexing pipeline tuning
#[derive(Debug, Clone, Deserialize)]
pub struct IndexingConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub mtime_slack_secs: u64,
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_probe_duration")]
    pub probe_duration: bool,
    /// Base URL for playback links, e.g. `https://media.example.com/play`.
    #[serde(default)]
    pub playback_base_url: Option<String>,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            extensions: default_extensions(),
            mtime_slack_secs: 0,
            job_timeout_secs: default_job_timeout_secs(),
            workers: default_workers(),
            probe_duration: default_probe_duration(),
            playback_base_url: None,
        }
    }
}

/// Deletion reconciliation cadence
#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileConfig {
    /// Minimum seconds between reconciliation passes (0 = every run)
    #[serde(default)]
    pub interval_secs: u64,
    #[serde(default = "default_full_interval_secs")]
    pub full_interval_secs: u64,
    #[serde(default = "default_window_days")]
    pub window_days: u32,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: 0,
            full_interval_secs: default_full_interval_secs(),
            window_days: default_window_days(),
        }
    }
}

/// Job claim lease and retry backoff
#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            lease_secs: default_lease_secs(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_cap_secs: default_backoff_cap_secs(),
        }
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HttpServerConfig {
    #[serde(default = "default_http_port")]
    pub port: u16,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            port: default_http_port(),
            allowed_origins: Vec::new(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_migrations_dir() -> PathBuf {
    PathBuf::from("migrations")
}

fn default_batch_size() -> usize {
    500
}

fn default_extensions() -> Vec<String> {
    ["wav", "mp3", "ogg", "gsm", "m4a", "flac"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_job_timeout_secs() -> u64 {
    600
}

fn default_workers() -> usize {
    4
}

fn default_probe_duration() -> bool {
    true
}

fn default_full_interval_secs() -> u64 {
    24 * 60 * 60
}

fn default_window_days() -> u32 {
    30
}

fn default_lease_secs() -> u64 {
    1800
}

fn default_backoff_base_secs() -> u64 {
    60
}

fn default_backoff_cap_secs() -> u64 {
    3600
}

fn default_http_port() -> u16 {
    8080
}

/// Upper bound on rows written per transaction.
const MAX_BATCH_SIZE: usize = 5000;

impl Config {
    /// Load configuration from file
    ///
    /// Loads environment variables from .env file (if present) before loading config.
    /// Looks for config file in this order:
    /// 1. Path specified in CALLINDEX_CONFIG environment variable
    /// 2. ./config.toml in current directory
    pub fn load() -> Result<Self> {
        let _ = dotenv::dotenv();

        let config_path = std::env::var("CALLINDEX_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.toml"));

        Self::load_from(&config_path)
    }

    /// Load and validate configuration from an explicit path
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: Config = toml::from_str(&config_str)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        let root = &self.callindex.recordings_root;
        if !root.exists() {
            anyhow::bail!(
                "recordings_root path does not exist: {}. Set recordings_root in config.toml to the agent directory root.",
                root.display()
            );
        }

        if !root.is_dir() {
            anyhow::bail!("recordings_root must be a directory, not a file: {}", root.display());
        }

        if self.indexing.batch_size == 0 || self.indexing.batch_size > MAX_BATCH_SIZE {
            anyhow::bail!("indexing.batch_size must be between 1 and {}", MAX_BATCH_SIZE);
        }

        if self.indexing.workers == 0 {
            anyhow::bail!("indexing.workers must be greater than 0");
        }

        if self.indexing.extensions.is_empty() {
            anyhow::bail!("indexing.extensions must list at least one file extension");
        }

        if self.indexing.job_timeout_secs == 0 {
            anyhow::bail!("indexing.job_timeout_secs must be greater than 0");
        }

        if self.indexing.job_timeout_secs >= self.coordinator.lease_secs {
            anyhow::bail!(
                "indexing.job_timeout_secs ({}) must be less than coordinator.lease_secs ({})",
                self.indexing.job_timeout_secs,
                self.coordinator.lease_secs
            );
        }

        if self.coordinator.backoff_base_secs > self.coordinator.backoff_cap_secs {
            anyhow::bail!("coordinator.backoff_base_secs must not exceed backoff_cap_secs");
        }

        if let Some(base) = &self.indexing.playback_base_url {
            let url = Url::parse(base)
                .with_context(|| format!("indexing.playback_base_url is not a valid URL: {}", base))?;
            if url.cannot_be_a_base() {
                anyhow::bail!("indexing.playback_base_url cannot be used as a base URL: {}", base);
            }
        }

        Ok(())
    }

    /// Get database path
    pub fn db_path(&self) -> &Path {
        &self.callindex.db_path
    }

    /// Get the directory holding one sub-directory per agent
    pub fn recordings_root(&self) -> &Path {
        &self.callindex.recordings_root
    }

    pub fn migrations_dir(&self) -> &Path {
        &self.callindex.migrations_dir
    }

    /// Settings consumed by the per-agent indexing pipeline
    pub fn pipeline_settings(&self) -> PipelineSettings {
        let playback_base_url = self
            .indexing
            .playback_base_url
            .as_deref()
            .and_then(|u| Url::parse(u).ok());

        PipelineSettings {
            batch_size: self.indexing.batch_size,
            extensions: self
                .indexing
                .extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
            mtime_slack: chrono::Duration::seconds(self.indexing.mtime_slack_secs as i64),
            job_timeout: std::time::Duration::from_secs(self.indexing.job_timeout_secs),
            probe_duration: self.indexing.probe_duration,
            playback_base_url,
            reconcile: ReconcilePolicy {
                interval: chrono::Duration::seconds(self.reconcile.interval_secs as i64),
                full_interval: chrono::Duration::seconds(self.reconcile.full_interval_secs as i64),
                window: chrono::Duration::days(self.reconcile.window_days as i64),
            },
        }
    }

    /// Claim lease and retry policy for the job coordinator
    pub fn lease_policy(&self) -> LeasePolicy {
        LeasePolicy {
            lease: chrono::Duration::seconds(self.coordinator.lease_secs as i64),
            backoff_base: chrono::Duration::seconds(self.coordinator.backoff_base_secs as i64),
            backoff_cap: chrono::Duration::seconds(self.coordinator.backoff_cap_secs as i64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Serialize config tests that mutate process-wide env so they don't race.
    static CONFIG_TEST_LOCK: Mutex<()> = Mutex::new(());

    fn create_test_config(temp_dir: &TempDir, extra: &str) -> String {
        let root = temp_dir.path().canonicalize().unwrap();
        let root_str = root.to_str().unwrap().replace('\\', "\\\\");
        format!(
            r#"
[callindex]
recordings_root = "{}"
db_path = "./test.db"
log_level = "debug"

{}
"#,
            root_str, extra
        )
    }

    fn write_config(temp_dir: &TempDir, extra: &str) -> PathBuf {
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, create_test_config(temp_dir, extra)).unwrap();
        path
    }

    #[test]
    fn test_config_defaults_applied() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_config(&temp_dir, "");
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.callindex.log_level, "debug");
        assert_eq!(config.indexing.batch_size, 500);
        assert_eq!(config.indexing.workers, 4);
        assert!(config.indexing.extensions.contains(&"wav".to_string()));
        assert_eq!(config.reconcile.window_days, 30);
        assert_eq!(config.migrations_dir(), Path::new("migrations"));
    }

    #[test]
    fn test_config_sections_override() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_config(
            &temp_dir,
            r#"
[indexing]
batch_size = 1000
extensions = [".WAV"]
workers = 2
playback_base_url = "https://media.example.com/play"

[coordinator]
lease_secs = 900
"#,
        );
        let config = Config::load_from(&path).unwrap();
        let settings = config.pipeline_settings();
        assert_eq!(settings.batch_size, 1000);
        assert_eq!(settings.extensions, vec!["wav".to_string()]);
        assert!(settings.playback_base_url.is_some());
        assert_eq!(config.lease_policy().lease, chrono::Duration::seconds(900));
    }

    #[test]
    fn test_config_rejects_zero_batch() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_config(&temp_dir, "[indexing]\nbatch_size = 0\n");
        let err = Config::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn test_config_rejects_timeout_beyond_lease() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_config(
            &temp_dir,
            "[indexing]\njob_timeout_secs = 100\n\n[coordinator]\nlease_secs = 100\n",
        );
        let err = Config::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("lease_secs"));
    }

    #[test]
    fn test_config_rejects_missing_root() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(
            &path,
            "[callindex]\nrecordings_root = \"/definitely/not/here\"\ndb_path = \"x.db\"\n",
        )
        .unwrap();
        let err = Config::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("recordings_root"));
    }

    #[test]
    fn test_config_load_uses_env_path() {
        let _lock = CONFIG_TEST_LOCK.lock().unwrap();
        let temp_dir = TempDir::new().unwrap();
        let path = write_config(&temp_dir, "");
        let original = std::env::var("CALLINDEX_CONFIG").ok();
        std::env::set_var("CALLINDEX_CONFIG", path.to_str().unwrap());
        let config = Config::load();
        std::env::remove_var("CALLINDEX_CONFIG");
        if let Some(v) = original {
            std::env::set_var("CALLINDEX_CONFIG", v);
        }
        assert!(config.is_ok(), "Config::load() failed: {:?}", config.err());
    }

    #[test]
    fn test_config_invalid_path() {
        let _lock = CONFIG_TEST_LOCK.lock().unwrap();
        let original = std::env::var("CALLINDEX_CONFIG").ok();
        std::env::set_var("CALLINDEX_CONFIG", "nonexistent.toml");
        let config = Config::load();
        assert!(config.is_err());
        std::env::remove_var("CALLINDEX_CONFIG");
        if let Some(v) = original {
            std::env::set_var("CALLINDEX_CONFIG", v);
        }
    }
}

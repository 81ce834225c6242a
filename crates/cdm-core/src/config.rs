use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::retry::RetryPolicy;
use crate::scheduler::SchedulerPolicy;

/// Retry policy parameters (optional section in config.toml).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of connection attempts per download before it is paused.
    pub max_attempts: u32,
    /// Base delay in seconds for exponential backoff (e.g. 0.25 = 250ms).
    pub base_delay_secs: f64,
    /// Maximum backoff delay in seconds.
    pub max_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_secs: 0.25,
            max_delay_secs: 30,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: std::time::Duration::from_secs_f64(self.base_delay_secs.max(0.0)),
            max_delay: std::time::Duration::from_secs(self.max_delay_secs),
        }
    }
}

/// What to do when a finished download fails hash verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyErrorAction {
    /// Re-download only the mismatched byte ranges (needs piece hashes).
    #[default]
    Recover,
    /// Discard all progress and download again.
    Retry,
    /// Cancel the download.
    Cancel,
    /// Keep the file as is and mark the download complete.
    Keep,
}

/// Per-host override, e.g.
///
/// ```toml
/// [[servers]]
/// host = "mirror.example.org"
/// connections = 2
/// segments = 8
/// speed_limit = 500000
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerOverride {
    pub host: String,
    /// Connection ceiling for this host (0 = use the global per-server limit).
    #[serde(default)]
    pub connections: usize,
    /// Default chunk count for downloads from this host (0 = use `max_chunks`).
    #[serde(default)]
    pub segments: usize,
    /// Rate of the per-server bucket in bytes/sec (-1 = unlimited).
    #[serde(default = "unlimited")]
    pub speed_limit: i64,
}

fn unlimited() -> i64 {
    -1
}

/// Global configuration loaded from `~/.config/cdm/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CdmConfig {
    /// Maximum number of downloads running at the same time.
    pub max_in_progress: usize,
    /// Default number of chunks (connections) per download.
    pub max_chunks: usize,
    /// Global bandwidth cap in bytes per second (-1 = unlimited).
    pub speed_limit: i64,
    /// Default per-server bandwidth cap in bytes per second (-1 = unlimited).
    pub per_server_speed_limit: i64,
    /// Chunks are never split below this size.
    pub min_chunk_size: u64,
    /// Bytes carved off the tail of a single-chunk download up front (0 = off).
    pub load_end_first: u64,
    /// Seconds without progress before a running download is retried or canceled.
    pub timeout_secs: u64,
    /// Seconds to wait before an auto-retry requeues a paused download (0 = off).
    pub auto_retry_interval_secs: u64,
    /// Maximum number of auto-retries per download (0 = unlimited).
    pub max_auto_retries: u32,
    /// Maximum connections per server across all downloads (0 = unlimited).
    pub per_server_connection_limit: usize,
    /// Which scheduler picks the next queued download.
    pub scheduler: SchedulerPolicy,
    /// If true, failed downloads are paused (and maybe auto-retried) instead of canceled.
    pub resume_on_error: bool,
    /// Remove completed downloads from the queue automatically.
    pub auto_clear_complete: bool,
    /// Bytes buffered in chunk pipelines before memory pressure kicks in.
    pub max_buffered_bytes: u64,
    /// Default destination directory (None = current directory).
    pub download_dir: Option<PathBuf>,
    /// Renaming mask for new downloads that do not bring their own (None = plain file name).
    pub default_mask: Option<String>,
    /// Action on hash mismatch after completion.
    pub on_verify_error: VerifyErrorAction,
    /// Optional retry policy; if missing, built-in defaults are used.
    pub retry: Option<RetryConfig>,
    /// Per-host overrides.
    pub servers: Vec<ServerOverride>,
}

impl Default for CdmConfig {
    fn default() -> Self {
        Self {
            max_in_progress: 8,
            max_chunks: 4,
            speed_limit: -1,
            per_server_speed_limit: -1,
            min_chunk_size: 128 * 1024,
            load_end_first: 0,
            timeout_secs: 300,
            auto_retry_interval_secs: 300,
            max_auto_retries: 5,
            per_server_connection_limit: 4,
            scheduler: SchedulerPolicy::Fast,
            resume_on_error: false,
            auto_clear_complete: false,
            max_buffered_bytes: 32 * 1024 * 1024,
            download_dir: None,
            default_mask: None,
            on_verify_error: VerifyErrorAction::Recover,
            retry: None,
            servers: Vec::new(),
        }
    }
}

impl CdmConfig {
    /// Clamp nonsensical values instead of failing: any non-positive rate is unlimited,
    /// counts of zero where a count is required become one.
    pub fn normalized(mut self) -> Self {
        self.speed_limit = normalize_rate(self.speed_limit);
        self.per_server_speed_limit = normalize_rate(self.per_server_speed_limit);
        for s in &mut self.servers {
            s.speed_limit = normalize_rate(s.speed_limit);
        }
        self.max_in_progress = self.max_in_progress.max(1);
        self.max_chunks = self.max_chunks.max(1);
        self.min_chunk_size = self.min_chunk_size.max(1);
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.clone().unwrap_or_default().policy()
    }
}

/// Rates of zero or below (other than the documented -1) mean "no limit".
pub fn normalize_rate(rate: i64) -> i64 {
    if rate <= 0 {
        -1
    } else {
        rate
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("cdm")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<CdmConfig> {
    load_or_init_at(&config_path()?)
}

pub fn load_or_init_at(path: &Path) -> Result<CdmConfig> {
    if !path.exists() {
        let default_cfg = CdmConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(path)?;
    let cfg: CdmConfig = toml::from_str(&data)?;
    Ok(cfg.normalized())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let cfg = CdmConfig::default();
        assert_eq!(cfg.max_in_progress, 8);
        assert_eq!(cfg.max_chunks, 4);
        assert_eq!(cfg.speed_limit, -1);
        assert_eq!(cfg.min_chunk_size, 128 * 1024);
        assert_eq!(cfg.timeout_secs, 300);
        assert_eq!(cfg.auto_retry_interval_secs, 300);
        assert_eq!(cfg.max_auto_retries, 5);
        assert_eq!(cfg.per_server_connection_limit, 4);
        assert_eq!(cfg.scheduler, SchedulerPolicy::Fast);
    }

    #[test]
    fn config_toml_roundtrip() {
        let cfg = CdmConfig::default();
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let parsed: CdmConfig = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.max_in_progress, cfg.max_in_progress);
        assert_eq!(parsed.max_chunks, cfg.max_chunks);
        assert_eq!(parsed.scheduler, cfg.scheduler);
        assert_eq!(parsed.on_verify_error, cfg.on_verify_error);
    }

    #[test]
    fn config_toml_partial_uses_defaults() {
        let toml = r#"
            max_in_progress = 2
            scheduler = "fair"
        "#;
        let cfg: CdmConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.max_in_progress, 2);
        assert_eq!(cfg.scheduler, SchedulerPolicy::Fair);
        assert_eq!(cfg.max_chunks, 4);
        assert!(cfg.retry.is_none());
        assert!(cfg.servers.is_empty());
    }

    #[test]
    fn config_toml_servers_and_retry() {
        let toml = r#"
            speed_limit = 0
            on_verify_error = "cancel"

            [retry]
            max_attempts = 3
            base_delay_secs = 0.5
            max_delay_secs = 15

            [[servers]]
            host = "mirror.example.org"
            connections = 2
            segments = 8
        "#;
        let cfg: CdmConfig = toml::from_str::<CdmConfig>(toml).unwrap().normalized();
        assert_eq!(cfg.speed_limit, -1, "zero rate normalizes to unlimited");
        assert_eq!(cfg.on_verify_error, VerifyErrorAction::Cancel);
        let retry = cfg.retry.as_ref().unwrap();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(cfg.retry_policy().max_delay, std::time::Duration::from_secs(15));
        assert_eq!(cfg.servers.len(), 1);
        assert_eq!(cfg.servers[0].connections, 2);
        assert_eq!(cfg.servers[0].segments, 8);
        assert_eq!(cfg.servers[0].speed_limit, -1);
    }

    #[test]
    fn load_or_init_writes_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg").join("config.toml");
        let cfg = load_or_init_at(&path).unwrap();
        assert!(path.exists());
        assert_eq!(cfg.max_chunks, 4);
        let again = load_or_init_at(&path).unwrap();
        assert_eq!(again.max_in_progress, cfg.max_in_progress);
    }
}

//! CLI configuration management.
//!
//! Configuration is stored as TOML:
//! - Linux: `~/.config/uplink/config.toml`
//! - Windows: `%APPDATA%/uplink/config.toml`

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uplink_upload::{RetryPolicy, UploadConfig};

/// Uploader configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Chunk upload endpoint.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Bearer token sent with every chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Chunk size in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Files uploaded at the same time.
    #[serde(default = "default_parallel_files")]
    pub parallel_files: usize,

    /// Chunks in flight per file.
    #[serde(default = "default_parallel_chunks")]
    pub parallel_chunks: usize,

    /// Timeout for one chunk request, in seconds.
    #[serde(default = "default_chunk_timeout")]
    pub chunk_timeout_secs: u64,

    /// Attempts per chunk before the file fails.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Backoff after the first failed attempt, in milliseconds.
    #[serde(default = "default_retry_initial_delay")]
    pub retry_initial_delay_ms: u64,

    /// Backoff cap, in milliseconds.
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,
}

fn default_endpoint() -> String {
    "http://localhost:3000/api/upload".into()
}

fn default_chunk_size() -> u64 {
    UploadConfig::default().chunk_size
}

fn default_parallel_files() -> usize {
    UploadConfig::default().max_parallel_sessions
}

fn default_parallel_chunks() -> usize {
    UploadConfig::default().max_parallel_chunks
}

fn default_chunk_timeout() -> u64 {
    UploadConfig::default().chunk_timeout.as_secs()
}

fn default_retry_attempts() -> u32 {
    RetryPolicy::default().max_attempts
}

fn default_retry_initial_delay() -> u64 {
    RetryPolicy::default().initial_delay.as_millis() as u64
}

fn default_retry_max_delay() -> u64 {
    RetryPolicy::default().max_delay.as_millis() as u64
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            token: None,
            chunk_size: default_chunk_size(),
            parallel_files: default_parallel_files(),
            parallel_chunks: default_parallel_chunks(),
            chunk_timeout_secs: default_chunk_timeout(),
            retry_attempts: default_retry_attempts(),
            retry_initial_delay_ms: default_retry_initial_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
        }
    }
}

impl Config {
    /// Loads configuration from `path` (or the default location), creating
    /// it with defaults if not found.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => config_path()?,
        };

        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let config: Config = toml::from_str(&content)?;
            tracing::debug!(path = %path.display(), "configuration loaded");
            Ok(config)
        } else {
            let config = Config::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Saves the configuration to `path`.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        // The file may hold a token.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Engine configuration derived from the file values.
    pub fn upload_config(&self) -> UploadConfig {
        UploadConfig {
            chunk_size: self.chunk_size,
            max_parallel_sessions: self.parallel_files,
            max_parallel_chunks: self.parallel_chunks,
            chunk_timeout: Duration::from_secs(self.chunk_timeout_secs),
            retry: RetryPolicy {
                max_attempts: self.retry_attempts,
                initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
                max_delay: Duration::from_millis(self.retry_max_delay_ms),
                ..RetryPolicy::default()
            },
        }
    }
}

/// Returns the platform-specific configuration file path.
fn config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        Ok(PathBuf::from(appdata).join("uplink").join("config.toml"))
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        Ok(PathBuf::from(home)
            .join(".config")
            .join("uplink")
            .join("config.toml"))
    }
}

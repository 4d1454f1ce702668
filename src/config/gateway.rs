use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Gateway configuration from `gateway.toml`. Every field has a default, so
/// a missing file or section is fine.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub continuation: ContinuationConfig,
    pub autocrypt: AutocryptConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ContinuationConfig {
    /// How long a paused operation may wait for the user.
    pub ttl_secs: u64,
    /// How long a resume waits for a token that is not there yet.
    pub resume_wait_ms: u64,
    pub max_pending: usize,
}

impl Default for ContinuationConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 600,
            resume_wait_ms: 3_000,
            max_pending: 256,
        }
    }
}

impl ContinuationConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn resume_wait(&self) -> Duration {
        Duration::from_millis(self.resume_wait_ms)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AutocryptConfig {
    /// Days between the last message and the last key after which a direct
    /// key counts as old.
    pub stale_after_days: u64,
}

impl Default for AutocryptConfig {
    fn default() -> Self {
        Self {
            stale_after_days: 35,
        }
    }
}

impl AutocryptConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_days * 24 * 60 * 60)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub socket: Option<PathBuf>,
    /// Longest request line a client may send before it is disconnected.
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket: None,
            max_frame_bytes: 16 * 1024 * 1024,
        }
    }
}

impl GatewayConfig {
    /// Load from `config_path` if given, else from `default_path`.
    /// Returns the default config if the file doesn't exist.
    pub fn load(config_path: Option<&str>, default_path: &Path) -> Result<Self> {
        let path = match config_path {
            Some(p) => PathBuf::from(p),
            None => default_path.to_path_buf(),
        };

        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        Self::from_file(&path)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: GatewayConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Socket path, defaulting to `pgpgate.sock` in the gateway's home.
    pub fn socket_path(&self, home: &Path) -> PathBuf {
        self.server
            .socket
            .clone()
            .unwrap_or_else(|| home.join("pgpgate.sock"))
    }
}

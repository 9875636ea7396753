use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default listen address.
pub const DEFAULT_BIND: &str = "0.0.0.0:50051";

/// Default capacity of every per-session queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// What the router does when a receiver's outbound queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Reject the new envelope for that receiver and count the drop.
    #[default]
    DropNewest,
    /// Wait for space, up to `block_timeout_ms`. A stalled receiver delays
    /// the rest of the broadcast it is part of.
    Block,
}

/// Whether a display name becomes available again once its session ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum NameRelease {
    /// Remove the registry entry on every terminal transition.
    #[default]
    Release,
    /// Keep the entry for the process lifetime; reconnecting under the same
    /// name is rejected.
    Reserve,
}

/// TLS certificate and key locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsFiles {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

/// Server settings, loaded from TOML. Every field has a default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address.
    pub bind: SocketAddr,
    /// Capacity of each session's outbound queue.
    pub outbound_capacity: usize,
    /// Capacity of the channel between a session's receive task and its driver.
    pub inbound_capacity: usize,
    /// Capacity of each session's serial fan-out queue.
    pub fanout_queue_capacity: usize,
    pub overflow: OverflowPolicy,
    /// Upper bound on a blocking enqueue under `OverflowPolicy::Block`.
    pub block_timeout_ms: u64,
    pub name_release: NameRelease,
    /// Time allowed for the registration frame; `None` waits forever.
    pub handshake_timeout_ms: Option<u64>,
    pub tls: Option<TlsFiles>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 50051)),
            outbound_capacity: DEFAULT_QUEUE_CAPACITY,
            inbound_capacity: DEFAULT_QUEUE_CAPACITY,
            fanout_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            overflow: OverflowPolicy::default(),
            block_timeout_ms: 5_000,
            name_release: NameRelease::default(),
            handshake_timeout_ms: Some(10_000),
            tls: None,
        }
    }
}

impl ServerConfig {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(Some(config))
    }

    /// Reject settings that would make channel construction panic.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("outbound_capacity", self.outbound_capacity),
            ("inbound_capacity", self.inbound_capacity),
            ("fanout_queue_capacity", self.fanout_queue_capacity),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{field} must be at least 1")));
            }
        }
        Ok(())
    }

    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_ms.map(Duration::from_millis)
    }
}

/// Errors that can occur when loading config.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {}", .0.display(), .1)]
    ReadFailed(PathBuf, #[source] std::io::Error),
    #[error("failed to parse config {}: {}", .0.display(), .1)]
    ParseFailed(PathBuf, #[source] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

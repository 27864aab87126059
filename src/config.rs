use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::network::{ReconnectPolicy, RetryPolicy};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    ParseError(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the REST backend.
    pub server_url: String,
    /// Realtime event endpoint.
    pub realtime_url: String,
    pub data_dir: String,
    /// Local status endpoint; disabled when unset.
    pub admin_addr: Option<SocketAddr>,
    pub sync: SyncConfig,
    pub realtime: RealtimeConfig,
    pub connectivity: ConnectivityConfig,
    /// Opaque auth token. Only ever read from `ORDERLINE_AUTH_TOKEN`.
    #[serde(skip)]
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub interval_ms: u64,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub submit_timeout_ms: u64,
    pub confirm_grace_ms: u64,
    pub stale_after_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_reconnect_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub flap_threshold: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080/api".to_string(),
            realtime_url: "ws://127.0.0.1:8080/realtime".to_string(),
            data_dir: "./data".to_string(),
            admin_addr: None,
            sync: SyncConfig::default(),
            realtime: RealtimeConfig::default(),
            connectivity: ConnectivityConfig::default(),
            auth_token: None,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            submit_timeout_ms: 10_000,
            confirm_grace_ms: 3_000,
            stale_after_ms: 15 * 60 * 1_000,
        }
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_reconnect_attempts: 5,
        }
    }
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: 3_000,
            probe_timeout_ms: 2_000,
            flap_threshold: 2,
        }
    }
}

impl Config {
    /// Load from a JSON file (defaults when `path` is `None`), then apply
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                serde_json::from_str(&raw)?
            }
            None => Config::default(),
        };
        config.apply_env();
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        if let Ok(token) = std::env::var("ORDERLINE_AUTH_TOKEN") {
            if !token.is_empty() {
                self.auth_token = Some(token);
            }
        }
        if let Ok(url) = std::env::var("ORDERLINE_SERVER_URL") {
            self.server_url = url;
        }
        if let Ok(url) = std::env::var("ORDERLINE_REALTIME_URL") {
            self.realtime_url = url;
        }
        if let Ok(dir) = std::env::var("ORDERLINE_DATA_DIR") {
            self.data_dir = dir;
        }
    }
}

impl SyncConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            submit_timeout: Duration::from_millis(self.submit_timeout_ms),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn confirm_grace(&self) -> Duration {
        Duration::from_millis(self.confirm_grace_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }
}

impl RealtimeConfig {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_reconnect_attempts: self.max_reconnect_attempts,
        }
    }
}

impl ConnectivityConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

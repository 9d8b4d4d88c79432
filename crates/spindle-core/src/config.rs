//! Configuration system for Spindle.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $SPINDLE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/spindle/config.toml
//!   3. ~/.config/spindle/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpindleConfig {
    pub node: NodeConfig,
    pub network: NetworkConfig,
    pub dispatch: DispatchConfig,
    pub relay: RelaySettings,
    pub channel: ChannelSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Dispatcher,
    Relay,
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dispatcher" => Ok(Self::Dispatcher),
            "relay" => Ok(Self::Relay),
            other => Err(format!("unknown role {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Identity used in relay paths, census and registration acks.
    pub name: String,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address downstream peers connect to.
    pub listen_addr: String,
    /// Relay only: the tier above this one.
    pub upstream_addr: String,
    /// Dispatcher only: HTTP dispatch endpoint. Empty = disabled.
    pub http_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// JSON array of parameter objects.
    pub items_path: PathBuf,
    /// 1-based item to start from. Earlier items count as completed.
    pub resume_from: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    pub response_timeout_ms: u64,
    pub retry_sweep_ms: u64,
    /// Resends before the downstream is told the request failed.
    pub max_retries: u32,
    pub heartbeat_ms: u64,
    pub reconnect_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSettings {
    /// Message ids remembered per channel for duplicate suppression.
    pub dedup_capacity: usize,
    pub max_frame_bytes: usize,
    pub close_timeout_ms: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: hostname(),
            role: Role::Dispatcher,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:7420".into(),
            upstream_addr: "127.0.0.1:7420".into(),
            http_addr: "0.0.0.0:8000".into(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            items_path: config_dir().join("items.json"),
            resume_from: 1,
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            response_timeout_ms: 10_000,
            retry_sweep_ms: 2_000,
            max_retries: 5,
            heartbeat_ms: 15_000,
            reconnect_delay_ms: 5_000,
        }
    }
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            dedup_capacity: 1024,
            max_frame_bytes: crate::wire::DEFAULT_MAX_FRAME,
            close_timeout_ms: 2_000,
        }
    }
}

impl RelaySettings {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn retry_sweep(&self) -> Duration {
        Duration::from_millis(self.retry_sweep_ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("spindle")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "spindle".into())
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl SpindleConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::from_toml(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            SpindleConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("SPINDLE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&SpindleConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply SPINDLE_* overrides. `lookup` is `std::env::var` outside tests.
    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(v: Option<String>, slot: &mut T) {
            if let Some(p) = v.and_then(|v| v.parse().ok()) {
                *slot = p;
            }
        }

        if let Some(v) = lookup("SPINDLE_NODE__NAME") {
            self.node.name = v;
        }
        parsed(lookup("SPINDLE_NODE__ROLE"), &mut self.node.role);
        if let Some(v) = lookup("SPINDLE_NETWORK__LISTEN_ADDR") {
            self.network.listen_addr = v;
        }
        if let Some(v) = lookup("SPINDLE_NETWORK__UPSTREAM_ADDR") {
            self.network.upstream_addr = v;
        }
        if let Some(v) = lookup("SPINDLE_NETWORK__HTTP_ADDR") {
            self.network.http_addr = v;
        }
        if let Some(v) = lookup("SPINDLE_DISPATCH__ITEMS_PATH") {
            self.dispatch.items_path = PathBuf::from(v);
        }
        parsed(lookup("SPINDLE_DISPATCH__RESUME_FROM"), &mut self.dispatch.resume_from);
        parsed(
            lookup("SPINDLE_RELAY__RESPONSE_TIMEOUT_MS"),
            &mut self.relay.response_timeout_ms,
        );
        parsed(lookup("SPINDLE_RELAY__RETRY_SWEEP_MS"), &mut self.relay.retry_sweep_ms);
        parsed(lookup("SPINDLE_RELAY__MAX_RETRIES"), &mut self.relay.max_retries);
        parsed(lookup("SPINDLE_RELAY__HEARTBEAT_MS"), &mut self.relay.heartbeat_ms);
        parsed(
            lookup("SPINDLE_RELAY__RECONNECT_DELAY_MS"),
            &mut self.relay.reconnect_delay_ms,
        );
        parsed(
            lookup("SPINDLE_CHANNEL__DEDUP_CAPACITY"),
            &mut self.channel.dedup_capacity,
        );
        parsed(
            lookup("SPINDLE_CHANNEL__MAX_FRAME_BYTES"),
            &mut self.channel.max_frame_bytes,
        );
        parsed(
            lookup("SPINDLE_CHANNEL__CLOSE_TIMEOUT_MS"),
            &mut self.channel.close_timeout_ms,
        );
    }
}

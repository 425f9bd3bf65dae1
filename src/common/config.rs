//! Configuration file handling

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::paths::config_path;
use super::Result;

/// Main configuration structure
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Orchestrator settings
    #[serde(default)]
    pub runner: RunnerConfig,

    /// REST action settings
    #[serde(default)]
    pub http: HttpConfig,

    /// MQTT action settings
    #[serde(default)]
    pub mqtt: MqttConfig,

    /// WebSocket action settings
    #[serde(default)]
    pub websocket: WebSocketConfig,

    /// Sequence diagram output
    #[serde(default)]
    pub diagrams: DiagramConfig,
}

/// Orchestrator settings
#[derive(Debug, Deserialize, Clone)]
pub struct RunnerConfig {
    /// Number of scenarios run concurrently in one batch
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
        }
    }
}

fn default_parallelism() -> usize {
    5
}

/// REST action settings
#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    /// Attempts per request when the transport fails
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Fixed delay between attempts
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,

    /// Per-request timeout
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl HttpConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            retry_attempts: default_retry_attempts(),
            retry_backoff_ms: default_retry_backoff(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_backoff() -> u64 {
    1000
}
fn default_request_timeout() -> u64 {
    30
}

/// MQTT action settings
#[derive(Debug, Deserialize, Clone)]
pub struct MqttConfig {
    /// Keepalive interval sent to the broker
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    /// Fail publish actions when the broker rejects or the connection drops
    #[serde(default)]
    pub strict_publish: bool,

    /// How long a publish waits for the broker's PubAck
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_secs: u64,
}

impl MqttConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            keep_alive_secs: default_keep_alive(),
            strict_publish: false,
            ack_timeout_secs: default_ack_timeout(),
        }
    }
}

fn default_keep_alive() -> u64 {
    60
}
fn default_ack_timeout() -> u64 {
    10
}

/// WebSocket action settings
#[derive(Debug, Deserialize, Clone)]
pub struct WebSocketConfig {
    /// Reconnects allowed after an abnormal closure (1006)
    #[serde(default = "default_max_reconnects")]
    pub max_reconnects: u32,

    /// How long a finished scenario waits for open sockets to close on
    /// their own before cancelling them
    #[serde(default = "default_close_grace")]
    pub close_grace_ms: u64,
}

impl WebSocketConfig {
    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_reconnects: default_max_reconnects(),
            close_grace_ms: default_close_grace(),
        }
    }
}

fn default_max_reconnects() -> u32 {
    3
}
fn default_close_grace() -> u64 {
    5000
}

/// Sequence diagram output
#[derive(Debug, Deserialize, Clone)]
pub struct DiagramConfig {
    /// Whether diagrams are written at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Directory diagrams are written to
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// JSON field names whose values are redacted
    #[serde(default)]
    pub hidden_fields: Vec<String>,

    /// Replace plain-text payloads with a length summary
    #[serde(default)]
    pub hide_plaintext: bool,

    /// Longer text payloads are truncated
    #[serde(default = "default_max_text_length")]
    pub max_text_length: usize,
}

impl Default for DiagramConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            output_dir: default_output_dir(),
            hidden_fields: Vec::new(),
            hide_plaintext: false,
            max_text_length: default_max_text_length(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("diagrams")
}
fn default_max_text_length() -> usize {
    300
}

impl Config {
    /// Load configuration from an explicit path, or the default config file
    ///
    /// Returns default configuration if no file exists
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from(path);
        }
        if let Some(path) = config_path() {
            if path.exists() {
                return Self::load_from(&path);
            }
        }
        Ok(Self::default())
    }

    fn load_from(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| super::Error::file_read(path, e))?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| super::Error::ConfigParse(e.to_string()))?;
        if config.runner.parallelism == 0 {
            return Err(super::Error::ConfigParse(
                "runner.parallelism must be at least 1".to_string(),
            ));
        }
        Ok(config)
    }
}

//! Bridge configuration
//!
//! Centralized configuration management with environment variable support
//! and sensible defaults. The controller reads a [`BridgeConfig`] snapshot at
//! connect time; changes only take effect on the next (re)connect.

use crate::error::BridgeError;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default port for every transport mode
pub const DEFAULT_PORT: u16 = 5001;

/// Default delay between reconnect attempts
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 5;

/// Default timeout for the client socket handshake
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default capacity of the activity log
pub const DEFAULT_LOG_CAPACITY: usize = 100;

/// How the bridge talks to the external process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TransportMode {
    /// Outbound websocket to `ws://{host}:{port}`
    #[default]
    #[serde(rename = "client")]
    ClientSocket,
    /// Listening websocket on `{host}:{port}`, one peer at a time
    #[serde(rename = "server")]
    ServerSocket,
    /// One POST per outbound event to `http://{host}:{port}{path}`
    #[serde(rename = "http")]
    HttpPost,
}

impl TransportMode {
    /// Short name used in settings, env vars and admin commands
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportMode::ClientSocket => "client",
            TransportMode::ServerSocket => "server",
            TransportMode::HttpPost => "http",
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportMode {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "client" | "ws" | "websocket" => Ok(TransportMode::ClientSocket),
            "server" | "listen" => Ok(TransportMode::ServerSocket),
            "http" | "post" => Ok(TransportMode::HttpPost),
            other => Err(BridgeError::InvalidConfig(format!(
                "Unknown transport mode: {}",
                other
            ))),
        }
    }
}

/// Snapshot of everything a transport needs to connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Administrative enable flag
    pub enabled: bool,
    /// Port of the external endpoint (1-65535)
    pub port: u16,
    /// Transport to build on the next connect
    pub transport_mode: TransportMode,
    /// Host name of the external endpoint
    pub host: String,
    /// Request path for HTTP mode
    pub http_path: String,
    /// Fixed delay before a reconnect attempt
    pub retry_delay: Duration,
    /// Handshake timeout for the client socket
    pub connect_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: DEFAULT_PORT,
            transport_mode: TransportMode::ClientSocket,
            host: "localhost".to_string(),
            http_path: "/message".to_string(),
            retry_delay: Duration::from_secs(DEFAULT_RETRY_DELAY_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }
}

impl BridgeConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.port == 0 {
            return Err(BridgeError::InvalidConfig(
                "port must be between 1 and 65535".to_string(),
            ));
        }
        if self.host.trim().is_empty() {
            return Err(BridgeError::InvalidConfig(
                "host cannot be empty".to_string(),
            ));
        }
        if !self.http_path.starts_with('/') {
            return Err(BridgeError::InvalidConfig(format!(
                "http path must start with '/': {}",
                self.http_path
            )));
        }
        Ok(())
    }

    /// Websocket URL for client mode
    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }

    /// POST target for HTTP mode
    pub fn http_url(&self) -> String {
        format!("http://{}:{}{}", self.host, self.port, self.http_path)
    }

    /// Human-readable endpoint for the configured mode
    pub fn endpoint(&self) -> String {
        match self.transport_mode {
            TransportMode::ClientSocket => self.ws_url(),
            TransportMode::ServerSocket => format!("{}:{}", self.host, self.port),
            TransportMode::HttpPost => self.http_url(),
        }
    }

    /// Whether switching from `self` to `other` requires rebuilding the transport
    pub fn endpoint_changed(&self, other: &BridgeConfig) -> bool {
        self.port != other.port
            || self.transport_mode != other.transport_mode
            || self.host != other.host
            || self.http_path != other.http_path
    }
}

/// Process configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Initial bridge configuration
    pub bridge: BridgeConfig,
    /// Where the CLI shell persists settings
    pub settings_path: PathBuf,
    /// Capacity of the activity log ring buffer
    pub log_capacity: usize,
}

impl Config {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = BridgeConfig::default();
        let bridge = BridgeConfig {
            enabled: lookup("BRIDGE_ENABLED")
                .map(|v| matches!(v.trim(), "1" | "true" | "on" | "yes"))
                .unwrap_or(defaults.enabled),
            port: lookup("BRIDGE_PORT")
                .and_then(|p| p.parse().ok())
                .filter(|p: &u16| *p != 0)
                .unwrap_or(defaults.port),
            transport_mode: lookup("BRIDGE_MODE")
                .and_then(|m| m.parse().ok())
                .unwrap_or(defaults.transport_mode),
            host: lookup("BRIDGE_HOST").unwrap_or(defaults.host),
            http_path: lookup("BRIDGE_HTTP_PATH")
                .filter(|p| p.starts_with('/'))
                .unwrap_or(defaults.http_path),
            retry_delay: lookup("BRIDGE_RETRY_DELAY_SECS")
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.retry_delay),
            connect_timeout: lookup("BRIDGE_CONNECT_TIMEOUT_SECS")
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.connect_timeout),
        };

        Self {
            bridge,
            settings_path: lookup("BRIDGE_SETTINGS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| default_settings_path(lookup("HOME"))),
            log_capacity: lookup("BRIDGE_LOG_CAPACITY")
                .and_then(|c| c.parse().ok())
                .filter(|c: &usize| *c > 0)
                .unwrap_or(DEFAULT_LOG_CAPACITY),
        }
    }
}

// ~/.chat-bridge/settings.json, or the current directory without a HOME
fn default_settings_path(home: Option<String>) -> PathBuf {
    match home {
        Some(home) => {
            let mut path = PathBuf::from(home);
            path.push(".chat-bridge");
            path.push("settings.json");
            path
        }
        None => PathBuf::from("settings.json"),
    }
}

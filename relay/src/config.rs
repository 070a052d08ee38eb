//! Configuration for Backhaul Relay
//!
//! Read from `config.yaml` (or a path given on the command line), then
//! overridden by environment variables named after the key path, e.g.
//! `service.port` → `SERVICE_PORT`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::HeaderName;
use backhaul_shared::protocol::IDENTIFIER_HEADER;
use serde::{Deserialize, Serialize};

use crate::session::SessionOptions;

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub service: ServiceConfig,

    #[serde(default)]
    pub tunnel: TunnelConfig,
}

/// Listening socket
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
        }
    }
}

/// Tunnel endpoint and timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// WebSocket path private servers connect to
    #[serde(default = "default_path")]
    pub path: String,

    /// Header naming the target private server on public requests
    #[serde(default = "default_identifier_header")]
    pub identifier_header: String,

    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,

    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// Unset disables the idle check
    #[serde(default)]
    pub idle_timeout_ms: Option<u64>,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            identifier_header: default_identifier_header(),
            probe_interval_ms: default_probe_interval_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            idle_timeout_ms: None,
            request_timeout_ms: default_request_timeout_ms(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

fn default_port() -> u16 {
    8080
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_path() -> String {
    "/ws".to_string()
}

fn default_identifier_header() -> String {
    IDENTIFIER_HEADER.to_string()
}

fn default_probe_interval_ms() -> u64 {
    3_000
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

impl BrokerConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        // An empty file is a valid, all-defaults config
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Search for a config file in the working directory
    pub fn find_config() -> Option<PathBuf> {
        ["config.yaml", "config.yml"]
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }

    /// Apply `SERVICE_PORT`-style overrides from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("SERVICE_PORT") {
            self.service.port = parse_var("SERVICE_PORT", &v)?;
        }
        if let Some(v) = lookup("SERVICE_BIND") {
            self.service.bind = v;
        }
        if let Some(v) = lookup("TUNNEL_PATH") {
            self.tunnel.path = v;
        }
        if let Some(v) = lookup("TUNNEL_IDENTIFIER_HEADER") {
            self.tunnel.identifier_header = v;
        }
        if let Some(v) = lookup("TUNNEL_PROBE_INTERVAL_MS") {
            self.tunnel.probe_interval_ms = parse_var("TUNNEL_PROBE_INTERVAL_MS", &v)?;
        }
        if let Some(v) = lookup("TUNNEL_HANDSHAKE_TIMEOUT_MS") {
            self.tunnel.handshake_timeout_ms = parse_var("TUNNEL_HANDSHAKE_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("TUNNEL_IDLE_TIMEOUT_MS") {
            self.tunnel.idle_timeout_ms = Some(parse_var("TUNNEL_IDLE_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = lookup("TUNNEL_REQUEST_TIMEOUT_MS") {
            self.tunnel.request_timeout_ms = parse_var("TUNNEL_REQUEST_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("TUNNEL_MAX_BODY_BYTES") {
            self.tunnel.max_body_bytes = parse_var("TUNNEL_MAX_BODY_BYTES", &v)?;
        }
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.service.port == 0 {
            anyhow::bail!("service.port cannot be 0");
        }
        if !self.tunnel.path.starts_with('/') {
            anyhow::bail!("tunnel.path must start with '/': {}", self.tunnel.path);
        }
        HeaderName::from_str(&self.tunnel.identifier_header).with_context(|| {
            format!(
                "tunnel.identifier_header is not a valid header name: {}",
                self.tunnel.identifier_header
            )
        })?;

        let timings = [
            ("tunnel.probe_interval_ms", self.tunnel.probe_interval_ms),
            ("tunnel.handshake_timeout_ms", self.tunnel.handshake_timeout_ms),
            ("tunnel.request_timeout_ms", self.tunnel.request_timeout_ms),
            ("tunnel.idle_timeout_ms", self.tunnel.idle_timeout_ms.unwrap_or(1)),
        ];
        for (key, value) in timings {
            if value == 0 {
                anyhow::bail!("{} must be greater than 0", key);
            }
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let addr = format!("{}:{}", self.service.bind, self.service.port);
        addr.parse::<SocketAddr>()
            .with_context(|| format!("Invalid listen address: {}", addr))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.tunnel.request_timeout_ms)
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            probe_interval: Duration::from_millis(self.tunnel.probe_interval_ms),
            handshake_timeout: Duration::from_millis(self.tunnel.handshake_timeout_ms),
            idle_timeout: self.tunnel.idle_timeout_ms.map(Duration::from_millis),
        }
    }
}

fn parse_var<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse::<T>()
        .with_context(|| format!("Invalid value for {}: {}", key, value))
}

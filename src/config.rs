//! Server configuration
//!
//! Defaults are suitable for a local editor session: loopback only, port 8080,
//! authentication disabled. The host application owns persistence; `load` and
//! `save` are provided for hosts that keep the config as a JSON file.
//!
//! ## Environment
//! - `MCP_BRIDGE_ENABLED`: `true`/`false`
//! - `MCP_BRIDGE_PORT`: listen port
//! - `MCP_BRIDGE_BIND`: bind address (default `127.0.0.1`)
//! - `MCP_BRIDGE_API_KEY`: required API key (empty disables auth)
//! - `MCP_BRIDGE_ALLOWED_ORIGINS`: comma-separated Origin allow-list

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{BridgeError, BridgeResult};

pub const DEFAULT_PORT: u16 = 8080;

/// Configuration for [`McpHttpServer`](crate::server::McpHttpServer)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub enabled: bool,
    pub port: u16,
    pub bind_address: IpAddr,
    /// Path the MCP endpoint is served on
    pub path: String,
    /// Empty or missing disables authentication
    pub api_key: Option<String>,
    /// Empty list disables Origin enforcement; `"*"` allows any origin
    pub allowed_origins: Vec<String>,
    /// Upper bound on requests processed by one executor tick
    pub max_requests_per_tick: usize,
    pub max_body_bytes: usize,
    pub request_timeout_secs: u64,
    pub session_idle_timeout_secs: u64,
    pub sse_keepalive_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: DEFAULT_PORT,
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            path: "/".to_string(),
            api_key: None,
            allowed_origins: Vec::new(),
            max_requests_per_tick: 32,
            max_body_bytes: 4 * 1024 * 1024,
            request_timeout_secs: 120,
            session_idle_timeout_secs: 30 * 60,
            sse_keepalive_secs: 15,
        }
    }
}

impl ServerConfig {
    /// Defaults overlaid with `MCP_BRIDGE_*` environment variables
    pub fn from_env() -> BridgeResult<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Overlay `MCP_BRIDGE_*` environment variables onto this config
    pub fn apply_env(&mut self) -> BridgeResult<()> {
        if let Ok(v) = std::env::var("MCP_BRIDGE_ENABLED") {
            self.enabled = parse_bool(&v)
                .ok_or_else(|| BridgeError::Config(format!("MCP_BRIDGE_ENABLED: {v}")))?;
        }
        if let Ok(v) = std::env::var("MCP_BRIDGE_PORT") {
            self.port = v
                .parse()
                .map_err(|_| BridgeError::Config(format!("MCP_BRIDGE_PORT: {v}")))?;
        }
        if let Ok(v) = std::env::var("MCP_BRIDGE_BIND") {
            self.bind_address = v
                .parse()
                .map_err(|_| BridgeError::Config(format!("MCP_BRIDGE_BIND: {v}")))?;
        }
        if let Ok(v) = std::env::var("MCP_BRIDGE_API_KEY") {
            self.api_key = Some(v);
        }
        if let Ok(v) = std::env::var("MCP_BRIDGE_ALLOWED_ORIGINS") {
            self.allowed_origins = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        Ok(())
    }

    /// Load from a JSON file; a missing file yields defaults
    pub fn load(path: impl AsRef<Path>) -> BridgeResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> BridgeResult<()> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text)?;
        Ok(())
    }

    pub fn validate(&self) -> BridgeResult<()> {
        if !self.path.starts_with('/') {
            return Err(BridgeError::Config(format!(
                "path must start with '/': {}",
                self.path
            )));
        }
        if self.max_requests_per_tick == 0 {
            return Err(BridgeError::Config(
                "maxRequestsPerTick must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    /// Configured API key with surrounding whitespace trimmed, treating an
    /// empty key as "auth disabled"
    pub fn effective_api_key(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }

    pub fn sse_keepalive(&self) -> Duration {
        Duration::from_secs(self.sse_keepalive_secs.max(1))
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

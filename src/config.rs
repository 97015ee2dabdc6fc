//! Configuration structures and loading logic

use crate::directory::Endpoint;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

/// Main gateway configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub api_port: u16,
    pub sse_keepalive_secs: u64,
    /// Sessions idle longer than this are ended; `None` disables expiry
    pub session_idle_timeout_secs: Option<u64>,
    pub reaper_interval_secs: u64,
    pub upstream_shutdown_timeout_secs: u64,
    pub endpoints: Vec<Endpoint>,
    pub api_keys: Vec<ApiKeyConfig>,
    pub namespaces: Vec<NamespaceConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            api_port: default_api_port(),
            sse_keepalive_secs: default_sse_keepalive(),
            session_idle_timeout_secs: None,
            reaper_interval_secs: default_reaper_interval(),
            upstream_shutdown_timeout_secs: default_upstream_shutdown_timeout(),
            endpoints: Vec::new(),
            api_keys: Vec::new(),
            namespaces: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            Self::from_toml(&content)?
        } else {
            Self::default()
        };

        // Environment variable overrides
        if let Ok(port) = std::env::var("GATEWAY_API_PORT") {
            config.api_port = port.parse().context("Invalid GATEWAY_API_PORT value")?;
        }
        if let Ok(timeout) = std::env::var("GATEWAY_SESSION_IDLE_TIMEOUT") {
            config.session_idle_timeout_secs = Some(
                timeout
                    .parse()
                    .context("Invalid GATEWAY_SESSION_IDLE_TIMEOUT value")?,
            );
        }

        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse TOML config")
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.api_port < 1024 {
            anyhow::bail!("API port must be >= 1024 (got {})", self.api_port);
        }
        if self.reaper_interval_secs == 0 {
            anyhow::bail!("reaper_interval_secs must be greater than zero");
        }
        if self.sse_keepalive_secs == 0 {
            anyhow::bail!("sse_keepalive_secs must be greater than zero");
        }
        if self.session_idle_timeout_secs == Some(0) {
            anyhow::bail!("session_idle_timeout_secs must be greater than zero when set");
        }

        let mut namespace_ids = HashSet::new();
        for namespace in &self.namespaces {
            if namespace.id.is_empty() {
                anyhow::bail!("Namespace id cannot be empty");
            }
            if namespace.command.is_empty() {
                anyhow::bail!("Namespace '{}' has no command", namespace.id);
            }
            if !namespace_ids.insert(namespace.id.as_str()) {
                anyhow::bail!("Duplicate namespace id: {}", namespace.id);
            }
        }

        let mut names = HashSet::new();
        for endpoint in &self.endpoints {
            if endpoint.name.is_empty() {
                anyhow::bail!("Endpoint name cannot be empty");
            }
            if endpoint.name.contains('/') || endpoint.name.contains('\\') {
                anyhow::bail!(
                    "Endpoint name '{}' cannot contain path separators",
                    endpoint.name
                );
            }
            if !names.insert(endpoint.name.as_str()) {
                anyhow::bail!("Duplicate endpoint name: {}", endpoint.name);
            }
            if !namespace_ids.contains(endpoint.namespace_id.as_str()) {
                anyhow::bail!(
                    "Endpoint '{}' references unknown namespace '{}'",
                    endpoint.name,
                    endpoint.namespace_id
                );
            }
        }

        let mut key_ids = HashSet::new();
        for key in &self.api_keys {
            if key.key.is_empty() {
                anyhow::bail!("API key '{}' has an empty secret", key.key_id);
            }
            if !key_ids.insert(key.key_id.as_str()) {
                anyhow::bail!("Duplicate API key id: {}", key.key_id);
            }
        }

        Ok(())
    }

    pub fn sse_keepalive(&self) -> Duration {
        Duration::from_secs(self.sse_keepalive_secs)
    }

    pub fn session_idle_timeout(&self) -> Option<Duration> {
        self.session_idle_timeout_secs.map(Duration::from_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    pub fn upstream_shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_shutdown_timeout_secs)
    }
}

/// A credential accepted by the built-in key validator
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ApiKeyConfig {
    pub key: String,
    pub key_id: String,
    pub identity: String,

    #[serde(default = "default_active")]
    pub active: bool,
}

/// How to launch the upstream server for a namespace
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct NamespaceConfig {
    pub id: String,
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment for the child process
    #[serde(default)]
    pub env: HashMap<String, String>,
}

// Default functions
fn default_api_port() -> u16 {
    9000
}
fn default_sse_keepalive() -> u64 {
    15
}
fn default_reaper_interval() -> u64 {
    30
}
fn default_upstream_shutdown_timeout() -> u64 {
    10
}
fn default_active() -> bool {
    true
}

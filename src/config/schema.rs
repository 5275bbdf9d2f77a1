//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from the agent's TOML file.

use serde::{Deserialize, Serialize};

/// Root configuration for the agent load balancer.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Logical service name, used in logs and metrics.
    pub service_name: String,

    /// Last-resort server address (`host:port`), always kept in the ring.
    pub default_server: String,

    /// Server URL used to decide whether a proxy applies (e.g. `https://10.0.0.1:6443`).
    /// Derived from `default_server` when empty.
    pub server_url: String,

    /// Known server addresses. Reconciled on every reload.
    pub servers: Vec<String>,

    /// Local listener that forwards to the selected server.
    pub listener: ListenerConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            service_name: "supervisor".to_string(),
            default_server: "127.0.0.1:6443".to_string(),
            server_url: String::new(),
            servers: Vec::new(),
            listener: ListenerConfig::default(),
            timeouts: TimeoutConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl AgentConfig {
    /// URL handed to proxy resolution.
    pub fn effective_server_url(&self) -> String {
        if self.server_url.is_empty() {
            format!("https://{}", self.default_server)
        } else {
            self.server_url.clone()
        }
    }
}

/// Local listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "127.0.0.1:6444").
    pub bind_address: String,

    /// Maximum concurrent forwarded connections (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:6444".to_string(),
            max_connections: 1_000,
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Upstream connection establishment timeout in seconds.
    pub connect_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { connect_secs: 5 }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check server addresses are `host:port`
//! - Validate value ranges (timeouts > 0, limits > 0)
//!
//! Returns all validation errors, not just the first.

use thiserror::Error;

use crate::config::schema::AgentConfig;

/// A single semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("default_server must not be empty")]
    MissingDefaultServer,

    #[error("{field}: {value:?} is not a host:port address")]
    InvalidAddress { field: &'static str, value: String },

    #[error("timeouts.connect_secs must be greater than zero")]
    ZeroConnectTimeout,

    #[error("listener.max_connections must be greater than zero")]
    ZeroMaxConnections,
}

/// Validate a configuration, collecting every error.
pub fn validate_config(config: &AgentConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.default_server.is_empty() {
        errors.push(ValidationError::MissingDefaultServer);
    } else if !is_host_port(&config.default_server) {
        errors.push(ValidationError::InvalidAddress {
            field: "default_server",
            value: config.default_server.clone(),
        });
    }

    for server in &config.servers {
        if !is_host_port(server) {
            errors.push(ValidationError::InvalidAddress {
                field: "servers",
                value: server.clone(),
            });
        }
    }

    if !is_host_port(&config.listener.bind_address) {
        errors.push(ValidationError::InvalidAddress {
            field: "listener.bind_address",
            value: config.listener.bind_address.clone(),
        });
    }

    if config.timeouts.connect_secs == 0 {
        errors.push(ValidationError::ZeroConnectTimeout);
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::ZeroMaxConnections);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn is_host_port(address: &str) -> bool {
    match address.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}

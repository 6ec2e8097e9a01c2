// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for hangar-control.

use std::net::SocketAddr;
use std::time::Duration;

/// Control plane configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server address
    pub http_addr: SocketAddr,
    /// Namespace holding the machines
    pub namespace: String,
    /// Headless service used as the machines' DNS subdomain
    pub service_domain: String,
    /// Storage class for data volume claims (cluster default when unset)
    pub storage_class: Option<String>,
    /// Volume snapshot class (cluster default when unset)
    pub snapshot_class: Option<String>,
    /// Raw `key[:principal]` entries; empty disables authentication
    pub api_keys: Vec<String>,
    /// Health supervisor tick interval
    pub health_interval: Duration,
    /// Tunnel upstream connect timeout
    pub tunnel_connect_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let port: u16 = std::env::var("HANGAR_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let http_addr = SocketAddr::from(([0, 0, 0, 0], port));

        let namespace = std::env::var("HANGAR_NAMESPACE").unwrap_or_else(|_| "hangar".to_string());

        let service_domain = std::env::var("HANGAR_SERVICE_DOMAIN")
            .unwrap_or_else(|_| "hangar-machines".to_string());

        let storage_class = non_empty_var("HANGAR_STORAGE_CLASS");
        let snapshot_class = non_empty_var("HANGAR_SNAPSHOT_CLASS");

        let api_keys = std::env::var("HANGAR_API_KEYS")
            .map(|raw| parse_list(&raw))
            .unwrap_or_default();

        let health_interval = Duration::from_secs(parse_secs("HANGAR_HEALTH_INTERVAL_SECS", 30)?);
        let tunnel_connect_timeout =
            Duration::from_secs(parse_secs("HANGAR_TUNNEL_CONNECT_TIMEOUT_SECS", 60)?);

        Ok(Self {
            http_addr,
            namespace,
            service_domain,
            storage_class,
            snapshot_class,
            api_keys,
            health_interval,
            tunnel_connect_timeout,
        })
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_secs(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber(name)),
        Err(_) => Ok(default),
    }
}

/// Split a comma separated list, dropping blanks.
pub fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The port number is invalid.
    #[error("Invalid port number")]
    InvalidPort,
    /// A numeric variable could not be parsed.
    #[error("Invalid number in environment variable: {0}")]
    InvalidNumber(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list() {
        assert_eq!(
            parse_list(" k1:alice, ,k2 ,"),
            vec!["k1:alice".to_string(), "k2".to_string()]
        );
        assert!(parse_list("").is_empty());
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Invoker configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Locator of the function module (`name` or `builtin:name`)
    pub function_uri: String,
    /// Address the Call server binds to
    pub bind_addr: SocketAddr,
    /// Upper bound for the `init` hook
    pub init_timeout: Duration,
    /// Upper bound for the `destroy` hook
    pub destroy_timeout: Duration,
    /// Upper bound for in-flight Calls to finish once draining starts
    pub drain_timeout: Duration,
    /// Concurrent invocations per request-reply Call
    pub call_concurrency: usize,
}

impl Config {
    /// Configuration with default settings for the given locator.
    pub fn new(function_uri: impl Into<String>) -> Self {
        Self {
            function_uri: function_uri.into(),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8081)),
            init_timeout: Duration::from_millis(10_000),
            destroy_timeout: Duration::from_millis(10_000),
            drain_timeout: Duration::from_millis(10_000),
            call_concurrency: 16,
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `FUNCRUN_FUNCTION_URI`: Locator of the function module
    ///
    /// Optional (with defaults):
    /// - `FUNCRUN_HOST`: Bind address (default: 127.0.0.1)
    /// - `FUNCRUN_PORT`: Bind port (default: 8081)
    /// - `FUNCRUN_INIT_TIMEOUT_MS`: init hook timeout (default: 10000)
    /// - `FUNCRUN_DESTROY_TIMEOUT_MS`: destroy hook timeout (default: 10000)
    /// - `FUNCRUN_DRAIN_TIMEOUT_MS`: drain timeout (default: 10000)
    /// - `FUNCRUN_CALL_CONCURRENCY`: Concurrent invocations per Call (default: 16)
    pub fn from_env() -> Result<Self, ConfigError> {
        let function_uri = std::env::var("FUNCRUN_FUNCTION_URI")
            .ok()
            .filter(|uri| !uri.trim().is_empty())
            .ok_or(ConfigError::Missing("FUNCRUN_FUNCTION_URI"))?;

        let host = std::env::var("FUNCRUN_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let host: IpAddr = if host.eq_ignore_ascii_case("localhost") {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            host.parse()
                .map_err(|_| ConfigError::Invalid("FUNCRUN_HOST", "must be an IP address"))?
        };

        let port: u16 = std::env::var("FUNCRUN_PORT")
            .unwrap_or_else(|_| "8081".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("FUNCRUN_PORT", "must be a valid port number"))?;

        let init_timeout = duration_ms("FUNCRUN_INIT_TIMEOUT_MS", 10_000)?;
        let destroy_timeout = duration_ms("FUNCRUN_DESTROY_TIMEOUT_MS", 10_000)?;
        let drain_timeout = duration_ms("FUNCRUN_DRAIN_TIMEOUT_MS", 10_000)?;

        let call_concurrency: usize = std::env::var("FUNCRUN_CALL_CONCURRENCY")
            .unwrap_or_else(|_| "16".to_string())
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::Invalid(
                "FUNCRUN_CALL_CONCURRENCY",
                "must be a positive integer",
            ))?;

        Ok(Self {
            function_uri,
            bind_addr: SocketAddr::new(host, port),
            init_timeout,
            destroy_timeout,
            drain_timeout,
            call_concurrency,
        })
    }
}

fn duration_ms(key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    let millis: u64 = match std::env::var(key) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::Invalid(key, "must be a number of milliseconds"))?,
        Err(_) => default,
    };
    Ok(Duration::from_millis(millis))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

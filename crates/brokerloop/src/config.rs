// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broker connection configuration.
//!
//! Supports both programmatic and file-based configuration.
//!
//! # Configuration File
//!
//! ```toml
//! url = "amqp://127.0.0.1:5672/"
//! max_frame_size = 1048576
//! poll_timeout_ms = 100
//! log_level = "debug"
//! ```

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::DEFAULT_MAX_FRAME_SIZE;

/// Default broker port.
pub const DEFAULT_PORT: u16 = 5672;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML encode error: {0}")]
    TomlEncode(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Broker client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Broker URL (`amqp://host:port/vhost`).
    #[serde(default = "default_url")]
    pub url: String,

    /// Largest accepted frame payload in bytes.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Bytes read from the socket per `read` call.
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,

    /// Disable Nagle's algorithm on the broker socket.
    #[serde(default = "default_true")]
    pub nodelay: bool,

    /// Reactor poll timeout (milliseconds).
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// Maximum readiness events handled per reactor turn.
    #[serde(default = "default_max_events")]
    pub max_events: usize,

    /// Deadline for blocking start-up waits (milliseconds).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_url() -> String {
    format!("amqp://127.0.0.1:{}/", DEFAULT_PORT)
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

fn default_read_chunk_size() -> usize {
    16 * 1024
}

fn default_true() -> bool {
    true
}

fn default_poll_timeout_ms() -> u64 {
    100
}

fn default_max_events() -> usize {
    128
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            max_frame_size: default_max_frame_size(),
            read_chunk_size: default_read_chunk_size(),
            nodelay: true,
            poll_timeout_ms: default_poll_timeout_ms(),
            max_events: default_max_events(),
            connect_timeout_ms: default_connect_timeout_ms(),
            log_level: default_log_level(),
        }
    }
}

impl BrokerConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration pointing at `url`, defaults elsewhere.
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Render as TOML (used by `gen-config`).
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        BrokerUrl::parse(&self.url).map_err(|e| ConfigError::Invalid(e.to_string()))?;

        if self.max_frame_size == 0 {
            return Err(ConfigError::Invalid("max_frame_size must be > 0".into()));
        }
        if self.read_chunk_size == 0 {
            return Err(ConfigError::Invalid("read_chunk_size must be > 0".into()));
        }
        if self.max_events == 0 {
            return Err(ConfigError::Invalid("max_events must be > 0".into()));
        }
        Ok(())
    }

    /// Parsed broker URL.
    pub fn broker_url(&self) -> Result<BrokerUrl, ConfigError> {
        BrokerUrl::parse(&self.url).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

// ============================================================================
// Broker URL
// ============================================================================

/// Parsed `amqp://host:port/vhost` address.
///
/// `amqp:///` means localhost on the default port with the `/` virtual host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerUrl {
    pub host: String,
    pub port: u16,
    pub virtual_host: String,
}

impl BrokerUrl {
    pub fn parse(url: &str) -> Result<Self, crate::BrokerError> {
        let invalid = |why: &str| crate::BrokerError::InvalidUrl(format!("{}: {}", url, why));

        let rest = url
            .strip_prefix("amqp://")
            .ok_or_else(|| invalid("expected amqp:// scheme"))?;

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx + 1..]),
            None => (rest, ""),
        };

        // Credentials are accepted but not used by the framed client
        let authority = authority.rsplit('@').next().unwrap_or(authority);

        // IPv6 literals come bracketed: [::1]:5672
        let (host, port) = match authority.strip_prefix('[') {
            Some(bracketed) => {
                let (host, after) = bracketed
                    .split_once(']')
                    .ok_or_else(|| invalid("unterminated IPv6 address"))?;
                let port = match after {
                    "" => DEFAULT_PORT,
                    _ => after
                        .strip_prefix(':')
                        .and_then(|port| port.parse::<u16>().ok())
                        .ok_or_else(|| invalid("bad port"))?,
                };
                (host, port)
            }
            None => match authority.rsplit_once(':') {
                Some((host, port)) => {
                    let port = port.parse::<u16>().map_err(|_| invalid("bad port"))?;
                    (host, port)
                }
                None => (authority, DEFAULT_PORT),
            },
        };

        let host = if host.is_empty() { "127.0.0.1" } else { host };
        let virtual_host = if path.is_empty() {
            "/".to_string()
        } else {
            path.replace("%2f", "/").replace("%2F", "/")
        };

        Ok(Self {
            host: host.to_string(),
            port,
            virtual_host,
        })
    }

    /// Resolve to the first socket address.
    pub fn socket_addr(&self) -> Result<SocketAddr, crate::BrokerError> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| crate::BrokerError::InvalidUrl(format!("{} did not resolve", self.host)))
    }
}

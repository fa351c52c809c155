// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types for broker operations.

use std::os::unix::io::RawFd;

use thiserror::Error;

use crate::config::ConfigError;
use crate::types::{BrokerException, Ticket};

/// Result type for broker operations
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors surfaced by the reactor, the connection adapter and the dispatcher.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The broker answered an operation with an error and no context handled it.
    #[error("Broker error on {ticket} ({method}): {exception}")]
    Remote {
        ticket: Ticket,
        method: String,
        exception: BrokerException,
    },

    /// The shared connection is gone. Terminal, there is no reconnect.
    #[error("Broker connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Frame codec error: {0}")]
    Codec(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Descriptor {0} is already registered")]
    AlreadyRegistered(RawFd),

    #[error("Descriptor {0} is not registered")]
    NotRegistered(RawFd),

    /// A session may own a single subscription at a time.
    #[error("Session already owns subscription {0}")]
    AlreadySubscribed(Ticket),

    #[error("Invalid broker URL: {0}")]
    InvalidUrl(String),

    #[error("Timed out waiting for {0}")]
    Timeout(Ticket),
}

impl BrokerError {
    /// Build the error carried by an unhandled broker error response.
    pub fn remote(ticket: Ticket, method: impl Into<String>, exception: BrokerException) -> Self {
        Self::Remote {
            ticket,
            method: method.into(),
            exception,
        }
    }

    /// Check if this error tore down the connection.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, Self::ConnectionClosed(_) | Self::Io(_) | Self::Codec(_))
    }
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Adapter between reactor readiness and a [`BrokerClient`].
//!
//! # State Machine
//!
//! ```text
//!      +----------+
//!      |   Open   |--(error readiness / I/O error / close())--+
//!      +----------+                                           |
//!                                                             v
//!                                                       +----------+
//!                                                       |  Closed  |
//!                                                       +----------+
//! ```
//!
//! Closing is terminal. The descriptor is unregistered from the reactor
//! before the client shuts its socket down.

use std::os::unix::io::RawFd;

use crate::client::BrokerClient;
use crate::error::{BrokerError, Result};
use crate::reactor::{EventHandler, InterestMask, Reactor, Readiness};
use crate::types::{Request, Response};

/// Connection state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Open,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "Open"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// Readiness counters for one connection.
#[derive(Clone, Debug, Default)]
pub struct ConnectionStats {
    pub readable_events: u64,
    pub writable_events: u64,
    pub error_events: u64,
    /// Interest changes pushed to the reactor
    pub mask_updates: u64,
}

/// The single shared broker connection.
pub struct BrokerConnection {
    client: Box<dyn BrokerClient>,
    reactor: Reactor,
    fd: RawFd,
    /// Last mask computed and pushed to the reactor
    mask: InterestMask,
    state: ConnectionState,
    close_reason: Option<String>,
    stats: ConnectionStats,
}

impl BrokerConnection {
    pub fn new(reactor: Reactor, client: Box<dyn BrokerClient>) -> Self {
        let fd = client.fd();
        let mask = InterestMask::for_pending_write(client.needs_write());
        Self {
            client,
            reactor,
            fd,
            mask,
            state: ConnectionState::Open,
            close_reason: None,
            stats: ConnectionStats::default(),
        }
    }

    /// Register the descriptor with the reactor.
    pub fn attach(&mut self, handler: EventHandler) -> Result<()> {
        self.mask = InterestMask::for_pending_write(self.client.needs_write());
        self.reactor.register(self.fd, self.mask, handler)
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    pub fn close_reason(&self) -> Option<&str> {
        self.close_reason.as_deref()
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Mask last pushed to the reactor.
    pub fn mask(&self) -> InterestMask {
        self.mask
    }

    pub fn needs_write(&self) -> bool {
        !self.is_closed() && self.client.needs_write()
    }

    /// Perform the socket I/O for one readiness event.
    ///
    /// Any failure closes the connection; the event is not retried.
    pub fn handle_ready(&mut self, readiness: Readiness) -> Result<()> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        if readiness.error {
            self.stats.error_events += 1;
            let err = BrokerError::ConnectionClosed("socket reported an error".into());
            self.close(&err.to_string());
            return Err(err);
        }

        if let Err(e) = self.do_io(readiness) {
            self.close(&e.to_string());
            return Err(e);
        }
        Ok(())
    }

    fn do_io(&mut self, readiness: Readiness) -> Result<()> {
        if readiness.readable {
            self.stats.readable_events += 1;
            self.client.on_readable()?;
        }
        if readiness.writable {
            self.stats.writable_events += 1;
            self.client.on_writable()?;
        }
        Ok(())
    }

    /// Recompute the interest mask and push it to the reactor if it changed.
    pub fn sync_interest(&mut self) -> Result<bool> {
        if self.is_closed() {
            return Ok(false);
        }
        let mask = InterestMask::for_pending_write(self.client.needs_write());
        if mask == self.mask {
            return Ok(false);
        }
        if let Err(e) = self.reactor.update_mask(self.fd, mask) {
            self.close(&e.to_string());
            return Err(e);
        }
        self.mask = mask;
        self.stats.mask_updates += 1;
        Ok(true)
    }

    /// Hand a request to the client.
    pub fn send(&mut self, request: Request) -> Result<()> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        if let Err(e) = self.client.send(request) {
            self.close(&e.to_string());
            return Err(e);
        }
        Ok(())
    }

    /// Next parsed response. Still yields responses parsed before a close.
    pub fn next_response(&mut self) -> Option<Response> {
        self.client.next_response()
    }

    /// Close the connection. Idempotent.
    pub fn close(&mut self, reason: &str) {
        if self.is_closed() {
            return;
        }
        self.state = ConnectionState::Closed;
        self.close_reason = Some(reason.to_string());

        if let Err(e) = self.reactor.unregister(self.fd) {
            log::debug!("[connection] fd={} unregister: {}", self.fd, e);
        }
        self.client.close();
        log::warn!("[connection] fd={} closed: {}", self.fd, reason);
    }

    fn closed_error(&self) -> BrokerError {
        BrokerError::ConnectionClosed(
            self.close_reason
                .clone()
                .unwrap_or_else(|| "connection closed".into()),
        )
    }
}

impl std::fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("fd", &self.fd)
            .field("state", &self.state)
            .field("mask", &self.mask)
            .field("close_reason", &self.close_reason)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedClient;
    use crate::types::{Operation, Ticket};

    fn publish_request(ticket: u64) -> Request {
        Request {
            ticket: Ticket::new(ticket),
            operation: Operation::Publish {
                exchange: "test".into(),
                routing_key: String::new(),
                body: "hello".into(),
            },
        }
    }

    fn attached() -> (Reactor, BrokerConnection, crate::testing::ScriptHandle) {
        let reactor = Reactor::new().unwrap();
        let (client, script) = ScriptedClient::new();
        let mut conn = BrokerConnection::new(reactor.clone(), Box::new(client));
        conn.attach(Box::new(|_, _, _| {})).unwrap();
        (reactor, conn, script)
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(format!("{}", ConnectionState::Open), "Open");
        assert_eq!(format!("{}", ConnectionState::Closed), "Closed");
    }

    #[test]
    fn test_mask_follows_outbound_buffer() {
        let (reactor, mut conn, _script) = attached();
        assert_eq!(reactor.mask_of(conn.fd()), Some(InterestMask::READ));

        conn.send(publish_request(1)).unwrap();
        assert!(conn.needs_write());
        assert!(conn.sync_interest().unwrap());
        assert_eq!(reactor.mask_of(conn.fd()), Some(InterestMask::READ_WRITE));

        conn.handle_ready(Readiness::WRITABLE).unwrap();
        assert!(!conn.needs_write());
        assert!(conn.sync_interest().unwrap());
        assert_eq!(reactor.mask_of(conn.fd()), Some(InterestMask::READ));

        // Unchanged mask is not pushed again
        assert!(!conn.sync_interest().unwrap());
        assert_eq!(conn.stats().mask_updates, 2);
    }

    #[test]
    fn test_error_readiness_closes() {
        let (reactor, mut conn, script) = attached();
        let fd = conn.fd();

        let err = conn.handle_ready(Readiness::ERROR).unwrap_err();
        assert!(err.is_connection_loss());
        assert!(conn.is_closed());
        assert!(!reactor.is_registered(fd));
        assert!(script.is_closed());

        // Terminal: further events and sends fail
        assert!(conn.handle_ready(Readiness::READABLE).is_err());
        assert!(conn.send(publish_request(2)).is_err());
    }

    #[test]
    fn test_read_failure_closes_without_retry() {
        let (_reactor, mut conn, script) = attached();
        script.fail_next_read("connection reset by peer");

        assert!(conn.handle_ready(Readiness::READABLE).is_err());
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(conn.close_reason(), Some("Broker connection closed: connection reset by peer"));
        assert_eq!(conn.stats().readable_events, 1);
    }

    #[test]
    fn test_close_is_idempotent() {
        let (_reactor, mut conn, _script) = attached();
        conn.close("shutdown");
        conn.close("again");
        assert_eq!(conn.close_reason(), Some("shutdown"));
        assert!(!conn.needs_write());
        assert!(!conn.sync_interest().unwrap());
    }
}

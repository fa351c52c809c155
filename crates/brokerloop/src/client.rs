// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Seam between the connection adapter and a concrete broker client.

use std::os::unix::io::RawFd;

use crate::error::Result;
use crate::types::{Request, Response};

/// A non-blocking broker client driven by readiness events.
///
/// The client owns its socket and its protocol state. It never blocks:
/// reads and writes stop at `WouldBlock`, requests are queued until the
/// socket accepts them, and parsed responses are buffered until the
/// dispatcher pulls them with [`BrokerClient::next_response`].
pub trait BrokerClient {
    /// Descriptor watched by the reactor.
    fn fd(&self) -> RawFd;

    /// Read everything available and parse complete responses.
    ///
    /// Any error means the connection is unusable.
    fn on_readable(&mut self) -> Result<()>;

    /// Flush as much queued output as the socket accepts.
    fn on_writable(&mut self) -> Result<()>;

    /// Whether queued output is waiting for the socket.
    fn needs_write(&self) -> bool;

    /// Queue a request. May write immediately if the socket is writable.
    fn send(&mut self, request: Request) -> Result<()>;

    /// Next fully parsed response, if any.
    fn next_response(&mut self) -> Option<Response>;

    /// Shut the socket down. Further calls are no-ops.
    fn close(&mut self);
}

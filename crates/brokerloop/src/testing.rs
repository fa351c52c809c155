// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Scripted broker client for tests.
//!
//! Backed by a real Unix socket pair so it can be registered with the
//! reactor. Pushing a response writes a wake byte to the peer end; the next
//! `on_readable` consumes the wake bytes and releases the scripted responses.
//! Sent requests stay "in the outbound buffer" until `on_writable`.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::rc::Rc;

use crate::client::BrokerClient;
use crate::error::{BrokerError, Result};
use crate::types::{Request, Response};

#[derive(Default)]
struct Script {
    /// Responses released by the next read
    incoming: VecDeque<Response>,
    /// Responses parsed and waiting for the dispatcher
    parsed: VecDeque<Response>,
    outbound: Vec<Request>,
    sent: Vec<Request>,
    fail_next_read: Option<String>,
    closed: bool,
}

pub struct ScriptedClient {
    local: UnixStream,
    script: Rc<RefCell<Script>>,
}

/// Test-side handle on a [`ScriptedClient`].
#[derive(Clone)]
pub struct ScriptHandle {
    peer: Rc<UnixStream>,
    script: Rc<RefCell<Script>>,
}

impl ScriptedClient {
    pub fn new() -> (Self, ScriptHandle) {
        let (local, peer) = UnixStream::pair().unwrap();
        local.set_nonblocking(true).unwrap();
        peer.set_nonblocking(true).unwrap();
        let script = Rc::new(RefCell::new(Script::default()));
        (
            Self {
                local,
                script: Rc::clone(&script),
            },
            ScriptHandle {
                peer: Rc::new(peer),
                script,
            },
        )
    }
}

impl ScriptHandle {
    /// Queue a response and make the client socket readable.
    pub fn push_response(&self, response: Response) {
        self.script.borrow_mut().incoming.push_back(response);
        // Peer may already be gone after close; the response is still queued
        let _ = (&*self.peer).write(&[1u8]);
    }

    /// Make the next read fail with `reason`.
    pub fn fail_next_read(&self, reason: &str) {
        self.script.borrow_mut().fail_next_read = Some(reason.to_string());
        let _ = (&*self.peer).write(&[1u8]);
    }

    /// Requests flushed to the wire so far.
    pub fn sent(&self) -> Vec<Request> {
        self.script.borrow().sent.clone()
    }

    /// Requests still waiting for a writable event.
    pub fn outbound(&self) -> usize {
        self.script.borrow().outbound.len()
    }

    pub fn is_closed(&self) -> bool {
        self.script.borrow().closed
    }
}

impl BrokerClient for ScriptedClient {
    fn fd(&self) -> RawFd {
        self.local.as_raw_fd()
    }

    fn on_readable(&mut self) -> Result<()> {
        let mut buf = [0u8; 64];
        loop {
            match (&self.local).read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }

        let mut script = self.script.borrow_mut();
        let released: Vec<Response> = script.incoming.drain(..).collect();
        script.parsed.extend(released);
        if let Some(reason) = script.fail_next_read.take() {
            return Err(BrokerError::ConnectionClosed(reason));
        }
        Ok(())
    }

    fn on_writable(&mut self) -> Result<()> {
        let mut script = self.script.borrow_mut();
        let flushed: Vec<Request> = script.outbound.drain(..).collect();
        script.sent.extend(flushed);
        Ok(())
    }

    fn needs_write(&self) -> bool {
        !self.script.borrow().outbound.is_empty()
    }

    fn send(&mut self, request: Request) -> Result<()> {
        self.script.borrow_mut().outbound.push(request);
        Ok(())
    }

    fn next_response(&mut self) -> Option<Response> {
        self.script.borrow_mut().parsed.pop_front()
    }

    fn close(&mut self) {
        let mut script = self.script.borrow_mut();
        if !script.closed {
            script.closed = true;
            script.outbound.clear();
            let _ = self.local.shutdown(Shutdown::Both);
        }
    }
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Single-threaded readiness multiplexer.
//!
//! Wraps a [`mio::Poll`] and dispatches readiness events for registered raw
//! descriptors to their handlers. Everything runs on the thread that calls
//! [`Reactor::turn`]: a handler runs to completion before the next event is
//! dispatched, and may itself update or drop registrations.
//!
//! # Architecture
//!
//! ```text
//! +-------------------------------------------------------------+
//! |                          Reactor                             |
//! |  +-------------------------------------------------------+  |
//! |  |                     mio::Poll                          |  |
//! |  |  - one Token per registered descriptor                |  |
//! |  |  - interest = InterestMask (read | write, error)      |  |
//! |  +-------------------------------------------------------+  |
//! |                              |                               |
//! |                              v                               |
//! |  +-------------------------------------------------------+  |
//! |  |   handler(reactor, fd, Readiness)  (one at a time)     |  |
//! |  +-------------------------------------------------------+  |
//! +-------------------------------------------------------------+
//! ```
//!
//! The handle is a cheap `Rc` clone so handlers and the connection adapter
//! can update registrations while the loop is running.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use mio::event::Event;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::error::{BrokerError, Result};

/// Default poll timeout
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Maximum events to process per poll
pub const MAX_EVENTS: usize = 128;

// ============================================================================
// Interest and readiness
// ============================================================================

/// Interest registered for a descriptor.
///
/// Error readiness is always reported by the OS; `errored` is kept so the
/// mask reads the same as the one the connection adapter computes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InterestMask {
    pub readable: bool,
    pub writable: bool,
    pub errored: bool,
}

impl InterestMask {
    /// Read and error interest.
    pub const READ: Self = Self {
        readable: true,
        writable: false,
        errored: true,
    };

    /// Read, write and error interest.
    pub const READ_WRITE: Self = Self {
        readable: true,
        writable: true,
        errored: true,
    };

    /// Mask for a connection with or without pending outbound data.
    pub fn for_pending_write(needs_write: bool) -> Self {
        if needs_write {
            Self::READ_WRITE
        } else {
            Self::READ
        }
    }

    fn to_interest(self) -> Option<Interest> {
        match (self.readable, self.writable) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

impl fmt::Display for InterestMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = if self.readable { "R" } else { "-" };
        let w = if self.writable { "W" } else { "-" };
        let e = if self.errored { "E" } else { "-" };
        write!(f, "{}{}{}", r, w, e)
    }
}

/// Readiness reported for one descriptor in one turn.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

impl Readiness {
    pub const READABLE: Self = Self {
        readable: true,
        writable: false,
        error: false,
    };

    pub const WRITABLE: Self = Self {
        readable: false,
        writable: true,
        error: false,
    };

    pub const ERROR: Self = Self {
        readable: false,
        writable: false,
        error: true,
    };

    fn from_event(event: &Event) -> Self {
        Self {
            readable: event.is_readable() || event.is_read_closed(),
            writable: event.is_writable(),
            error: event.is_error(),
        }
    }
}

/// Callback run for every readiness event of a registered descriptor.
pub type EventHandler = Box<dyn FnMut(&Reactor, RawFd, Readiness)>;

// ============================================================================
// Reactor
// ============================================================================

struct Entry {
    fd: RawFd,
    mask: InterestMask,
    /// Taken out while the handler runs
    handler: Option<EventHandler>,
}

struct ReactorInner {
    poll: Poll,
    events: Events,
    entries: HashMap<Token, Entry>,
    tokens: HashMap<RawFd, Token>,
    next_token: usize,
    running: bool,
    turns: u64,
    mask_updates: u64,
}

/// Handle to the event loop.
#[derive(Clone)]
pub struct Reactor {
    inner: Rc<RefCell<ReactorInner>>,
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_borrow() {
            Ok(inner) => f
                .debug_struct("Reactor")
                .field("registered", &inner.entries.len())
                .field("running", &inner.running)
                .field("turns", &inner.turns)
                .finish(),
            Err(_) => f.debug_struct("Reactor").finish_non_exhaustive(),
        }
    }
}

impl Reactor {
    /// Create a reactor with the default event capacity.
    pub fn new() -> Result<Self> {
        Self::with_capacity(MAX_EVENTS)
    }

    /// Create a reactor handling at most `max_events` events per turn.
    pub fn with_capacity(max_events: usize) -> Result<Self> {
        let poll = Poll::new()?;
        Ok(Self {
            inner: Rc::new(RefCell::new(ReactorInner {
                poll,
                events: Events::with_capacity(max_events.max(1)),
                entries: HashMap::new(),
                tokens: HashMap::new(),
                next_token: 0,
                running: false,
                turns: 0,
                mask_updates: 0,
            })),
        })
    }

    /// Register `fd` with `mask`; `handler` runs for each readiness event.
    pub fn register(&self, fd: RawFd, mask: InterestMask, handler: EventHandler) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.tokens.contains_key(&fd) {
            return Err(BrokerError::AlreadyRegistered(fd));
        }
        let interest = mask.to_interest().ok_or_else(|| {
            BrokerError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "interest mask needs read or write",
            ))
        })?;

        let token = Token(inner.next_token);
        inner.next_token += 1;
        inner
            .poll
            .registry()
            .register(&mut SourceFd(&fd), token, interest)?;

        inner.tokens.insert(fd, token);
        inner.entries.insert(
            token,
            Entry {
                fd,
                mask,
                handler: Some(handler),
            },
        );
        log::debug!("[reactor] registered fd={} token={} mask={}", fd, token.0, mask);
        Ok(())
    }

    /// Change the interest of a registered descriptor.
    ///
    /// Returns `true` if the OS registration changed.
    pub fn update_mask(&self, fd: RawFd, mask: InterestMask) -> Result<bool> {
        let mut inner = self.inner.borrow_mut();
        let token = *inner.tokens.get(&fd).ok_or(BrokerError::NotRegistered(fd))?;
        let current = inner
            .entries
            .get(&token)
            .map(|e| e.mask)
            .ok_or(BrokerError::NotRegistered(fd))?;
        if current == mask {
            return Ok(false);
        }
        let interest = mask.to_interest().ok_or_else(|| {
            BrokerError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "interest mask needs read or write",
            ))
        })?;

        inner
            .poll
            .registry()
            .reregister(&mut SourceFd(&fd), token, interest)?;
        if let Some(entry) = inner.entries.get_mut(&token) {
            entry.mask = mask;
        }
        inner.mask_updates += 1;
        log::debug!("[reactor] fd={} mask {} -> {}", fd, current, mask);
        Ok(true)
    }

    /// Drop the registration of `fd`. Must run before the descriptor is closed.
    pub fn unregister(&self, fd: RawFd) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        let token = inner.tokens.remove(&fd).ok_or(BrokerError::NotRegistered(fd))?;
        inner.entries.remove(&token);
        if let Err(e) = inner.poll.registry().deregister(&mut SourceFd(&fd)) {
            log::debug!("[reactor] deregister fd={} failed: {}", fd, e);
        }
        log::debug!("[reactor] unregistered fd={}", fd);
        Ok(())
    }

    /// Interest currently registered for `fd`.
    pub fn mask_of(&self, fd: RawFd) -> Option<InterestMask> {
        let inner = self.inner.borrow();
        let token = inner.tokens.get(&fd)?;
        inner.entries.get(token).map(|e| e.mask)
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.inner.borrow().tokens.contains_key(&fd)
    }

    pub fn registered_count(&self) -> usize {
        self.inner.borrow().entries.len()
    }

    /// Number of completed turns.
    pub fn turns(&self) -> u64 {
        self.inner.borrow().turns
    }

    /// Number of OS re-registrations caused by mask changes.
    pub fn mask_updates(&self) -> u64 {
        self.inner.borrow().mask_updates
    }

    /// Poll once and dispatch the ready events.
    ///
    /// Returns the number of handlers invoked.
    pub fn turn(&self, timeout: Option<Duration>) -> Result<usize> {
        let ready: Vec<(Token, Readiness)> = {
            let mut guard = self.inner.borrow_mut();
            let inner = &mut *guard;
            if let Err(e) = inner.poll.poll(&mut inner.events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    return Ok(0);
                }
                return Err(e.into());
            }
            inner.turns += 1;
            inner
                .events
                .iter()
                .map(|event| (event.token(), Readiness::from_event(event)))
                .collect()
        };

        let mut dispatched = 0;
        for (token, readiness) in ready {
            let taken = {
                let mut inner = self.inner.borrow_mut();
                inner
                    .entries
                    .get_mut(&token)
                    .and_then(|entry| entry.handler.take().map(|h| (entry.fd, h)))
            };
            // Unregistered by an earlier handler in this turn
            let Some((fd, mut handler)) = taken else {
                continue;
            };

            handler(self, fd, readiness);
            dispatched += 1;

            if let Some(entry) = self.inner.borrow_mut().entries.get_mut(&token) {
                if entry.handler.is_none() {
                    entry.handler = Some(handler);
                }
            }
        }

        Ok(dispatched)
    }

    /// Turn until [`Reactor::stop`] is called or nothing is registered.
    pub fn run(&self, poll_timeout: Duration) -> Result<()> {
        self.inner.borrow_mut().running = true;
        log::debug!("[reactor] loop started");
        while self.is_running() && self.registered_count() > 0 {
            self.turn(Some(poll_timeout))?;
        }
        self.inner.borrow_mut().running = false;
        log::debug!("[reactor] loop stopped");
        Ok(())
    }

    /// Turn until `done` returns true or `deadline` passes.
    ///
    /// Returns whether `done` was satisfied.
    pub fn run_until<F>(&self, poll_timeout: Duration, deadline: Instant, mut done: F) -> Result<bool>
    where
        F: FnMut() -> bool,
    {
        while !done() {
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            self.turn(Some(poll_timeout.min(deadline - now)))?;
        }
        Ok(true)
    }

    /// Ask [`Reactor::run`] to return after the current turn.
    pub fn stop(&self) {
        self.inner.borrow_mut().running = false;
    }

    pub fn is_running(&self) -> bool {
        self.inner.borrow().running
    }
}

// ============================================================================
// Tests
// ============================================================================

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Request-scoped session.
//!
//! A [`Session`] stands for one external request (for example a long-polling
//! HTTP request) that consumes broker deliveries. It owns at most one
//! subscription and cancels it when the request ends.
//!
//! ```text
//!   ALIVE --(finish / error teardown)--> DEAD
//! ```

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use serde_json::Value;

use crate::dispatcher::Dispatcher;
use crate::error::{BrokerError, Result};
use crate::guard::{remote_error, LogicalContext, Scope};
use crate::types::{ConsumeOptions, Response, Ticket};

/// What a session does with a broker error on one of its operations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Cancel the owned subscription and end the session.
    #[default]
    Teardown,
    /// No handler: the error propagates to the processing chain.
    Propagate,
}

#[derive(Debug)]
pub struct Session {
    alive: Cell<bool>,
    owned: Cell<Option<Ticket>>,
    policy: ErrorPolicy,
    /// Broker error that ended the session under [`ErrorPolicy::Teardown`]
    error: RefCell<Option<BrokerError>>,
}

impl Session {
    pub fn new() -> Rc<Self> {
        Self::with_policy(ErrorPolicy::default())
    }

    pub fn with_policy(policy: ErrorPolicy) -> Rc<Self> {
        Rc::new(Self {
            alive: Cell::new(true),
            owned: Cell::new(None),
            policy,
            error: RefCell::new(None),
        })
    }

    /// Scope for operations submitted on behalf of this session.
    pub fn scope(self: &Rc<Self>) -> Scope {
        Scope::of(self)
    }

    pub fn policy(&self) -> ErrorPolicy {
        self.policy
    }

    pub fn owned_ticket(&self) -> Option<Ticket> {
        self.owned.get()
    }

    /// Take the broker error that tore the session down, if any.
    pub fn take_error(&self) -> Option<BrokerError> {
        self.error.borrow_mut().take()
    }

    /// Record `ticket` as this session's subscription.
    pub fn own(&self, ticket: Ticket) -> Result<()> {
        if let Some(existing) = self.owned.get() {
            return Err(BrokerError::AlreadySubscribed(existing));
        }
        self.owned.set(Some(ticket));
        Ok(())
    }

    /// Consume `queue` and own the resulting subscription.
    pub fn subscribe<F>(
        self: &Rc<Self>,
        ops: &mut Dispatcher,
        queue: &str,
        options: ConsumeOptions,
        on_deliver: F,
    ) -> Result<Ticket>
    where
        F: FnMut(&mut Dispatcher, Value) -> Result<()> + 'static,
    {
        if let Some(existing) = self.owned.get() {
            return Err(BrokerError::AlreadySubscribed(existing));
        }
        let ticket = ops.consume(queue, options, self.scope(), on_deliver)?;
        self.own(ticket)?;
        Ok(ticket)
    }

    /// Cancel the owned subscription, if any. The session stays alive.
    pub fn release(&self, ops: &mut Dispatcher) -> Result<()> {
        if let Some(ticket) = self.owned.take() {
            ops.cancel(ticket)?;
        }
        Ok(())
    }

    /// End the session: the request finished or its transport closed.
    ///
    /// The owned subscription is cancelled, then the session is dead.
    pub fn finish(&self, ops: &mut Dispatcher) -> Result<()> {
        let released = self.release(ops);
        self.alive.set(false);
        released
    }
}

impl LogicalContext for Session {
    fn is_alive(&self) -> bool {
        self.alive.get()
    }

    fn on_broker_error(&self, ops: &mut Dispatcher, response: &Response) -> Result<()> {
        match self.policy {
            ErrorPolicy::Propagate => Err(remote_error(response)),
            ErrorPolicy::Teardown => {
                if let Some(exception) = response.exception() {
                    log::warn!(
                        "[session] broker error on {} ({}): {}, ending session",
                        response.ticket,
                        response.method,
                        exception
                    );
                }
                if let Err(e) = self.finish(ops) {
                    log::debug!("[session] cancel during teardown failed: {}", e);
                }
                let mut first = self.error.borrow_mut();
                if first.is_none() {
                    *first = Some(remote_error(response));
                }
                Ok(())
            }
        }
    }
}

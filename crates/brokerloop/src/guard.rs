// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Callback guard.
//!
//! Every completion callback handed to the dispatcher is wrapped in a
//! [`CallbackGuard`] before it is stored. For each response the guard decides
//! whether the raw callback runs:
//!
//! 1. Error response: the owning context's error handler runs instead of the
//!    callback. A detached operation, or a context without a handler,
//!    propagates the error.
//! 2. Dead context, or a ticket the context already cancelled: the response
//!    is dropped. A subscription delivery dropped this way is logged at warn
//!    level and reported as [`GuardOutcome::Abandoned`]: the context did not
//!    cancel its subscription on teardown.
//! 3. Otherwise the raw callback receives the payload.
//!
//! A context never comes back to life, and everything runs on the reactor
//! thread, so a context that ended is seen as dead by every response
//! processed afterwards.

use std::rc::{Rc, Weak};

use serde_json::Value;

use crate::dispatcher::Dispatcher;
use crate::error::{BrokerError, Result};
use crate::types::{BrokerException, OperationKind, Response, ResponseBody, Ticket};

/// Raw completion callback.
///
/// Receives the dispatcher so it can submit follow-up operations.
pub type Callback = Box<dyn FnMut(&mut Dispatcher, Value) -> Result<()>>;

/// Scope of interest owning outstanding broker operations.
pub trait LogicalContext {
    /// False once the context ended. Never flips back.
    fn is_alive(&self) -> bool;

    /// Handle a broker error for one of this context's operations.
    ///
    /// The default has no handler: the error propagates.
    fn on_broker_error(&self, _ops: &mut Dispatcher, response: &Response) -> Result<()> {
        Err(remote_error(response))
    }
}

/// Owner of an operation, captured at submission time.
#[derive(Clone, Default)]
pub enum Scope {
    /// Process-level operation with no logical context.
    #[default]
    Detached,
    /// Operation owned by a logical context.
    Context(Weak<dyn LogicalContext>),
}

impl Scope {
    pub fn of<C: LogicalContext + 'static>(context: &Rc<C>) -> Self {
        let weak: Weak<C> = Rc::downgrade(context);
        Scope::Context(weak)
    }

    pub fn is_detached(&self) -> bool {
        matches!(self, Scope::Detached)
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::Detached => write!(f, "Detached"),
            Scope::Context(weak) => match weak.upgrade() {
                Some(ctx) if ctx.is_alive() => write!(f, "Context(alive)"),
                Some(_) => write!(f, "Context(dead)"),
                None => write!(f, "Context(dropped)"),
            },
        }
    }
}

/// What the guard did with a response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuardOutcome {
    /// The raw callback ran.
    Delivered,
    /// The context's error handler ran.
    ErrorHandled,
    /// Dropped: dead context or cancelled ticket.
    Suppressed,
    /// Subscription delivery dropped because its context ended without
    /// cancelling the subscription.
    Abandoned,
}

enum Owner {
    Detached,
    Alive(Rc<dyn LogicalContext>),
    Dead,
}

/// A raw callback wrapped with the guard decision procedure.
pub struct CallbackGuard {
    ticket: Ticket,
    kind: OperationKind,
    scope: Scope,
    interested: bool,
    raw: Callback,
}

impl CallbackGuard {
    pub fn wrap(ticket: Ticket, kind: OperationKind, scope: Scope, raw: Callback) -> Self {
        Self {
            ticket,
            kind,
            scope,
            interested: true,
            raw,
        }
    }

    pub fn ticket(&self) -> Ticket {
        self.ticket
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn is_interested(&self) -> bool {
        self.interested
    }

    /// Mark the ticket cancelled by its context.
    pub fn revoke_interest(&mut self) {
        self.interested = false;
    }

    fn owner(&self) -> Owner {
        match &self.scope {
            Scope::Detached => Owner::Detached,
            Scope::Context(weak) => match weak.upgrade() {
                Some(ctx) if ctx.is_alive() => Owner::Alive(ctx),
                _ => Owner::Dead,
            },
        }
    }

    /// Route one response.
    ///
    /// `Err` carries an error the processing chain has to propagate.
    pub fn invoke(&mut self, ops: &mut Dispatcher, response: Response) -> Result<GuardOutcome> {
        let owner = self.owner();

        if let ResponseBody::Error(exception) = &response.body {
            return match owner {
                Owner::Detached => Err(remote_error(&response)),
                Owner::Dead => {
                    log::warn!(
                        "[guard] {} error for dead context dropped: {}",
                        self.ticket,
                        exception
                    );
                    Ok(GuardOutcome::Suppressed)
                }
                Owner::Alive(_) if !self.interested => {
                    log::debug!(
                        "[guard] {} error after cancel dropped: {}",
                        self.ticket,
                        exception
                    );
                    Ok(GuardOutcome::Suppressed)
                }
                Owner::Alive(ctx) => {
                    ctx.on_broker_error(ops, &response)?;
                    Ok(GuardOutcome::ErrorHandled)
                }
            };
        }

        if !self.interested {
            log::debug!("[guard] {} ({}) after cancel dropped", self.ticket, response.method);
            return Ok(GuardOutcome::Suppressed);
        }

        if matches!(owner, Owner::Dead) {
            if self.kind == OperationKind::Subscription && response.is_delivery() {
                log::warn!(
                    "[guard] delivery on {} for a dead context; the subscription was not cancelled on teardown",
                    self.ticket
                );
                return Ok(GuardOutcome::Abandoned);
            }
            log::debug!("[guard] {} ({}) for dead context dropped", self.ticket, response.method);
            return Ok(GuardOutcome::Suppressed);
        }

        let payload = match response.body {
            ResponseBody::Ok(payload) => payload,
            ResponseBody::Error(_) => Value::Null,
        };
        (self.raw)(ops, payload)?;
        Ok(GuardOutcome::Delivered)
    }
}

impl std::fmt::Debug for CallbackGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackGuard")
            .field("ticket", &self.ticket)
            .field("kind", &self.kind)
            .field("scope", &self.scope)
            .field("interested", &self.interested)
            .finish()
    }
}

pub(crate) fn remote_error(response: &Response) -> BrokerError {
    let exception = response
        .exception()
        .cloned()
        .unwrap_or_else(|| BrokerException::new(0, "error response without exception"));
    BrokerError::remote(response.ticket, response.method.clone(), exception)
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Operation dispatcher.
//!
//! Issues broker operations, each under a fresh [`Ticket`], and routes the
//! responses back through the guarded callbacks registered at submission.
//!
//! # Flow
//!
//! ```text
//! reactor event --> BrokerConnection (socket I/O, client parses frames)
//!                          |
//!                          v
//!               Dispatcher::handle_ready
//!                 drain responses (arrival order)
//!                   pending[ticket] --> CallbackGuard --> raw callback
//!                 sync interest mask --> Reactor::update_mask
//! ```
//!
//! One-shot operations retire their ticket with the first response.
//! Subscriptions keep it until their cancel is acknowledged (or an error
//! arrives for them). A response naming a ticket that is not pending is a
//! protocol violation: it is logged and dropped.
//!
//! Callbacks receive `&mut Dispatcher`. They must use it rather than
//! borrowing the shared `Rc<RefCell<Dispatcher>>` handle.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::client::BrokerClient;
use crate::connection::BrokerConnection;
use crate::error::{BrokerError, Result};
use crate::guard::{CallbackGuard, GuardOutcome, Scope};
use crate::reactor::{Reactor, Readiness, DEFAULT_POLL_TIMEOUT};
use crate::types::{
    method, BrokerException, ConsumeOptions, ExchangeKind, Operation, OperationKind, QueueOptions,
    Request, Response, Ticket,
};


/// Hook run once when the connection is lost.
pub type CloseHook = Box<dyn FnMut(&BrokerError)>;

/// Dispatch counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub submitted: u64,
    pub delivered: u64,
    pub error_handled: u64,
    pub errors_propagated: u64,
    pub suppressed: u64,
    /// Deliveries dropped because their context ended without cancelling
    pub dead_context_deliveries: u64,
    pub protocol_violations: u64,
}

impl DispatchStats {
    fn record(&mut self, outcome: &Result<GuardOutcome>) {
        match outcome {
            Ok(GuardOutcome::Delivered) => self.delivered += 1,
            Ok(GuardOutcome::ErrorHandled) => self.error_handled += 1,
            Ok(GuardOutcome::Suppressed) => self.suppressed += 1,
            Ok(GuardOutcome::Abandoned) => {
                self.suppressed += 1;
                self.dead_context_deliveries += 1;
            }
            Err(_) => self.errors_propagated += 1,
        }
    }
}

struct PendingOperation {
    method: &'static str,
    kind: OperationKind,
    created_at: Instant,
    scope: Scope,
    /// Out of the table while its callback runs
    guard: Option<CallbackGuard>,
    cancelled: bool,
    /// Subscription retired when this cancel is acknowledged
    retires: Option<Ticket>,
}

/// Operation whose guard was out running a callback when the connection
/// was lost. Failed once the callback returns.
struct LostInFlight {
    method: &'static str,
    cancelled: bool,
    reason: String,
}

/// Routes broker responses to guarded callbacks.
pub struct Dispatcher {
    conn: BrokerConnection,
    pending: HashMap<Ticket, PendingOperation>,
    lost_in_flight: HashMap<Ticket, LostInFlight>,
    next_ticket: u64,
    stats: DispatchStats,
    unhandled: Vec<(Ticket, BrokerError)>,
    on_close: Option<CloseHook>,
    /// Set while responses are being routed; nested routing is a no-op
    routing: bool,
}

impl Dispatcher {
    /// Wrap `client` and register its descriptor with `reactor`.
    pub fn attach(reactor: &Reactor, client: Box<dyn BrokerClient>) -> Result<Rc<RefCell<Self>>> {
        let dispatcher = Rc::new(RefCell::new(Self::new(BrokerConnection::new(
            reactor.clone(),
            client,
        ))));

        let weak = Rc::downgrade(&dispatcher);
        dispatcher
            .borrow_mut()
            .conn
            .attach(Box::new(move |_reactor, fd, readiness| {
                let Some(dispatcher) = weak.upgrade() else {
                    return;
                };
                match dispatcher.try_borrow_mut() {
                    Ok(mut dispatcher) => dispatcher.handle_ready(readiness),
                    Err(_) => log::error!(
                        "[dispatcher] fd={} event dropped: dispatcher borrowed during reactor turn",
                        fd
                    ),
                };
            }))?;

        Ok(dispatcher)
    }

    fn new(conn: BrokerConnection) -> Self {
        Self {
            conn,
            pending: HashMap::new(),
            lost_in_flight: HashMap::new(),
            next_ticket: 1,
            stats: DispatchStats::default(),
            unhandled: Vec::new(),
            on_close: None,
            routing: false,
        }
    }

    // ========================================================================
    // Submission
    // ========================================================================

    /// Submit `operation`; `on_complete` runs through a guard bound to `scope`.
    pub fn submit<F>(&mut self, operation: Operation, scope: Scope, on_complete: F) -> Result<Ticket>
    where
        F: FnMut(&mut Dispatcher, Value) -> Result<()> + 'static,
    {
        if self.conn.is_closed() {
            return Err(BrokerError::ConnectionClosed(
                self.conn.close_reason().unwrap_or("connection closed").to_string(),
            ));
        }

        let ticket = Ticket::new(self.next_ticket);
        self.next_ticket += 1;

        let method = operation.method_name();
        let kind = operation.kind();
        let retires = match &operation {
            Operation::Cancel { consumer } => Some(*consumer),
            _ => None,
        };
        let guard = CallbackGuard::wrap(ticket, kind, scope.clone(), Box::new(on_complete));

        if let Err(e) = self.conn.send(Request { ticket, operation }) {
            // The adapter closed the connection; fail what is still pending
            self.connection_lost(BrokerError::ConnectionClosed(e.to_string()));
            return Err(e);
        }

        self.pending.insert(
            ticket,
            PendingOperation {
                method,
                kind,
                created_at: Instant::now(),
                scope,
                guard: Some(guard),
                cancelled: false,
                retires,
            },
        );
        self.stats.submitted += 1;
        log::debug!("[dispatcher] {} submitted ({})", ticket, method);

        self.refresh_interest();
        Ok(ticket)
    }

    pub fn connect<F>(&mut self, virtual_host: &str, scope: Scope, on_open: F) -> Result<Ticket>
    where
        F: FnMut(&mut Dispatcher, Value) -> Result<()> + 'static,
    {
        self.submit(
            Operation::Connect {
                virtual_host: virtual_host.to_string(),
            },
            scope,
            on_open,
        )
    }

    pub fn declare_exchange<F>(
        &mut self,
        exchange: &str,
        kind: ExchangeKind,
        scope: Scope,
        on_declared: F,
    ) -> Result<Ticket>
    where
        F: FnMut(&mut Dispatcher, Value) -> Result<()> + 'static,
    {
        self.submit(
            Operation::DeclareExchange {
                exchange: exchange.to_string(),
                kind,
            },
            scope,
            on_declared,
        )
    }

    pub fn declare_queue<F>(&mut self, options: QueueOptions, scope: Scope, on_declared: F) -> Result<Ticket>
    where
        F: FnMut(&mut Dispatcher, Value) -> Result<()> + 'static,
    {
        self.submit(Operation::DeclareQueue(options), scope, on_declared)
    }

    pub fn bind_queue<F>(
        &mut self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        scope: Scope,
        on_bound: F,
    ) -> Result<Ticket>
    where
        F: FnMut(&mut Dispatcher, Value) -> Result<()> + 'static,
    {
        self.submit(
            Operation::BindQueue {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            },
            scope,
            on_bound,
        )
    }

    /// Start a subscription; `on_deliver` runs for every delivery.
    pub fn consume<F>(
        &mut self,
        queue: &str,
        options: ConsumeOptions,
        scope: Scope,
        on_deliver: F,
    ) -> Result<Ticket>
    where
        F: FnMut(&mut Dispatcher, Value) -> Result<()> + 'static,
    {
        self.submit(
            Operation::Consume {
                queue: queue.to_string(),
                options,
            },
            scope,
            on_deliver,
        )
    }

    pub fn publish<F>(
        &mut self,
        exchange: &str,
        routing_key: &str,
        body: impl Into<String>,
        scope: Scope,
        on_confirmed: F,
    ) -> Result<Ticket>
    where
        F: FnMut(&mut Dispatcher, Value) -> Result<()> + 'static,
    {
        self.submit(
            Operation::Publish {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                body: body.into(),
            },
            scope,
            on_confirmed,
        )
    }

    /// Cancel `ticket`.
    ///
    /// The ticket stops delivering immediately. For a subscription a cancel
    /// operation is submitted under the subscription's scope and its ticket
    /// returned; the subscription retires once the broker acknowledges it.
    /// Cancelling an unknown, retired or already cancelled ticket is a no-op.
    pub fn cancel(&mut self, ticket: Ticket) -> Result<Option<Ticket>> {
        let Some(op) = self.pending.get_mut(&ticket) else {
            log::debug!("[dispatcher] cancel of {} ignored: not pending", ticket);
            return Ok(None);
        };
        if op.cancelled {
            log::debug!("[dispatcher] cancel of {} ignored: already cancelled", ticket);
            return Ok(None);
        }

        op.cancelled = true;
        if let Some(guard) = op.guard.as_mut() {
            guard.revoke_interest();
        }
        if op.kind == OperationKind::OneShot {
            log::debug!("[dispatcher] {} ({}) no longer awaited", ticket, op.method);
            return Ok(None);
        }

        let scope = op.scope.clone();
        let cancel = self.submit(Operation::Cancel { consumer: ticket }, scope, |_, _| Ok(()))?;
        log::debug!("[dispatcher] {} cancelling subscription {}", cancel, ticket);
        Ok(Some(cancel))
    }

    // ========================================================================
    // Response routing
    // ========================================================================

    /// Drive one readiness event. Used as the reactor handler.
    ///
    /// Errors that no context handled are logged and kept for
    /// [`Dispatcher::take_unhandled`]; routing continues with the next
    /// response.
    ///
    /// Called from inside a callback, the socket I/O still happens but the
    /// parsed responses are left to the routing loop already running.
    pub fn handle_ready(&mut self, readiness: Readiness) {
        let io = self.conn.handle_ready(readiness);

        // Responses parsed before a failure are still routed
        let _ = self.route(false);

        match io {
            Ok(()) => self.refresh_interest(),
            Err(e) => self.connection_lost(e),
        }
    }

    /// Route every response already parsed by the client.
    ///
    /// Stops at the first error no context handled and returns it. A no-op
    /// when called from inside a callback.
    pub fn drain(&mut self) -> Result<()> {
        let result = self.route(true);
        self.refresh_interest();
        result
    }

    fn route(&mut self, stop_at_error: bool) -> Result<()> {
        if self.routing {
            log::trace!("[dispatcher] nested routing skipped");
            return Ok(());
        }
        self.routing = true;

        let mut result = Ok(());
        while let Some(response) = self.conn.next_response() {
            let ticket = response.ticket;
            if let Err(e) = self.dispatch(response) {
                if stop_at_error {
                    result = Err(e);
                    break;
                }
                self.record_unhandled(ticket, e);
            }
        }

        self.routing = false;
        result
    }

    fn dispatch(&mut self, response: Response) -> Result<()> {
        let ticket = response.ticket;
        let Some(op) = self.pending.get_mut(&ticket) else {
            self.stats.protocol_violations += 1;
            if ticket.get() < self.next_ticket {
                log::error!(
                    "[dispatcher] protocol violation: {} ({}) names a retired ticket, dropped",
                    ticket,
                    response.method
                );
            } else {
                log::error!(
                    "[dispatcher] protocol violation: {} ({}) was never issued, dropped",
                    ticket,
                    response.method
                );
            }
            return Ok(());
        };

        if op.kind == OperationKind::Subscription
            && !response.is_error()
            && response.method == method::BASIC_CONSUME_OK
        {
            log::debug!("[dispatcher] subscription {} active", ticket);
            return Ok(());
        }

        let retire = response.is_error() || op.kind == OperationKind::OneShot;
        let cancelled = op.cancelled;
        let (guard, retires) = if retire {
            match self.pending.remove(&ticket) {
                Some(op) => {
                    log::debug!(
                        "[dispatcher] {} ({}) completed after {:?}",
                        ticket,
                        op.method,
                        op.created_at.elapsed()
                    );
                    (op.guard, op.retires)
                }
                None => (None, None),
            }
        } else {
            (op.guard.take(), None)
        };

        let Some(mut guard) = guard else {
            self.stats.protocol_violations += 1;
            log::error!(
                "[dispatcher] {} ({}) arrived while its callback was running, dropped",
                ticket,
                response.method
            );
            return Ok(());
        };
        if cancelled {
            guard.revoke_interest();
        }

        if let Some(consumer) = retires {
            if !response.is_error() && self.pending.remove(&consumer).is_some() {
                log::debug!("[dispatcher] subscription {} retired", consumer);
            }
        }

        let outcome = guard.invoke(self, response);
        self.stats.record(&outcome);

        if !retire {
            match self.pending.get_mut(&ticket) {
                Some(op) => {
                    if op.guard.is_none() {
                        op.guard = Some(guard);
                    }
                }
                None => {
                    if let Some(lost) = self.lost_in_flight.remove(&ticket) {
                        self.fail_lost(ticket, guard, lost);
                    }
                }
            }
        }

        outcome.map(|_| ())
    }

    /// Push the adapter's current interest to the reactor.
    fn refresh_interest(&mut self) {
        if let Err(e) = self.conn.sync_interest() {
            self.connection_lost(e);
        }
    }

    fn record_unhandled(&mut self, ticket: Ticket, error: BrokerError) {
        log::error!("[dispatcher] unhandled: {}", error);
        self.unhandled.push((ticket, error));
    }

    /// Deliver the synthesized connection-lost error through `guard`.
    fn fail_lost(&mut self, ticket: Ticket, mut guard: CallbackGuard, lost: LostInFlight) {
        if lost.cancelled {
            guard.revoke_interest();
        }
        let response = Response::error(ticket, lost.method, BrokerException::connection_lost(&lost.reason));
        let outcome = guard.invoke(self, response);
        self.stats.record(&outcome);
        if let Err(e) = outcome {
            self.record_unhandled(ticket, e);
        }
    }

    /// Terminal: close the connection and fail every pending operation.
    fn connection_lost(&mut self, cause: BrokerError) {
        let reason = cause.to_string();
        self.conn.close(&reason);

        let mut failed: Vec<(Ticket, PendingOperation)> = self.pending.drain().collect();
        failed.sort_by_key(|(ticket, _)| *ticket);
        if !failed.is_empty() {
            log::error!(
                "[dispatcher] connection lost, failing {} pending operations: {}",
                failed.len(),
                reason
            );
        }

        for (ticket, op) in failed {
            let lost = LostInFlight {
                method: op.method,
                cancelled: op.cancelled,
                reason: reason.clone(),
            };
            match op.guard {
                Some(guard) => self.fail_lost(ticket, guard, lost),
                // Its callback is running further up the stack
                None => {
                    self.lost_in_flight.insert(ticket, lost);
                }
            }
        }

        if let Some(mut hook) = self.on_close.take() {
            hook(&cause);
        }
    }

    /// Close the connection, failing everything still pending.
    pub fn shutdown(&mut self, reason: &str) {
        if !self.conn.is_closed() {
            self.connection_lost(BrokerError::ConnectionClosed(reason.to_string()));
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Install the hook run once when the connection is lost.
    pub fn set_close_hook<F>(&mut self, hook: F)
    where
        F: FnMut(&BrokerError) + 'static,
    {
        self.on_close = Some(Box::new(hook));
    }

    /// Errors no context handled while driven by the reactor.
    pub fn take_unhandled(&mut self) -> Vec<BrokerError> {
        std::mem::take(&mut self.unhandled)
            .into_iter()
            .map(|(_, error)| error)
            .collect()
    }

    /// Take the first unhandled error raised for `ticket`, leaving the rest.
    pub fn take_unhandled_for(&mut self, ticket: Ticket) -> Option<BrokerError> {
        let idx = self.unhandled.iter().position(|(t, _)| *t == ticket)?;
        Some(self.unhandled.remove(idx).1)
    }

    pub fn is_pending(&self, ticket: Ticket) -> bool {
        self.pending.contains_key(&ticket)
    }

    pub fn is_cancelled(&self, ticket: Ticket) -> bool {
        self.pending.get(&ticket).is_some_and(|op| op.cancelled)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    pub fn connection(&self) -> &BrokerConnection {
        &self.conn
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("conn", &self.conn)
            .field("pending", &self.pending.len())
            .field("next_ticket", &self.next_ticket)
            .field("stats", &self.stats)
            .finish()
    }
}

/// Turn `reactor` until `ticket` is no longer pending.
///
/// Blocking; meant for process start-up (connect, declarations) before the
/// loop serves requests. Returns the error `ticket` failed with, if no
/// context handled it. Errors for other tickets stay queued for
/// [`Dispatcher::take_unhandled`].
pub fn wait_for(
    reactor: &Reactor,
    dispatcher: &Rc<RefCell<Dispatcher>>,
    ticket: Ticket,
    timeout: Duration,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        {
            let mut d = dispatcher.borrow_mut();
            if let Some(e) = d.take_unhandled_for(ticket) {
                return Err(e);
            }
            if !d.is_pending(ticket) {
                return Ok(());
            }
            if d.is_closed() {
                return Err(BrokerError::ConnectionClosed(
                    d.conn.close_reason().unwrap_or("connection closed").to_string(),
                ));
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(BrokerError::Timeout(ticket));
        }
        reactor.turn(Some(DEFAULT_POLL_TIMEOUT.min(deadline - now)))?;
    }
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Brokerloop: callback-driven broker client on a single-threaded event loop
//!
//! Drives an asynchronous message-broker client from a readiness reactor and
//! routes every broker response to the callback registered for it, guarding
//! each callback against logical contexts (for example one HTTP request)
//! that ended before the response arrived.
//!
//! # Architecture
//!
//! ```text
//! +-------------+   readiness    +------------------+   bytes   +--------------+
//! |   Reactor   | -------------> | BrokerConnection | <-------> | BrokerClient |
//! |  (mio Poll) | <------------- |  (I/O + mask)    |           | (FramedClient)|
//! +-------------+  update_mask   +------------------+           +--------------+
//!                                        |  parsed responses
//!                                        v
//!                               +------------------+
//!                               |    Dispatcher    |  ticket -> PendingOperation
//!                               +------------------+
//!                                        |
//!                                        v
//!                               +------------------+   is_alive / on_broker_error
//!                               |  CallbackGuard   | ---------------------------> LogicalContext
//!                               +------------------+                             (Session)
//!                                        |
//!                                        v
//!                                  raw callback
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use brokerloop::{BrokerConfig, Dispatcher, FramedClient, QueueOptions, Reactor, Scope};
//!
//! # fn main() -> brokerloop::Result<()> {
//! let config = BrokerConfig::default();
//! let reactor = Reactor::new()?;
//! let client = FramedClient::connect(&config)?;
//! let dispatcher = Dispatcher::attach(&reactor, Box::new(client))?;
//!
//! dispatcher.borrow_mut().declare_queue(
//!     QueueOptions::auto_delete(),
//!     Scope::Detached,
//!     |_ops, payload| {
//!         println!("declared {}", payload["queue"]);
//!         Ok(())
//!     },
//! )?;
//!
//! reactor.run(config.poll_timeout())?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod framed;
pub mod guard;
pub mod reactor;
pub mod session;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use client::BrokerClient;
pub use config::{BrokerConfig, BrokerUrl, ConfigError};
pub use connection::{BrokerConnection, ConnectionState, ConnectionStats};
pub use dispatcher::{wait_for, DispatchStats, Dispatcher};
pub use error::{BrokerError, Result};
pub use framed::{FramedClient, FramedStats};
pub use guard::{Callback, CallbackGuard, GuardOutcome, LogicalContext, Scope};
pub use reactor::{InterestMask, Reactor, Readiness};
pub use session::{ErrorPolicy, Session};
pub use types::{
    BrokerException, ConsumeOptions, ExchangeKind, Operation, OperationKind, QueueOptions,
    Request, Response, ResponseBody, Ticket,
};

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Operation, request and response types shared by the client and the dispatcher.
//!
//! Method names follow the AMQP `class.method` convention so responses parsed
//! off the wire can be matched against the operation that produced them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Method names used on the wire.
pub mod method {
    pub const CONNECTION_OPEN: &str = "connection.open";
    pub const CONNECTION_OPEN_OK: &str = "connection.open_ok";
    pub const CONNECTION_CLOSED: &str = "connection.closed";
    pub const EXCHANGE_DECLARE: &str = "exchange.declare";
    pub const EXCHANGE_DECLARE_OK: &str = "exchange.declare_ok";
    pub const QUEUE_DECLARE: &str = "queue.declare";
    pub const QUEUE_DECLARE_OK: &str = "queue.declare_ok";
    pub const QUEUE_BIND: &str = "queue.bind";
    pub const QUEUE_BIND_OK: &str = "queue.bind_ok";
    pub const BASIC_CONSUME: &str = "basic.consume";
    pub const BASIC_CONSUME_OK: &str = "basic.consume_ok";
    pub const BASIC_DELIVER: &str = "basic.deliver";
    pub const BASIC_CANCEL: &str = "basic.cancel";
    pub const BASIC_CANCEL_OK: &str = "basic.cancel_ok";
    pub const BASIC_PUBLISH: &str = "basic.publish";
    pub const BASIC_PUBLISH_OK: &str = "basic.publish_ok";
}

/// Reply code for a connection torn down underneath pending operations.
pub const CONNECTION_FORCED: u16 = 320;

// ============================================================================
// Ticket
// ============================================================================

/// Correlation handle for one outstanding broker operation.
///
/// Tickets come from a monotonic counter owned by the dispatcher and are
/// never reused, so a ticket lower than the next one to be issued that is no
/// longer pending has been retired.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ticket(u64);

impl Ticket {
    /// Wrap a raw ticket number.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw ticket number.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

// ============================================================================
// Operations
// ============================================================================

/// Exchange routing type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl FromStr for ExchangeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "fanout" => Ok(Self::Fanout),
            "topic" => Ok(Self::Topic),
            "headers" => Ok(Self::Headers),
            _ => Err(format!("Unknown exchange type: {}", s)),
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Direct => "direct",
            Self::Fanout => "fanout",
            Self::Topic => "topic",
            Self::Headers => "headers",
        };
        write!(f, "{}", s)
    }
}

/// Queue declaration options.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueOptions {
    /// Queue name; empty lets the broker pick one.
    #[serde(default)]
    pub queue: String,
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Broker-named queue deleted once its last consumer goes away.
    pub fn auto_delete() -> Self {
        Self {
            auto_delete: true,
            ..Default::default()
        }
    }

    /// Named queue with default flags.
    pub fn named(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            ..Default::default()
        }
    }
}

/// Consumer options.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumeOptions {
    #[serde(default)]
    pub no_ack: bool,
    #[serde(default)]
    pub prefetch_count: u16,
}

/// Whether an operation answers once or keeps delivering.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationKind {
    /// Exactly one response retires the ticket.
    OneShot,
    /// Deliveries keep coming until the ticket is cancelled.
    Subscription,
}

/// An asynchronous broker operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    Connect {
        virtual_host: String,
    },
    DeclareExchange {
        exchange: String,
        kind: ExchangeKind,
    },
    DeclareQueue(QueueOptions),
    BindQueue {
        queue: String,
        exchange: String,
        routing_key: String,
    },
    Consume {
        queue: String,
        #[serde(flatten)]
        options: ConsumeOptions,
    },
    Cancel {
        consumer: Ticket,
    },
    Publish {
        exchange: String,
        routing_key: String,
        body: String,
    },
}

impl Operation {
    /// Wire method name of the request.
    pub fn method_name(&self) -> &'static str {
        match self {
            Self::Connect { .. } => method::CONNECTION_OPEN,
            Self::DeclareExchange { .. } => method::EXCHANGE_DECLARE,
            Self::DeclareQueue(_) => method::QUEUE_DECLARE,
            Self::BindQueue { .. } => method::QUEUE_BIND,
            Self::Consume { .. } => method::BASIC_CONSUME,
            Self::Cancel { .. } => method::BASIC_CANCEL,
            Self::Publish { .. } => method::BASIC_PUBLISH,
        }
    }

    /// Lifetime of the ticket this operation is submitted under.
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Consume { .. } => OperationKind::Subscription,
            _ => OperationKind::OneShot,
        }
    }
}

/// An operation bound to its ticket, ready to be encoded by a client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub ticket: Ticket,
    #[serde(flatten)]
    pub operation: Operation,
}

// ============================================================================
// Responses
// ============================================================================

/// Error reported by the broker for one operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerException {
    pub code: u16,
    pub text: String,
}

impl BrokerException {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }

    /// Exception used to fail operations still pending when the connection dies.
    pub fn connection_lost(reason: &str) -> Self {
        Self::new(CONNECTION_FORCED, format!("connection lost: {}", reason))
    }
}

impl fmt::Display for BrokerException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.text)
    }
}

/// Success payload or broker exception.
#[derive(Clone, Debug, PartialEq)]
pub enum ResponseBody {
    Ok(Value),
    Error(BrokerException),
}

/// A parsed broker response, consumed exactly once.
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    pub ticket: Ticket,
    pub method: String,
    pub body: ResponseBody,
}

impl Response {
    pub fn ok(ticket: Ticket, method: impl Into<String>, payload: Value) -> Self {
        Self {
            ticket,
            method: method.into(),
            body: ResponseBody::Ok(payload),
        }
    }

    pub fn error(ticket: Ticket, method: impl Into<String>, exception: BrokerException) -> Self {
        Self {
            ticket,
            method: method.into(),
            body: ResponseBody::Error(exception),
        }
    }

    /// Subscription delivery for `ticket`.
    pub fn delivery(ticket: Ticket, payload: Value) -> Self {
        Self::ok(ticket, method::BASIC_DELIVER, payload)
    }

    pub fn is_error(&self) -> bool {
        matches!(self.body, ResponseBody::Error(_))
    }

    pub fn is_delivery(&self) -> bool {
        self.method == method::BASIC_DELIVER
    }

    pub fn exception(&self) -> Option<&BrokerException> {
        match &self.body {
            ResponseBody::Error(e) => Some(e),
            ResponseBody::Ok(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ticket_display_and_order() {
        assert_eq!(Ticket::new(3).to_string(), "T3");
        assert!(Ticket::new(1) < Ticket::new(2));
        assert_eq!(Ticket::new(9).get(), 9);
    }

    #[test]
    fn test_exchange_kind_parse() {
        assert_eq!("fanout".parse::<ExchangeKind>(), Ok(ExchangeKind::Fanout));
        assert_eq!("TOPIC".parse::<ExchangeKind>(), Ok(ExchangeKind::Topic));
        assert!("bogus".parse::<ExchangeKind>().is_err());
        assert_eq!(ExchangeKind::Headers.to_string(), "headers");
    }

    #[test]
    fn test_operation_kind() {
        let consume = Operation::Consume {
            queue: "q1".into(),
            options: ConsumeOptions::default(),
        };
        assert_eq!(consume.kind(), OperationKind::Subscription);
        assert_eq!(consume.method_name(), method::BASIC_CONSUME);

        let declare = Operation::DeclareQueue(QueueOptions::auto_delete());
        assert_eq!(declare.kind(), OperationKind::OneShot);
        assert_eq!(declare.method_name(), method::QUEUE_DECLARE);
    }

    #[test]
    fn test_request_envelope_layout() {
        let request = Request {
            ticket: Ticket::new(4),
            operation: Operation::BindQueue {
                queue: "q1".into(),
                exchange: "test".into(),
                routing_key: String::new(),
            },
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({
                "ticket": 4,
                "op": "bind_queue",
                "queue": "q1",
                "exchange": "test",
                "routing_key": ""
            })
        );
    }

    #[test]
    fn test_consume_envelope_flattens_options() {
        let request = Request {
            ticket: Ticket::new(5),
            operation: Operation::Consume {
                queue: "q1".into(),
                options: ConsumeOptions {
                    no_ack: true,
                    prefetch_count: 0,
                },
            },
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["op"], "consume");
        assert_eq!(value["no_ack"], true);

        let back: Request = serde_json::from_value(value).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn test_response_classification() {
        let t = Ticket::new(1);
        let ok = Response::ok(t, method::QUEUE_DECLARE_OK, json!({"queue": "q1"}));
        assert!(!ok.is_error());
        assert!(ok.exception().is_none());

        let deliver = Response::delivery(t, json!({"body": "hi"}));
        assert!(deliver.is_delivery());

        let err = Response::error(t, method::QUEUE_DECLARE, BrokerException::new(406, "PRECONDITION_FAILED"));
        assert!(err.is_error());
        assert_eq!(err.exception().map(|e| e.code), Some(406));
    }

    #[test]
    fn test_connection_lost_exception() {
        let e = BrokerException::connection_lost("peer reset");
        assert_eq!(e.code, CONNECTION_FORCED);
        assert!(e.to_string().contains("peer reset"));
    }
}

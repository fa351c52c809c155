// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Length-prefixed JSON broker client over a non-blocking TCP socket.
//!
//! Requests and responses travel as [`FrameCodec`] frames carrying a JSON
//! envelope:
//!
//! ```text
//! request   { "ticket": 3, "op": "declare_queue", "queue": "", ... }
//! response  { "ticket": 3, "method": "queue.declare_ok", "payload": {...} }
//! error     { "ticket": 3, "method": "queue.declare", "error": {"code": 404, "text": "..."} }
//! ```
//!
//! [`encode_response`] and [`decode_request`] are the peer-side half of the
//! envelope, used by scripted peers in tests and tooling.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};

use mio::net::TcpStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::client::BrokerClient;
use crate::codec::FrameCodec;
use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};
use crate::types::{BrokerException, Request, Response, ResponseBody, Ticket};

/// Response envelope as it appears on the wire.
#[derive(Debug, Serialize, Deserialize)]
struct WireResponse {
    ticket: Ticket,
    method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<BrokerException>,
}

impl From<WireResponse> for Response {
    fn from(wire: WireResponse) -> Self {
        let body = match wire.error {
            Some(exception) => ResponseBody::Error(exception),
            None => ResponseBody::Ok(wire.payload),
        };
        Response {
            ticket: wire.ticket,
            method: wire.method,
            body,
        }
    }
}

/// Encode a response envelope (peer side).
pub fn encode_response(response: &Response) -> Result<Vec<u8>> {
    let (payload, error) = match &response.body {
        ResponseBody::Ok(value) => (value.clone(), None),
        ResponseBody::Error(exception) => (Value::Null, Some(exception.clone())),
    };
    let wire = WireResponse {
        ticket: response.ticket,
        method: response.method.clone(),
        payload,
        error,
    };
    Ok(serde_json::to_vec(&wire)?)
}

/// Decode a request envelope (peer side).
pub fn decode_request(payload: &[u8]) -> Result<Request> {
    Ok(serde_json::from_slice(payload)?)
}

fn decode_response(payload: &[u8]) -> Result<Response> {
    let wire: WireResponse = serde_json::from_slice(payload)
        .map_err(|e| BrokerError::Codec(format!("malformed response envelope: {}", e)))?;
    Ok(wire.into())
}

/// I/O counters owned by the client.
#[derive(Clone, Debug, Default)]
pub struct FramedStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub partial_sends: u64,
}

/// Broker client speaking length-prefixed JSON frames over TCP.
pub struct FramedClient {
    stream: TcpStream,
    peer: SocketAddr,
    codec: FrameCodec,
    read_chunk_size: usize,
    send_queue: VecDeque<Vec<u8>>,
    /// Frame partially written, with the offset already sent
    pending_send: Option<(Vec<u8>, usize)>,
    inbound: VecDeque<Response>,
    closed: bool,
    stats: FramedStats,
}

impl FramedClient {
    /// Connect to the broker named by `config.url`.
    ///
    /// The TCP handshake blocks for at most `connect_timeout_ms`; the socket
    /// is non-blocking afterwards.
    pub fn connect(config: &BrokerConfig) -> Result<Self> {
        let addr = config.broker_url()?.socket_addr()?;
        let std_stream = std::net::TcpStream::connect_timeout(&addr, config.connect_timeout())?;
        std_stream.set_nodelay(config.nodelay)?;
        std_stream.set_nonblocking(true)?;
        log::debug!("[framed] connected to {}", addr);
        Ok(Self::from_stream(TcpStream::from_std(std_stream), addr, config))
    }

    /// Wrap an already connected non-blocking stream.
    pub fn from_stream(stream: TcpStream, peer: SocketAddr, config: &BrokerConfig) -> Self {
        Self {
            stream,
            peer,
            codec: FrameCodec::new(config.max_frame_size),
            read_chunk_size: config.read_chunk_size.max(1),
            send_queue: VecDeque::new(),
            pending_send: None,
            inbound: VecDeque::new(),
            closed: false,
            stats: FramedStats::default(),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn stats(&self) -> &FramedStats {
        &self.stats
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn decode_buffered(&mut self) -> Result<()> {
        while let Some(frame) = self.codec.next_frame()? {
            self.stats.frames_received += 1;
            let response = decode_response(&frame)?;
            log::trace!(
                "[framed] <- {} {} ({} bytes)",
                response.ticket,
                response.method,
                frame.len()
            );
            self.inbound.push_back(response);
        }
        Ok(())
    }

    /// Write queued frames until done or the socket would block.
    fn flush(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }

        loop {
            let (frame, mut offset) = match self.pending_send.take() {
                Some(pending) => pending,
                None => match self.send_queue.pop_front() {
                    Some(frame) => (frame, 0),
                    None => return Ok(()),
                },
            };

            while offset < frame.len() {
                match self.stream.write(&frame[offset..]) {
                    Ok(0) => {
                        return Err(BrokerError::ConnectionClosed(
                            "socket accepted no bytes".into(),
                        ));
                    }
                    Ok(n) => {
                        offset += n;
                        self.stats.bytes_sent += n as u64;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        if offset > 0 {
                            self.stats.partial_sends += 1;
                        }
                        self.pending_send = Some((frame, offset));
                        return Ok(());
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            }
            self.stats.frames_sent += 1;
        }
    }
}

impl BrokerClient for FramedClient {
    fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn on_readable(&mut self) -> Result<()> {
        if self.closed {
            return Err(BrokerError::ConnectionClosed("client closed".into()));
        }

        let mut chunk = vec![0u8; self.read_chunk_size];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    // Frames that arrived before the FIN are still delivered
                    self.decode_buffered()?;
                    return Err(BrokerError::ConnectionClosed(format!(
                        "{} closed the connection",
                        self.peer
                    )));
                }
                Ok(n) => {
                    self.stats.bytes_received += n as u64;
                    self.codec.feed(&chunk[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.decode_buffered()?;
                    return Err(e.into());
                }
            }
        }

        self.decode_buffered()
    }

    fn on_writable(&mut self) -> Result<()> {
        self.flush()
    }

    fn needs_write(&self) -> bool {
        self.pending_send.is_some() || !self.send_queue.is_empty()
    }

    fn send(&mut self, request: Request) -> Result<()> {
        if self.closed {
            return Err(BrokerError::ConnectionClosed("client closed".into()));
        }
        let payload = serde_json::to_vec(&request)?;
        let mut frame = Vec::with_capacity(payload.len() + crate::codec::FRAME_HEADER_SIZE);
        FrameCodec::encode_into(&payload, &mut frame)?;
        log::trace!(
            "[framed] -> {} {} ({} bytes)",
            request.ticket,
            request.operation.method_name(),
            payload.len()
        );
        self.send_queue.push_back(frame);
        self.flush()
    }

    fn next_response(&mut self) -> Option<Response> {
        self.inbound.pop_front()
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.send_queue.clear();
        self.pending_send = None;
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            log::debug!("[framed] shutdown {}: {}", self.peer, e);
        }
    }
}

impl std::fmt::Debug for FramedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedClient")
            .field("peer", &self.peer)
            .field("send_queue", &self.send_queue.len())
            .field("pending_send", &self.pending_send.is_some())
            .field("inbound", &self.inbound.len())
            .field("closed", &self.closed)
            .finish()
    }
}

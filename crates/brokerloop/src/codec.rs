// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Length-prefix framing for the broker socket.
//!
//! Each envelope travels as:
//!
//! ```text
//! +----------------+----------------------+
//! | Length (4B BE) | JSON envelope        |
//! +----------------+----------------------+
//! ```
//!
//! The client reads whatever the socket has, [`FrameCodec::feed`]s it, then
//! pulls complete payloads with [`FrameCodec::next_frame`] until it returns
//! `Ok(None)`. Partial frames stay buffered across reads.

use crate::error::{BrokerError, Result};

/// Frame header size (4 bytes for length).
pub const FRAME_HEADER_SIZE: usize = 4;

/// Default maximum frame payload (16 MB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Incremental length-prefix decoder.
#[derive(Debug)]
pub struct FrameCodec {
    /// Bytes received but not yet decoded
    buffer: Vec<u8>,

    /// Read position in `buffer`
    pos: usize,

    /// Maximum allowed payload size (anti-OOM protection)
    max_size: usize,

    /// Statistics: frames decoded
    frames_decoded: u64,

    /// Statistics: payload bytes decoded
    bytes_decoded: u64,
}

impl FrameCodec {
    /// Create a codec with the given payload limit.
    pub fn new(max_size: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(16 * 1024),
            pos: 0,
            max_size,
            frames_decoded: 0,
            bytes_decoded: 0,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    pub fn bytes_decoded(&self) -> u64 {
        self.bytes_decoded
    }

    /// Append `payload` as one frame to an outbound buffer.
    pub fn encode_into(payload: &[u8], buf: &mut Vec<u8>) -> Result<()> {
        let len = u32::try_from(payload.len())
            .map_err(|_| BrokerError::Codec(format!("payload of {} bytes", payload.len())))?;
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(payload);
        Ok(())
    }

    /// Buffer bytes read from the socket.
    pub fn feed(&mut self, data: &[u8]) {
        // Compact once more than half the buffer has been consumed
        if self.pos > 0 && self.pos > self.buffer.len() / 2 {
            self.buffer.drain(..self.pos);
            self.pos = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Pop the next complete payload.
    ///
    /// Returns `Ok(None)` when more bytes are needed. An oversized length
    /// header is an error: the stream cannot be resynchronised after it.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let available = &self.buffer[self.pos..];
        if available.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let len =
            u32::from_be_bytes([available[0], available[1], available[2], available[3]]) as usize;
        if len > self.max_size {
            return Err(BrokerError::Codec(format!(
                "frame too large: {} bytes (max {})",
                len, self.max_size
            )));
        }

        let total = FRAME_HEADER_SIZE + len;
        if available.len() < total {
            return Ok(None);
        }

        let payload = available[FRAME_HEADER_SIZE..total].to_vec();
        self.pos += total;
        self.frames_decoded += 1;
        self.bytes_decoded += len as u64;

        if self.pos == self.buffer.len() {
            self.buffer.clear();
            self.pos = 0;
        }

        Ok(Some(payload))
    }

    /// Check if a partial frame is buffered.
    pub fn is_partial(&self) -> bool {
        self.pos < self.buffer.len()
    }
}

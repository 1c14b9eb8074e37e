//! Datagram framing over a reliable byte stream
//!
//! The data channel may split or coalesce writes, so every message is framed
//! with a small header and reassembled on the receiving side.
//!
//! # Frame Format
//!
//! ```text
//! ┌───────────┬────────────┬─────────────┬──────────────────┐
//! │ size (2B) │ channel(1B)│ seq (4B)    │ payload (size B) │
//! └───────────┴────────────┴─────────────┴──────────────────┘
//!   little-endian, packed (7 byte header)
//! ```
//!
//! Frames for several channels share one buffer. A reader asking for one
//! channel skips over the frames of the others without consuming them.

use std::collections::BTreeMap;

use super::connection::ConnectionId;
use crate::error::P2pError;
use crate::PeerId;

// ============================================================================
// Constants
// ============================================================================

/// Frame header length
pub const HEADER_LEN: usize = 7;

/// Largest payload a single frame can carry
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

// ============================================================================
// Frame Header
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub size: u16,
    pub channel: u8,
    pub seq: u32,
}

impl FrameHeader {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.size.to_le_bytes());
        out.push(self.channel);
        out.extend_from_slice(&self.seq.to_le_bytes());
    }

    /// Parse a header from the start of `buf`
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        Some(Self {
            size: u16::from_le_bytes([buf[0], buf[1]]),
            channel: buf[2],
            seq: u32::from_le_bytes([buf[3], buf[4], buf[5], buf[6]]),
        })
    }

    fn frame_len(&self) -> usize {
        HEADER_LEN + self.size as usize
    }
}

/// Append one framed message to `out`
pub fn encode_frame(out: &mut Vec<u8>, channel: u8, seq: u32, payload: &[u8]) -> Result<(), P2pError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(P2pError::MessageTooLarge(payload.len()));
    }

    out.reserve(HEADER_LEN + payload.len());
    FrameHeader {
        size: payload.len() as u16,
        channel,
        seq,
    }
    .encode(out);
    out.extend_from_slice(payload);
    Ok(())
}

/// Outcome of a successful [`get_message`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Received {
    /// Full payload size of the frame
    pub size: usize,
    /// Bytes copied into the caller's buffer
    pub copied: usize,
    pub seq: u32,
}

/// Find the first complete frame on `channel` in `buf`
///
/// Copies at most `out.len()` payload bytes; the rest of an oversized
/// payload is discarded. With `peek` nothing is copied or consumed.
/// Returns `None` when no complete frame for `channel` is buffered.
pub fn get_message(buf: &mut Vec<u8>, out: &mut [u8], channel: u8, peek: bool) -> Option<Received> {
    let mut start = 0;

    loop {
        let hdr = FrameHeader::decode(&buf[start..])?;
        let end = start + hdr.frame_len();

        if end > buf.len() {
            log::trace!(
                "incomplete frame: {} bytes declared, {} available",
                hdr.size,
                buf.len() - start - HEADER_LEN
            );
            return None;
        }

        if hdr.channel != channel {
            log::trace!(
                "skipping frame for channel {} (wanted {})",
                hdr.channel,
                channel
            );
            start = end;
            continue;
        }

        let size = hdr.size as usize;
        if peek {
            return Some(Received {
                size,
                copied: 0,
                seq: hdr.seq,
            });
        }

        let copied = size.min(out.len());
        let payload = start + HEADER_LEN;
        out[..copied].copy_from_slice(&buf[payload..payload + copied]);
        buf.drain(start..end);

        return Some(Received {
            size,
            copied,
            seq: hdr.seq,
        });
    }
}

// ============================================================================
// Per-connection datagram state
// ============================================================================

#[derive(Debug)]
pub struct DatagramConnection {
    pub conn: ConnectionId,
    pub peer: PeerId,
    /// Received bytes not yet returned as messages
    pub buf_in: Vec<u8>,
    /// Framed messages waiting to be written
    pub buf_out: Vec<u8>,
    /// Messages in `buf_out`
    pub queued: usize,
    pub seq_out: u32,
    /// Next sequence number expected from the peer
    pub seq_in: u32,
}

impl DatagramConnection {
    pub fn new(conn: ConnectionId, peer: PeerId) -> Self {
        Self {
            conn,
            peer,
            buf_in: Vec::new(),
            buf_out: Vec::new(),
            queued: 0,
            seq_out: 0,
            seq_in: 0,
        }
    }

    /// Frame `payload` into the outgoing buffer
    pub fn queue(&mut self, channel: u8, payload: &[u8]) -> Result<(), P2pError> {
        encode_frame(&mut self.buf_out, channel, self.seq_out, payload)?;
        self.seq_out = self.seq_out.wrapping_add(1);
        self.queued += 1;
        Ok(())
    }

    /// Drop the first `n` written bytes from the outgoing buffer
    pub fn consume_out(&mut self, n: usize) {
        let n = n.min(self.buf_out.len());
        self.buf_out.drain(..n);
        if self.buf_out.is_empty() {
            self.queued = 0;
        }
    }

    pub fn clear_out(&mut self) {
        self.buf_out.clear();
        self.queued = 0;
    }

    /// Read the next message on `channel` from the inbound buffer
    pub fn get_message(&mut self, out: &mut [u8], channel: u8, peek: bool) -> Option<Received> {
        let received = get_message(&mut self.buf_in, out, channel, peek)?;
        if !peek {
            if received.seq != self.seq_in {
                log::trace!(
                    "peer {} frame seq {} (expected {})",
                    self.peer,
                    received.seq,
                    self.seq_in
                );
            }
            self.seq_in = received.seq.wrapping_add(1);
        }
        Some(received)
    }
}

/// Datagram state for every connection the datagram layer has seen
#[derive(Debug)]
pub struct DatagramTable {
    connections: BTreeMap<ConnectionId, DatagramConnection>,
    /// Some connection has buffered output waiting for a flush
    queued_packets: bool,
    flush_threshold: usize,
}

impl DatagramTable {
    pub fn new(flush_threshold: usize) -> Self {
        Self {
            connections: BTreeMap::new(),
            queued_packets: false,
            flush_threshold,
        }
    }

    pub fn flush_threshold(&self) -> usize {
        self.flush_threshold
    }

    pub fn entry(&mut self, conn: ConnectionId, peer: PeerId) -> &mut DatagramConnection {
        self.connections
            .entry(conn)
            .or_insert_with(|| DatagramConnection::new(conn, peer))
    }

    pub fn get_mut(&mut self, conn: ConnectionId) -> Option<&mut DatagramConnection> {
        self.connections.get_mut(&conn)
    }

    pub fn contains(&self, conn: ConnectionId) -> bool {
        self.connections.contains_key(&conn)
    }

    pub fn remove(&mut self, conn: ConnectionId) -> Option<DatagramConnection> {
        self.connections.remove(&conn)
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }

    pub fn set_queued(&mut self) {
        self.queued_packets = true;
    }

    /// Take the "needs flush" flag
    pub fn take_queued(&mut self) -> bool {
        std::mem::replace(&mut self.queued_packets, false)
    }

    /// First connection with a complete message on `channel` already buffered
    pub fn find_ready(&mut self, out: &mut [u8], channel: u8, peek: bool) -> Option<(ConnectionId, Received)> {
        self.connections
            .values_mut()
            .find_map(|dg| dg.get_message(out, channel, peek).map(|r| (dg.conn, r)))
    }

    /// Whether any connection holds received bytes not yet returned
    pub fn has_input(&self) -> bool {
        self.connections.values().any(|dg| !dg.buf_in.is_empty())
    }

    pub fn clear(&mut self) {
        self.connections.clear();
        self.queued_packets = false;
    }
}

// ============================================================================
// Tests
// ============================================================================

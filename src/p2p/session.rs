//! Signaling session
//!
//! One websocket to the signaling server. Outbound messages are framed into
//! `send_buf` and written as the socket allows; inbound bytes accumulate in
//! `recv_buf` until whole frames can be decoded.
//!
//! Messages queued before the socket connects wait in `send_buf`. The hello
//! is put in front of them once the connection completes.

use std::io;

use super::signaling::{self, DecodeError, EncodeError, Envelope, SignalingMessage};
use crate::transport::{SocketId, Transport};
use crate::RequestId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Websocket opening
    Connecting,
    /// Websocket open, hello sent
    Connected,
}

#[derive(Debug)]
pub struct SignalingSession {
    socket: SocketId,
    state: SessionState,
    recv_buf: Vec<u8>,
    send_buf: Vec<u8>,
    next_request_id: RequestId,
}

impl SignalingSession {
    pub fn new(socket: SocketId) -> Self {
        Self {
            socket,
            state: SessionState::Connecting,
            recv_buf: Vec::new(),
            send_buf: Vec::new(),
            next_request_id: 0,
        }
    }

    pub fn socket(&self) -> SocketId {
        self.socket
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    /// Bytes still waiting to be written
    pub fn pending_bytes(&self) -> usize {
        self.send_buf.len()
    }

    /// Mint the next request id; ids start at 1
    pub fn next_request_id(&mut self) -> RequestId {
        self.next_request_id = self.next_request_id.wrapping_add(1);
        if self.next_request_id == 0 {
            self.next_request_id = 1;
        }
        self.next_request_id
    }

    /// Frame a message and queue it, returning its request id
    pub fn queue(&mut self, message: SignalingMessage) -> Result<RequestId, EncodeError> {
        let request_id = self.next_request_id();
        let bytes = signaling::encode_message(&Envelope::new(request_id, message))?;
        self.send_buf.extend_from_slice(&bytes);
        Ok(request_id)
    }

    /// Mark the websocket open and put `hello` ahead of anything queued
    pub fn on_connected(&mut self, hello: SignalingMessage) -> Result<(), EncodeError> {
        let mut bytes = signaling::encode_message(&Envelope::unsolicited(hello))?;
        bytes.append(&mut self.send_buf);
        self.send_buf = bytes;
        self.state = SessionState::Connected;
        Ok(())
    }

    /// Write as much of the send buffer as the socket takes
    ///
    /// `WouldBlock` is not an error; the rest goes out on the next `Writable`.
    pub fn flush(&mut self, transport: &mut dyn Transport) -> io::Result<()> {
        if !self.is_connected() {
            return Ok(());
        }

        while !self.send_buf.is_empty() {
            match transport.write(self.socket, &self.send_buf) {
                Ok(0) => break,
                Ok(n) => {
                    log::trace!("signaling wrote {} of {} bytes", n, self.send_buf.len());
                    self.send_buf.drain(..n.min(self.send_buf.len()));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Accumulate received bytes and decode every complete message
    pub fn receive(&mut self, data: &[u8]) -> Result<Vec<Envelope>, DecodeError> {
        self.recv_buf.extend_from_slice(data);
        let (envelopes, consumed) = signaling::decode_messages(&self.recv_buf)?;
        self.recv_buf.drain(..consumed);
        Ok(envelopes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::signaling::{decode_messages, encode_message};
    use crate::transport::mock::{Call, MockTransport};

    fn lookup(alias: &str) -> SignalingMessage {
        SignalingMessage::AliasLookup {
            alias: alias.to_string(),
        }
    }

    fn hello() -> SignalingMessage {
        SignalingMessage::HelloClient {
            peer_id: 0,
            reconnect_token: String::new(),
            ice_servers: Vec::new(),
        }
    }

    #[test]
    fn test_request_ids_start_at_one() {
        let mut session = SignalingSession::new(SocketId(1));
        assert_eq!(session.queue(lookup("a")).unwrap(), 1);
        assert_eq!(session.queue(lookup("b")).unwrap(), 2);
        assert_eq!(session.next_request_id(), 3);
    }

    #[test]
    fn test_nothing_written_before_connect() {
        let (mut transport, handle) = MockTransport::new();
        let mut session = SignalingSession::new(SocketId(1));
        session.queue(lookup("a")).unwrap();

        session.flush(&mut transport).unwrap();

        assert!(handle.calls().is_empty());
        assert!(session.pending_bytes() > 0);
    }

    #[test]
    fn test_hello_goes_first_on_connect() {
        let (mut transport, handle) = MockTransport::new();
        let mut session = SignalingSession::new(SocketId(1));
        session.queue(lookup("a")).unwrap();

        session.on_connected(hello()).unwrap();
        session.flush(&mut transport).unwrap();

        let written = handle.written(SocketId(1));
        let (envelopes, consumed) = decode_messages(&written).unwrap();
        assert_eq!(consumed, written.len());
        assert_eq!(envelopes.len(), 2);
        assert_eq!(envelopes[0].message.kind(), "HelloClient");
        assert_eq!(envelopes[0].request_id, 0);
        assert_eq!(envelopes[1].message, lookup("a"));
        assert_eq!(envelopes[1].request_id, 1);
        assert_eq!(session.pending_bytes(), 0);
    }

    #[test]
    fn test_would_block_keeps_bytes() {
        let (mut transport, handle) = MockTransport::new();
        let mut session = SignalingSession::new(SocketId(1));
        session.on_connected(hello()).unwrap();

        handle.block_writes(true);
        session.flush(&mut transport).unwrap();
        let pending = session.pending_bytes();
        assert!(pending > 0);

        handle.block_writes(false);
        session.flush(&mut transport).unwrap();
        assert_eq!(session.pending_bytes(), 0);
        assert_eq!(
            handle.count(|c| matches!(c, Call::Write(..))),
            1
        );
    }

    #[test]
    fn test_receive_handles_split_frames() {
        let mut session = SignalingSession::new(SocketId(1));
        let bytes = encode_message(&Envelope::new(5, lookup("x"))).unwrap();

        let (head, tail) = bytes.split_at(3);
        assert!(session.receive(head).unwrap().is_empty());
        let envelopes = session.receive(tail).unwrap();

        assert_eq!(envelopes, vec![Envelope::new(5, lookup("x"))]);
    }

    #[test]
    fn test_receive_malformed_is_error() {
        let mut session = SignalingSession::new(SocketId(1));
        assert!(session.receive(&[0, 0, 0, 1, 0xff]).is_err());
    }
}

//! Transport seam
//!
//! The WebRTC/WebSocket bindings live outside this crate. They implement
//! [`Transport`] for control operations and report progress by pushing
//! [`TransportEvent`]s into the [`TransportEvents`] sink they are handed in
//! [`Transport::attach`]. Events may be pushed from any thread.
//!
//! ```text
//!  I/O thread                         state owner
//!  ──────────                         ───────────
//!  push(socket, Data(..)) ──► queue ──► drain() at next API call
//!                │
//!                └─► Waker ──► wakes a blocked wait()
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use mio::{Events, Poll, Token, Waker};
use parking_lot::Mutex;

// ============================================================================
// Constants
// ============================================================================

/// Token for the inbox waker
const WAKE_TOKEN: Token = Token(0);

/// Name of the data channel opened by the outgoing side
pub const DATA_CHANNEL_NAME: &str = "dataChannel";

// ============================================================================
// Socket handles and events
// ============================================================================

/// Opaque transport socket handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub u64);

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socket#{}", self.0)
    }
}

/// Transport callbacks, one variant per callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Local SDP (offer or answer) is ready
    Sdp(String),
    /// Local ICE candidate gathered
    IceCandidate(String),
    /// Incoming connection completed
    Accept,
    /// Outgoing connection completed
    Connect,
    /// Remote side opened a data channel
    AcceptChannel(String),
    /// Our data channel is open
    ConnectChannel(String),
    /// Bytes received
    Data(Vec<u8>),
    /// Socket can take more writes
    Writable,
    /// Socket disconnected (either side)
    Disconnect,
    /// Socket destroyed; no further events follow
    Destroy,
}

// ============================================================================
// Transport trait
// ============================================================================

/// Control operations on the external transport
///
/// Results only report whether the operation could be started; outcomes
/// arrive later as events.
pub trait Transport: Send {
    /// Hand the transport the sink it should push events into
    fn attach(&mut self, _events: TransportEvents) {}

    /// Whether WebRTC peer sockets can be created
    fn supports_webrtc(&self) -> bool;

    /// Open the signaling websocket
    fn connect_websocket(&mut self, url: &str, protocol: &str) -> io::Result<SocketId>;

    /// Configure STUN servers for subsequently created peer sockets
    fn set_stun_servers(&mut self, _servers: &[String]) {}

    /// Create a WebRTC peer socket
    fn create_peer_socket(&mut self) -> io::Result<SocketId>;

    /// Start generating a local offer; delivered as `Sdp`
    fn create_offer(&mut self, socket: SocketId) -> io::Result<()>;

    /// Apply a remote offer; the local answer is delivered as `Sdp`
    fn set_offer(&mut self, socket: SocketId, sdp: &str) -> io::Result<()>;

    /// Apply the remote answer
    fn set_answer(&mut self, socket: SocketId, sdp: &str) -> io::Result<()>;

    fn add_ice_candidate(&mut self, socket: SocketId, candidate: &str) -> io::Result<()>;

    /// Open a data channel; completion is delivered as `ConnectChannel`
    fn create_channel(&mut self, socket: SocketId, name: &str) -> io::Result<()>;

    /// Write bytes; `WouldBlock` means try again after `Writable`
    fn write(&mut self, socket: SocketId, data: &[u8]) -> io::Result<usize>;

    /// Close a socket; no events are delivered for it afterwards
    fn close(&mut self, socket: SocketId);
}

// ============================================================================
// Event inbox
// ============================================================================

struct Inbox {
    queue: Mutex<VecDeque<(SocketId, TransportEvent)>>,
    poll: Mutex<Poll>,
    waker: Waker,
}

/// Cloneable sink for transport events
#[derive(Clone)]
pub struct TransportEvents {
    inner: Arc<Inbox>,
}

impl fmt::Debug for TransportEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportEvents")
            .field("pending", &self.inner.queue.lock().len())
            .finish()
    }
}

impl TransportEvents {
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;

        Ok(Self {
            inner: Arc::new(Inbox {
                queue: Mutex::new(VecDeque::new()),
                poll: Mutex::new(poll),
                waker,
            }),
        })
    }

    /// Queue an event and wake any waiter
    pub fn push(&self, socket: SocketId, event: TransportEvent) {
        log::trace!("{} event {:?}", socket, event);
        self.inner.queue.lock().push_back((socket, event));
        self.interrupt();
    }

    /// Wake a blocked `wait` without queuing anything
    pub fn interrupt(&self) {
        if let Err(e) = self.inner.waker.wake() {
            log::warn!("Failed to wake event loop: {}", e);
        }
    }

    /// Take every queued event
    pub fn drain(&self) -> Vec<(SocketId, TransportEvent)> {
        self.inner.queue.lock().drain(..).collect()
    }

    pub fn has_pending(&self) -> bool {
        !self.inner.queue.lock().is_empty()
    }

    /// Block until an event is queued, `interrupt` is called, or `timeout` passes
    ///
    /// Returns true when woken early.
    pub fn wait(&self, timeout: Duration) -> io::Result<bool> {
        if self.has_pending() {
            return Ok(true);
        }

        let mut events = Events::with_capacity(4);
        let mut poll = self.inner.poll.lock();
        match poll.poll(&mut events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(false),
            Err(e) => return Err(e),
        }

        let woken = events.iter().any(|ev| ev.token() == WAKE_TOKEN);
        Ok(woken || self.has_pending())
    }
}

// ============================================================================
// Test transport
// ============================================================================

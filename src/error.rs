//! Error types and the thread-local "last error" slot
//!
//! Every fallible public operation returns a [`P2pError`]. The facade also
//! records the message in a per-thread slot so callers that only look at a
//! boolean/negative return can still fetch a human readable reason.

use std::cell::RefCell;
use std::fmt;
use std::io;

use crate::p2p::signaling::{DecodeError, EncodeError};
use crate::{LobbyId, PeerId};

// ============================================================================
// Error Type
// ============================================================================

/// Errors surfaced by the P2P layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum P2pError {
    /// `HumbleNet::init` has not been called, or `shutdown` already ran
    NotInitialized,
    /// Caller passed an unusable argument
    InvalidArgument(String),
    /// No live signaling session
    SignalingNotConnected,
    /// Signaling server has not assigned us a peer id yet
    NoPeerId,
    /// An outgoing connection to this peer is already being negotiated
    AlreadyPending(PeerId),
    /// Peer is blacklisted after a failed/hostile connection
    PeerBlacklisted(PeerId),
    /// The connection (or its peer) is closed
    ConnectionClosed { peer: PeerId },
    /// Peer id does not have the virtual bit, or maps to no alias
    NotVirtualPeer(PeerId),
    /// Lobby is not known locally
    UnknownLobby(LobbyId),
    /// Message does not fit in a single datagram frame
    MessageTooLarge(usize),
    /// A transport control operation failed
    Transport(String),
    /// Signaling message could not be encoded
    Encode(EncodeError),
    /// Signaling data could not be decoded
    Decode(DecodeError),
}

impl fmt::Display for P2pError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            P2pError::NotInitialized => write!(f, "humblenet_p2p_init has not been called"),
            P2pError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            P2pError::SignalingNotConnected => write!(f, "Signaling connection not established"),
            P2pError::NoPeerId => write!(f, "No peer ID from server"),
            P2pError::AlreadyPending(peer) => {
                write!(f, "already a pending connection to peer {}", peer)
            }
            P2pError::PeerBlacklisted(peer) => write!(f, "peer blacklisted: {}", peer),
            P2pError::ConnectionClosed { peer } => {
                write!(f, "Connection to peer {} was closed", peer)
            }
            P2pError::NotVirtualPeer(peer) => write!(f, "Not a valid VPeerId: {:#x}", peer),
            P2pError::UnknownLobby(id) => write!(f, "unknown lobby {}", id),
            P2pError::MessageTooLarge(size) => {
                write!(f, "message too large: {} bytes (max {})", size, u16::MAX)
            }
            P2pError::Transport(msg) => write!(f, "transport error: {}", msg),
            P2pError::Encode(e) => write!(f, "{}", e),
            P2pError::Decode(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for P2pError {}

impl From<io::Error> for P2pError {
    fn from(e: io::Error) -> Self {
        P2pError::Transport(e.to_string())
    }
}

impl From<EncodeError> for P2pError {
    fn from(e: EncodeError) -> Self {
        P2pError::Encode(e)
    }
}

impl From<DecodeError> for P2pError {
    fn from(e: DecodeError) -> Self {
        P2pError::Decode(e)
    }
}

// ============================================================================
// Thread-local last error
// ============================================================================

thread_local! {
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Get the last error recorded on this thread
pub fn last_error() -> Option<String> {
    LAST_ERROR.with(|e| e.borrow().clone())
}

/// Record an error message for this thread
pub fn set_error(msg: impl Into<String>) {
    let msg = msg.into();
    LAST_ERROR.with(|e| *e.borrow_mut() = Some(msg));
}

/// Clear the last error for this thread
pub fn clear_error() {
    LAST_ERROR.with(|e| *e.borrow_mut() = None);
}

/// Record `err` in the last-error slot and hand it back
pub(crate) fn record(err: P2pError) -> P2pError {
    set_error(err.to_string());
    err
}

//! HumbleNet P2P core
//!
//! Connection and signaling state machine for peers that talk over WebRTC
//! data channels, brokered by a signaling server, with a relay fallback
//! through that server.
//!
//! # Architecture
//!
//! ```text
//!  application thread                       I/O thread
//!  ──────────────────                       ──────────
//!  HumbleNet (facade)                       Transport impl
//!     │                                         │
//!     ▼                                         │ TransportEvent
//!  NetworkState ◄──── drain ──── Inbox ◄────────┘ (push + wake)
//!     │
//!     ├── ConnectionRegistry   (arena, socket index, lifecycle buckets)
//!     ├── SignalingSession     (hello, framing, request ids)
//!     ├── AliasTable           (name ↔ virtual peer id)
//!     ├── LobbyStore           (membership + attributes)
//!     ├── Blacklist            (peer id → expiry)
//!     └── DatagramTable        (framing + send coalescing)
//! ```
//!
//! Transport callbacks never touch the state directly. They are queued as
//! [`TransportEvent`]s and applied by the state owner at the next API call,
//! so there is no re-entrancy between the transport and the state machine.

pub mod config;
pub mod error;
pub mod events;
pub mod humblenet;
pub mod p2p;
pub mod state;
pub mod transport;

/// Server-assigned peer identifier; 0 means unassigned
pub type PeerId = u32;

/// Server-assigned lobby identifier
pub type LobbyId = u32;

/// Identifier correlating a request with its asynchronous event
pub type RequestId = u32;

pub use config::{Hints, P2pConfig};
pub use error::{clear_error, last_error, set_error, P2pError};
pub use events::Event;
pub use humblenet::{HumbleNet, SendMode};
pub use p2p::lobby::{AttributeMap, AttributeMode, Lobby, LobbyType};
pub use transport::{SocketId, Transport, TransportEvent, TransportEvents};

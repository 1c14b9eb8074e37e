//! P2P module: peer connections, signaling and lobbies
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                      P2P Module Structure                      │
//! ├───────────────────────────────────────────────────────────────┤
//! │                                                                │
//! │  signaling.rs  - Wire messages, framing, hello signature      │
//! │  session.rs    - Signaling websocket session                  │
//! │  dispatch.rs   - Applies server messages to the state         │
//! │  connection.rs - Connection records and generational arena    │
//! │  registry.rs   - Socket index, pending maps, ready buckets    │
//! │  datagram.rs   - Channel framing and send coalescing          │
//! │  alias.rs      - Virtual peer ids for named peers             │
//! │  lobby.rs      - Lobby membership and attributes              │
//! │  blacklist.rs  - Time-limited peer blacklist                  │
//! │  bimap.rs      - Two-way map helper                           │
//! │                                                                │
//! └───────────────────────────────────────────────────────────────┘
//! ```

pub mod alias;
pub mod bimap;
pub mod blacklist;
pub mod connection;
pub mod datagram;
pub mod dispatch;
pub mod lobby;
pub mod registry;
pub mod session;
pub mod signaling;

// Re-export commonly used types
pub use alias::{is_virtual_peer, AliasTable, VIRTUAL_PEER_BIT};
pub use connection::{Connection, ConnectionId, ConnectionStatus, Direction};
pub use datagram::Received;
pub use signaling::{
    decode_message, decode_messages, encode_message, Envelope, IceServer, RejectReason,
    SignalingMessage,
};

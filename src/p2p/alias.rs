//! Alias resolution
//!
//! An alias is a name registered with the signaling server. Before the
//! server has told us which peer owns a name, the application addresses it
//! through a locally minted *virtual* peer id:
//!
//! ```text
//!   "lobby-host" ──lookup──► 0x8000_0001 ──send_to──► pending connection
//!                                                    (keyed by name)
//!                                │
//!                  AliasResolved │ peer 42
//!                                ▼
//!                         P2POffer to peer 42
//! ```

use super::bimap::BiMap;
use super::connection::ConnectionId;
use crate::PeerId;

/// High bit marking locally minted virtual peer ids
pub const VIRTUAL_PEER_BIT: PeerId = 0x8000_0000;

/// Whether `peer` is a virtual peer id
pub fn is_virtual_peer(peer: PeerId) -> bool {
    peer & VIRTUAL_PEER_BIT != 0
}

/// Name ↔ virtual peer id, and virtual peer id ↔ connection
#[derive(Debug, Default)]
pub struct AliasTable {
    names: BiMap<String, PeerId>,
    connections: BiMap<PeerId, ConnectionId>,
    next_id: PeerId,
}

impl AliasTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Virtual peer id for `name`, minting one on first use
    pub fn lookup(&mut self, name: &str) -> PeerId {
        if let Some(&vpeer) = self.names.get_by_left(&name.to_string()) {
            return vpeer;
        }

        self.next_id += 1;
        let vpeer = self.next_id | VIRTUAL_PEER_BIT;
        debug_assert!(is_virtual_peer(vpeer));

        log::debug!("alias '{}' mapped to virtual peer {:#x}", name, vpeer);
        self.names.insert(name.to_string(), vpeer);
        vpeer
    }

    pub fn name_for(&self, vpeer: PeerId) -> Option<&str> {
        self.names.get_by_right(&vpeer).map(String::as_str)
    }

    pub fn virtual_peer_for(&self, name: &str) -> Option<PeerId> {
        self.names.get_by_left(&name.to_string()).copied()
    }

    /// Connection opened through `vpeer`, if any
    pub fn find_connection(&self, vpeer: PeerId) -> Option<ConnectionId> {
        self.connections.get_by_left(&vpeer).copied()
    }

    /// Virtual peer a connection was opened through
    pub fn virtual_peer_of(&self, conn: ConnectionId) -> Option<PeerId> {
        self.connections.get_by_right(&conn).copied()
    }

    pub fn track(&mut self, vpeer: PeerId, conn: ConnectionId) {
        self.connections.insert(vpeer, conn);
    }

    /// Stop tracking `conn`; no-op if it was not opened through an alias
    pub fn untrack(&mut self, conn: ConnectionId) {
        self.connections.remove_by_right(&conn);
    }

    /// Forget every name and tracked connection
    pub fn clear(&mut self) {
        self.names.clear();
        self.connections.clear();
    }
}

//! Connection registry
//!
//! The registry owns every [`Connection`] (through the arena) and keeps the
//! lookup indexes the state machine needs:
//! - transport socket → connection
//! - lifecycle buckets: pending-accept, readable, closed-pending
//! - handshake indexes: pending outgoing/incoming by peer, pending alias by name
//!
//! A connection is in at most one of the pending-accept and handshake indexes
//! at a time. Readable membership always mirrors a non-empty receive buffer.

use std::collections::{BTreeSet, HashMap, VecDeque};

use super::connection::{Connection, ConnectionArena, ConnectionId, ConnectionStatus};
use crate::transport::SocketId;
use crate::PeerId;

// ============================================================================
// Registry Structure
// ============================================================================

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    arena: ConnectionArena,

    /// Authoritative socket index; one entry per live transport socket
    by_socket: HashMap<SocketId, ConnectionId>,

    /// Inbound connections not yet claimed by the application
    pending_accept: VecDeque<ConnectionId>,

    /// Connections with buffered inbound data
    readable: BTreeSet<ConnectionId>,

    /// Connections closed by the remote side, awaiting notification
    closed_pending: BTreeSet<ConnectionId>,

    pending_out: HashMap<PeerId, ConnectionId>,
    pending_in: HashMap<PeerId, ConnectionId>,
    pending_alias_out: HashMap<String, ConnectionId>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------------
    // Ownership
    // ------------------------------------------------------------------------

    /// Store a new connection
    pub fn insert(&mut self, conn: Connection) -> ConnectionId {
        let id = self.arena.insert(conn);
        log::trace!("registered {}", id);
        id
    }

    /// Bind a transport socket to a connection
    pub fn register(&mut self, socket: SocketId, id: ConnectionId) {
        debug_assert!(
            !self.by_socket.contains_key(&socket),
            "{} registered twice",
            socket
        );
        if let Some(conn) = self.arena.get_mut(id) {
            debug_assert!(conn.socket.is_none(), "{} already has a socket", id);
            conn.socket = Some(socket);
            self.by_socket.insert(socket, id);
        }
    }

    /// Unbind and return the connection's socket, if it still has one
    pub fn detach_socket(&mut self, id: ConnectionId) -> Option<SocketId> {
        let socket = self.arena.get_mut(id)?.socket.take()?;
        self.by_socket.remove(&socket);
        Some(socket)
    }

    pub fn by_socket(&self, socket: SocketId) -> Option<ConnectionId> {
        self.by_socket.get(&socket).copied()
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.arena.get(id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.arena.get_mut(id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.arena.contains(id)
    }

    pub fn status(&self, id: ConnectionId) -> Option<ConnectionStatus> {
        self.arena.get(id).map(|c| c.status)
    }

    /// Drop a connection from every index and free it
    pub fn release(&mut self, id: ConnectionId) -> Option<Connection> {
        self.unlink_pending(id);
        self.closed_pending.remove(&id);
        self.readable.remove(&id);
        if let Some(socket) = self.arena.get(id).and_then(|c| c.socket) {
            self.by_socket.remove(&socket);
        }

        let conn = self.arena.remove(id)?;
        log::trace!("released {} (peer {})", id, conn.peer);
        Some(conn)
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.arena.ids()
    }

    /// First live connection whose remote peer is `peer`
    ///
    /// Linear scan; only the relay path uses it.
    pub fn find_by_peer(&self, peer: PeerId) -> Option<ConnectionId> {
        self.arena
            .iter()
            .find(|(_, c)| c.peer == peer && c.socket.is_some())
            .map(|(id, _)| id)
    }

    // ------------------------------------------------------------------------
    // Handshake indexes
    // ------------------------------------------------------------------------

    fn pending_count(&self, id: ConnectionId) -> usize {
        self.pending_out.values().filter(|&&c| c == id).count()
            + self.pending_in.values().filter(|&&c| c == id).count()
            + self.pending_alias_out.values().filter(|&&c| c == id).count()
            + self.pending_accept.iter().filter(|&&c| c == id).count()
    }

    pub fn add_pending_out(&mut self, peer: PeerId, id: ConnectionId) {
        debug_assert_eq!(self.pending_count(id), 0, "{} already pending", id);
        self.pending_out.insert(peer, id);
    }

    pub fn add_pending_in(&mut self, peer: PeerId, id: ConnectionId) {
        debug_assert_eq!(self.pending_count(id), 0, "{} already pending", id);
        self.pending_in.insert(peer, id);
    }

    pub fn add_pending_alias(&mut self, name: &str, id: ConnectionId) {
        debug_assert_eq!(self.pending_count(id), 0, "{} already pending", id);
        self.pending_alias_out.insert(name.to_string(), id);
    }

    pub fn pending_out(&self, peer: PeerId) -> Option<ConnectionId> {
        self.pending_out.get(&peer).copied()
    }

    pub fn pending_in(&self, peer: PeerId) -> Option<ConnectionId> {
        self.pending_in.get(&peer).copied()
    }

    pub fn has_pending_out(&self, peer: PeerId) -> bool {
        self.pending_out.contains_key(&peer)
    }

    pub fn has_pending_in(&self, peer: PeerId) -> bool {
        self.pending_in.contains_key(&peer)
    }

    pub fn take_pending_alias(&mut self, name: &str) -> Option<ConnectionId> {
        self.pending_alias_out.remove(name)
    }

    /// Remove `id` from every handshake index and the accept queue
    pub fn unlink_pending(&mut self, id: ConnectionId) {
        self.pending_out.retain(|_, c| *c != id);
        self.pending_in.retain(|_, c| *c != id);
        self.pending_alias_out.retain(|_, c| *c != id);
        self.pending_accept.retain(|c| *c != id);
    }

    // ------------------------------------------------------------------------
    // Lifecycle buckets
    // ------------------------------------------------------------------------

    /// Move an inbound connection from its handshake index to the accept queue
    pub fn push_accept(&mut self, id: ConnectionId) {
        self.pending_in.retain(|_, c| *c != id);
        if !self.pending_accept.contains(&id) {
            self.pending_accept.push_back(id);
        }
    }

    /// Claim the oldest accepted inbound connection
    pub fn accept_next(&mut self) -> Option<ConnectionId> {
        self.pending_accept.pop_front()
    }

    pub fn has_pending_accept(&self) -> bool {
        !self.pending_accept.is_empty()
    }

    /// Append received bytes and mark the connection readable
    pub fn append_data(&mut self, id: ConnectionId, data: &[u8]) -> bool {
        match self.arena.get_mut(id) {
            Some(conn) => {
                conn.recv_buffer.extend_from_slice(data);
                if conn.is_readable() {
                    self.readable.insert(id);
                }
                true
            }
            None => false,
        }
    }

    /// Take the whole receive buffer
    pub fn read_all(&mut self, id: ConnectionId) -> Vec<u8> {
        self.readable.remove(&id);
        self.arena
            .get_mut(id)
            .map(|c| std::mem::take(&mut c.recv_buffer))
            .unwrap_or_default()
    }

    /// Queue the close notification; unread buffered data is discarded
    pub fn mark_closed_pending(&mut self, id: ConnectionId) {
        self.readable.remove(&id);
        self.closed_pending.insert(id);
    }

    pub fn is_closed_pending(&self, id: ConnectionId) -> bool {
        self.closed_pending.contains(&id)
    }

    pub fn clear_closed_pending(&mut self, id: ConnectionId) {
        self.closed_pending.remove(&id);
    }

    /// Next connection needing attention: closed notifications first, then data
    ///
    /// Never blocks. Callers that want to wait for input use
    /// [`HumbleNet::wait`](crate::HumbleNet::wait), which sleeps on the
    /// transport inbox with a bounded timeout.
    pub fn poll_readable(&self) -> Option<ConnectionId> {
        if let Some(&id) = self.closed_pending.iter().next() {
            return Some(id);
        }
        self.readable.iter().next().copied()
    }

    pub fn has_readable(&self) -> bool {
        !self.readable.is_empty() || !self.closed_pending.is_empty()
    }

    /// Connections with buffered data, ignoring closed notifications
    pub fn readable_ids(&self) -> Vec<ConnectionId> {
        self.readable.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::connection::Direction;

    fn outgoing(registry: &mut ConnectionRegistry, peer: PeerId, socket: u64) -> ConnectionId {
        let id = registry.insert(Connection::new(Direction::Outgoing, peer));
        registry.register(SocketId(socket), id);
        id
    }

    #[test]
    fn test_register_and_lookup_by_socket() {
        let mut registry = ConnectionRegistry::new();
        let id = outgoing(&mut registry, 7, 100);

        assert_eq!(registry.by_socket(SocketId(100)), Some(id));
        assert_eq!(registry.get(id).and_then(|c| c.socket), Some(SocketId(100)));

        assert_eq!(registry.detach_socket(id), Some(SocketId(100)));
        assert_eq!(registry.by_socket(SocketId(100)), None);
        assert_eq!(registry.detach_socket(id), None);
    }

    #[test]
    fn test_accept_moves_out_of_pending_in() {
        let mut registry = ConnectionRegistry::new();
        let id = registry.insert(Connection::new(Direction::Incoming, 3));
        registry.add_pending_in(3, id);

        registry.push_accept(id);
        registry.push_accept(id);

        assert!(!registry.has_pending_in(3));
        assert_eq!(registry.accept_next(), Some(id));
        assert_eq!(registry.accept_next(), None);
    }

    #[test]
    fn test_poll_prefers_closed() {
        let mut registry = ConnectionRegistry::new();
        let chatty = outgoing(&mut registry, 1, 1);
        let closed = outgoing(&mut registry, 2, 2);

        registry.append_data(chatty, b"hello");
        registry.mark_closed_pending(closed);

        assert_eq!(registry.poll_readable(), Some(closed));
        registry.clear_closed_pending(closed);
        assert_eq!(registry.poll_readable(), Some(chatty));

        assert_eq!(registry.read_all(chatty), b"hello".to_vec());
        assert_eq!(registry.poll_readable(), None);
        assert!(!registry.has_readable());
    }

    #[test]
    fn test_close_discards_unread_data() {
        let mut registry = ConnectionRegistry::new();
        let id = outgoing(&mut registry, 1, 1);

        registry.append_data(id, b"late");
        registry.mark_closed_pending(id);

        assert_eq!(registry.readable_ids(), Vec::<ConnectionId>::new());
        assert_eq!(registry.poll_readable(), Some(id));
        registry.clear_closed_pending(id);
        assert_eq!(registry.poll_readable(), None);
    }

    #[test]
    fn test_empty_data_does_not_mark_readable() {
        let mut registry = ConnectionRegistry::new();
        let id = outgoing(&mut registry, 1, 1);

        registry.append_data(id, &[]);
        assert!(!registry.has_readable());
    }

    #[test]
    fn test_release_removes_every_index() {
        let mut registry = ConnectionRegistry::new();
        let id = outgoing(&mut registry, 9, 50);
        registry.add_pending_out(9, id);
        registry.append_data(id, b"x");
        registry.mark_closed_pending(id);

        let conn = registry.release(id).unwrap();

        assert_eq!(conn.peer, 9);
        assert!(!registry.contains(id));
        assert!(!registry.has_pending_out(9));
        assert_eq!(registry.by_socket(SocketId(50)), None);
        assert_eq!(registry.poll_readable(), None);
        assert!(registry.release(id).is_none());
    }

    #[test]
    fn test_alias_pending_is_taken_once() {
        let mut registry = ConnectionRegistry::new();
        let id = registry.insert(Connection::new(Direction::Outgoing, 0));
        registry.add_pending_alias("host", id);

        assert_eq!(registry.take_pending_alias("host"), Some(id));
        assert_eq!(registry.take_pending_alias("host"), None);
    }

    #[test]
    fn test_find_by_peer_needs_live_socket() {
        let mut registry = ConnectionRegistry::new();
        let id = outgoing(&mut registry, 4, 4);

        assert_eq!(registry.find_by_peer(4), Some(id));
        registry.detach_socket(id);
        assert_eq!(registry.find_by_peer(4), None);
    }
}

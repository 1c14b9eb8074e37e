//! Peer connections and their handles
//!
//! Connections live in a generational arena. A [`ConnectionId`] names a slot
//! plus the generation it was issued for, so an id held after the connection
//! was released can never reach whatever reuses the slot.

use std::fmt;

use crate::transport::SocketId;
use crate::PeerId;

// ============================================================================
// Connection
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Created from a remote offer
    Incoming,
    /// Created by a local connect request
    Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    /// Terminal
    Closed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug)]
pub struct Connection {
    pub direction: Direction,
    pub status: ConnectionStatus,
    /// Remote peer; 0 while an alias is still unresolved
    pub peer: PeerId,
    /// Bytes received and not yet consumed
    pub recv_buffer: Vec<u8>,
    pub writable: bool,
    /// Owned transport socket; `None` once torn down
    pub socket: Option<SocketId>,
}

impl Connection {
    pub fn new(direction: Direction, peer: PeerId) -> Self {
        Self {
            direction,
            status: ConnectionStatus::Connecting,
            peer,
            recv_buffer: Vec::new(),
            writable: true,
            socket: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.status == ConnectionStatus::Closed
    }

    pub fn is_readable(&self) -> bool {
        !self.recv_buffer.is_empty()
    }

    /// Writable only when connected and not backpressured
    pub fn is_writable(&self) -> bool {
        self.status == ConnectionStatus::Connected && self.writable
    }
}

// ============================================================================
// Handles
// ============================================================================

/// Stable handle to a connection in the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId {
    index: u32,
    generation: u32,
}

impl ConnectionId {
    pub fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}.{}", self.index, self.generation)
    }
}

// ============================================================================
// Arena
// ============================================================================

#[derive(Debug)]
struct Slot {
    generation: u32,
    conn: Option<Connection>,
}

#[derive(Debug, Default)]
pub struct ConnectionArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    len: usize,
}

impl ConnectionArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, conn: Connection) -> ConnectionId {
        self.len += 1;

        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.conn = Some(conn);
            return ConnectionId::new(index, slot.generation);
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            conn: Some(conn),
        });
        ConnectionId::new(index, 0)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.conn.as_ref())
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.conn.as_mut())
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.get(id).is_some()
    }

    /// Remove a connection; its id is dead from here on
    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }

        let conn = slot.conn.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.len -= 1;
        Some(conn)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConnectionId, &Connection)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.conn
                .as_ref()
                .map(|c| (ConnectionId::new(i as u32, slot.generation), c))
        })
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.iter().map(|(id, _)| id).collect()
    }
}

//! Application-visible events
//!
//! Asynchronous outcomes (signaling handshake, alias and lobby requests,
//! peer rejections) are queued here and drained with `HumbleNet::poll_event`.

use std::collections::VecDeque;

use crate::{LobbyId, PeerId, RequestId};

/// An event produced by the signaling state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Signaling session established
    P2pConnected,
    /// Signaling session lost; peers unreachable until reconnect
    P2pDisconnected,
    /// Server assigned us a peer id
    P2pAssignPeer { peer: PeerId },

    /// Server reports a peer connected
    PeerConnected { peer: PeerId },
    /// Server reports a peer disconnected
    PeerDisconnected { peer: PeerId },
    /// Peer refused our connection
    PeerRejected { peer: PeerId },
    /// Peer does not exist on the server
    PeerNotFound { peer: PeerId },

    AliasRegisterSuccess { request_id: RequestId },
    AliasRegisterError { request_id: RequestId, error: String },
    AliasResolved { request_id: RequestId, peer: PeerId },
    AliasNotFound { request_id: RequestId, error: String },

    LobbyCreateSuccess { request_id: RequestId, lobby_id: LobbyId },
    LobbyCreateError { request_id: RequestId, error: String },
    /// We joined a lobby
    LobbyJoin { request_id: RequestId, lobby_id: LobbyId, peer: PeerId },
    LobbyJoinError { request_id: RequestId, error: String },
    /// We left a lobby
    LobbyLeave { request_id: RequestId, lobby_id: LobbyId, peer: PeerId },
    LobbyLeaveError { request_id: RequestId, error: String },
    LobbyUpdate { request_id: RequestId, lobby_id: LobbyId },
    LobbyUpdateError { request_id: RequestId, error: String },
    /// Another member joined a lobby we are in
    LobbyMemberJoin { lobby_id: LobbyId, peer: PeerId },
    /// Another member left a lobby we are in
    LobbyMemberLeave { lobby_id: LobbyId, peer: PeerId },
    LobbyMemberUpdate { request_id: RequestId, lobby_id: LobbyId, peer: PeerId },
    LobbyMemberUpdateError { request_id: RequestId, error: String },
}

impl Event {
    /// Request id this event answers (0 for unsolicited events)
    pub fn request_id(&self) -> RequestId {
        match self {
            Event::AliasRegisterSuccess { request_id }
            | Event::AliasRegisterError { request_id, .. }
            | Event::AliasResolved { request_id, .. }
            | Event::AliasNotFound { request_id, .. }
            | Event::LobbyCreateSuccess { request_id, .. }
            | Event::LobbyCreateError { request_id, .. }
            | Event::LobbyJoin { request_id, .. }
            | Event::LobbyJoinError { request_id, .. }
            | Event::LobbyLeave { request_id, .. }
            | Event::LobbyLeaveError { request_id, .. }
            | Event::LobbyUpdate { request_id, .. }
            | Event::LobbyUpdateError { request_id, .. }
            | Event::LobbyMemberUpdate { request_id, .. }
            | Event::LobbyMemberUpdateError { request_id, .. } => *request_id,
            _ => 0,
        }
    }

    /// Whether this event reports a failure
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Event::PeerRejected { .. }
                | Event::PeerNotFound { .. }
                | Event::AliasRegisterError { .. }
                | Event::AliasNotFound { .. }
                | Event::LobbyCreateError { .. }
                | Event::LobbyJoinError { .. }
                | Event::LobbyLeaveError { .. }
                | Event::LobbyUpdateError { .. }
                | Event::LobbyMemberUpdateError { .. }
        )
    }
}

/// FIFO of pending events
#[derive(Debug, Default)]
pub struct EventQueue {
    events: VecDeque<Event>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: Event) {
        log::trace!("event queued: {:?}", event);
        self.events.push_back(event);
    }

    pub fn pop(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_is_fifo() {
        let mut queue = EventQueue::new();
        queue.push(Event::P2pConnected);
        queue.push(Event::P2pAssignPeer { peer: 5 });

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop(), Some(Event::P2pConnected));
        assert_eq!(queue.pop(), Some(Event::P2pAssignPeer { peer: 5 }));
        assert_eq!(queue.pop(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_request_id_correlation() {
        let ev = Event::LobbyCreateSuccess { request_id: 9, lobby_id: 1 };
        assert_eq!(ev.request_id(), 9);
        assert!(!ev.is_error());

        let ev = Event::AliasNotFound { request_id: 3, error: "nope".into() };
        assert_eq!(ev.request_id(), 3);
        assert!(ev.is_error());

        assert_eq!(Event::PeerConnected { peer: 1 }.request_id(), 0);
    }
}

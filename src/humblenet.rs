//! Application-facing API
//!
//! [`HumbleNet`] owns the [`NetworkState`] behind one lock. Every call takes
//! the lock, applies queued transport events, then does its work; the lock
//! is never held while blocking in [`HumbleNet::wait`].
//!
//! ```text
//!  send_to(peer) ──► peers map ──hit──► queue frame ──► flush / keep buffered
//!                       │ miss
//!                       ├── virtual peer ──► AliasLookup + pending-by-name
//!                       └── real peer    ──► P2POffer via connect_peer
//! ```
//!
//! Failures return a [`P2pError`] and are also recorded in the thread-local
//! last-error slot.

use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use crate::config::P2pConfig;
use crate::error::{self, P2pError};
use crate::events::Event;
use crate::p2p::alias::is_virtual_peer;
use crate::p2p::connection::{Connection, ConnectionId, ConnectionStatus, Direction};
use crate::p2p::lobby::{AttributeMap, AttributeMode, Lobby, LobbyType};
use crate::p2p::signaling::{AttributeSet, SignalingMessage};
use crate::state::NetworkState;
use crate::transport::{Transport, TransportEvents};
use crate::{LobbyId, PeerId, RequestId};

/// How `send_to` treats a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendMode {
    /// Write immediately
    #[default]
    Reliable,
    /// Coalesce with other buffered messages until the flush threshold or
    /// an explicit `flush`
    ReliableBuffered,
}

// ============================================================================
// HumbleNet
// ============================================================================

pub struct HumbleNet {
    state: Mutex<NetworkState>,
    inbox: TransportEvents,
}

impl HumbleNet {
    /// Start the P2P subsystem and begin connecting to the signaling server
    pub fn init(config: P2pConfig, mut transport: Box<dyn Transport>) -> Result<Self, P2pError> {
        config.validate().map_err(error::record)?;

        let inbox = TransportEvents::new().map_err(|e| error::record(e.into()))?;
        transport.attach(inbox.clone());

        let mut state = NetworkState::new(config, transport, inbox.clone());
        state.connect_signaling().map_err(error::record)?;

        log::info!("humblenet_p2p_init: started");
        Ok(Self {
            state: Mutex::new(state),
            inbox,
        })
    }

    /// Lock the state and apply pending transport events
    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        let mut state = self.state.lock();
        state.pump();
        state
    }

    /// Run `f` on an initialized state, recording any error
    fn with_state<T>(
        &self,
        f: impl FnOnce(&mut NetworkState) -> Result<T, P2pError>,
    ) -> Result<T, P2pError> {
        let mut state = self.lock();
        if !state.initialized {
            return Err(error::record(P2pError::NotInitialized));
        }
        f(&mut state).map_err(error::record)
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    pub fn shutdown(&self) {
        let mut state = self.lock();
        if state.initialized {
            state.shutdown();
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.lock().initialized
    }

    /// Whether the transport can create WebRTC peer connections
    pub fn p2p_supported(&self) -> bool {
        self.state.lock().webrtc_supported
    }

    /// Replace the signaling session with a fresh one
    pub fn reconnect(&self) -> Result<(), P2pError> {
        self.with_state(|s| s.connect_signaling())
    }

    /// Our peer id; 0 until the server assigns one
    pub fn local_peer_id(&self) -> PeerId {
        self.lock().my_peer_id
    }

    // ------------------------------------------------------------------------
    // Aliases
    // ------------------------------------------------------------------------

    pub fn register_alias(&self, name: &str) -> Result<RequestId, P2pError> {
        self.with_state(|s| {
            if name.is_empty() {
                return Err(P2pError::InvalidArgument(
                    "No name or empty name provided".to_string(),
                ));
            }
            s.send_signal(SignalingMessage::AliasRegister {
                alias: name.to_string(),
            })
        })
    }

    /// Unregister `name`, or every alias of this peer with `None`
    pub fn unregister_alias(&self, name: Option<&str>) -> Result<RequestId, P2pError> {
        self.with_state(|s| {
            if name == Some("") {
                return Err(P2pError::InvalidArgument("Empty name provided".to_string()));
            }
            s.send_signal(SignalingMessage::AliasUnregister {
                alias: name.map(str::to_string),
            })
        })
    }

    /// Virtual peer id standing in for `name`
    pub fn virtual_peer_for_alias(&self, name: &str) -> Result<PeerId, P2pError> {
        self.with_state(|s| {
            if name.is_empty() {
                return Err(P2pError::InvalidArgument(
                    "No name or empty name provided".to_string(),
                ));
            }
            Ok(s.aliases.lookup(name))
        })
    }

    /// Ask the server who owns `name`; answered by an alias event
    pub fn lookup_alias(&self, name: &str) -> Result<RequestId, P2pError> {
        self.with_state(|s| {
            if name.is_empty() {
                return Err(P2pError::InvalidArgument(
                    "No name or empty name provided".to_string(),
                ));
            }
            s.send_signal(SignalingMessage::AliasLookup {
                alias: name.to_string(),
            })
        })
    }

    // ------------------------------------------------------------------------
    // Datagrams
    // ------------------------------------------------------------------------

    /// Send one message to `peer` on `channel`
    ///
    /// Connects on first use. Returns the number of bytes accepted, which may
    /// still be queued while the connection is being set up.
    pub fn send_to(
        &self,
        data: &[u8],
        peer: PeerId,
        mode: SendMode,
        channel: u8,
    ) -> Result<usize, P2pError> {
        self.with_state(|s| {
            let id = connection_for(s, peer)?;

            let status = s
                .registry
                .status(id)
                .ok_or(P2pError::ConnectionClosed { peer })?;
            if status == ConnectionStatus::Closed {
                s.close(id);
                return Err(P2pError::ConnectionClosed { peer });
            }
            let buffered = mode == SendMode::ReliableBuffered || status == ConnectionStatus::Connecting;

            let threshold = s.datagrams.flush_threshold();
            let dg = s.datagrams.entry(id, peer);
            dg.queue(channel, data)?;
            let pending = dg.buf_out.len();

            if !buffered {
                s.flush_connection(id, "send");
            } else if pending > threshold {
                s.flush_connection(id, "threshold");
            } else {
                s.datagrams.set_queued();
            }
            Ok(data.len())
        })
    }

    /// Receive the next message on `channel`
    ///
    /// Returns bytes copied into `buf` and the sender, or `None` when nothing
    /// is ready. A payload larger than `buf` is truncated. A connection
    /// closed by the remote side is reported once as `ConnectionClosed`.
    pub fn recv_from(&self, buf: &mut [u8], channel: u8) -> Result<Option<(usize, PeerId)>, P2pError> {
        self.with_state(|s| {
            if s.datagrams.take_queued() {
                s.flush_all("recv");
            }
            s.accept_pending();

            loop {
                if let Some((id, received)) = s.datagrams.find_ready(buf, channel, false) {
                    return Ok(Some((received.copied, s.app_peer_of(id))));
                }

                let Some(id) = s.registry.poll_readable() else {
                    return Ok(None);
                };

                let peer = s.app_peer_of(id);
                if s.registry.is_closed_pending(id) {
                    log::info!("Connection to peer {} closed", peer);
                    s.close(id);
                    return Err(P2pError::ConnectionClosed { peer });
                }

                let data = s.registry.read_all(id);
                s.datagrams.entry(id, peer).buf_in.extend_from_slice(&data);
                s.peers.entry(peer).or_insert(id);
            }
        })
    }

    /// Size of the next message on `channel` without consuming it
    pub fn peek(&self, channel: u8) -> Result<Option<usize>, P2pError> {
        self.with_state(|s| {
            s.accept_pending();
            for id in s.registry.readable_ids() {
                let peer = s.app_peer_of(id);
                let data = s.registry.read_all(id);
                s.datagrams.entry(id, peer).buf_in.extend_from_slice(&data);
            }
            Ok(s
                .datagrams
                .find_ready(&mut [], channel, true)
                .map(|(_, received)| received.size))
        })
    }

    /// Write out every buffered message that can be sent now
    pub fn flush(&self) -> Result<(), P2pError> {
        self.with_state(|s| {
            s.datagrams.take_queued();
            s.flush_all("flush");
            Ok(())
        })
    }

    /// Close the connection to `peer`, or every connection with peer 0
    pub fn disconnect(&self, peer: PeerId) -> Result<(), P2pError> {
        self.with_state(|s| {
            if peer == 0 {
                log::info!("Disconnecting all peers");
                s.close_all();
                return Ok(());
            }

            let id = s
                .peers
                .get(&peer)
                .copied()
                .or_else(|| s.aliases.find_connection(peer))
                .or_else(|| s.registry.find_by_peer(peer))
                .ok_or(P2pError::ConnectionClosed { peer })?;
            log::info!("Disconnecting peer {}", peer);
            s.close(id);
            Ok(())
        })
    }

    /// Block up to `timeout` for data, connections or events
    pub fn wait(&self, timeout: Duration) -> bool {
        {
            let state = self.lock();
            if !state.initialized {
                return false;
            }
            if state.is_ready() || state.datagrams.has_input() {
                return true;
            }
        }

        if let Err(e) = self.inbox.wait(timeout) {
            log::warn!("wait failed: {}", e);
        }

        let state = self.lock();
        state.is_ready() || state.datagrams.has_input()
    }

    // ------------------------------------------------------------------------
    // Hints and events
    // ------------------------------------------------------------------------

    pub fn set_hint(&self, name: &str, value: &str) {
        self.lock().hints.set(name, value);
    }

    pub fn get_hint(&self, name: &str) -> Option<String> {
        self.lock().hints.get(name).map(str::to_string)
    }

    pub fn poll_event(&self) -> Option<Event> {
        self.lock().events.pop()
    }

    pub fn has_events(&self) -> bool {
        !self.lock().events.is_empty()
    }

    // ------------------------------------------------------------------------
    // Lobbies
    // ------------------------------------------------------------------------

    pub fn lobby_create(&self, lobby_type: LobbyType, max_members: u16) -> Result<RequestId, P2pError> {
        let lobby_type = match lobby_type {
            LobbyType::Unknown => LobbyType::Private,
            other => other,
        };
        self.with_state(|s| {
            s.send_signal(SignalingMessage::LobbyCreate {
                lobby_type,
                max_members,
                attributes: AttributeMap::new(),
            })
        })
    }

    pub fn lobby_join(&self, lobby_id: LobbyId) -> Result<RequestId, P2pError> {
        self.with_state(|s| s.send_signal(SignalingMessage::LobbyJoin { lobby_id }))
    }

    pub fn lobby_leave(&self, lobby_id: LobbyId) -> Result<RequestId, P2pError> {
        self.with_state(|s| s.send_signal(SignalingMessage::LobbyLeave { lobby_id }))
    }

    pub fn lobby_set_type(&self, lobby_id: LobbyId, lobby_type: LobbyType) -> Result<RequestId, P2pError> {
        self.lobby_update(lobby_id, lobby_type, 0, None)
    }

    pub fn lobby_set_max_members(&self, lobby_id: LobbyId, max_members: u16) -> Result<RequestId, P2pError> {
        self.lobby_update(lobby_id, LobbyType::Unknown, max_members, None)
    }

    pub fn lobby_set_attributes(
        &self,
        lobby_id: LobbyId,
        attributes: AttributeMap,
        mode: AttributeMode,
    ) -> Result<RequestId, P2pError> {
        let set = AttributeSet { mode, attributes };
        self.lobby_update(lobby_id, LobbyType::Unknown, 0, Some(set))
    }

    /// Update our own member attributes in a lobby
    pub fn lobby_set_member_attributes(
        &self,
        lobby_id: LobbyId,
        attributes: AttributeMap,
        mode: AttributeMode,
    ) -> Result<RequestId, P2pError> {
        self.with_state(|s| {
            if !s.lobbies.contains(lobby_id) {
                return Err(P2pError::UnknownLobby(lobby_id));
            }
            let peer_id = s.my_peer_id;
            s.send_signal(SignalingMessage::LobbyMemberUpdate {
                lobby_id,
                peer_id,
                attribute_set: AttributeSet { mode, attributes },
            })
        })
    }

    fn lobby_update(
        &self,
        lobby_id: LobbyId,
        lobby_type: LobbyType,
        max_members: u16,
        attribute_set: Option<AttributeSet>,
    ) -> Result<RequestId, P2pError> {
        self.with_state(|s| {
            if !s.lobbies.contains(lobby_id) {
                return Err(P2pError::UnknownLobby(lobby_id));
            }
            s.send_signal(SignalingMessage::LobbyUpdate {
                lobby_id,
                lobby_type,
                max_members,
                attribute_set,
            })
        })
    }

    fn with_lobby<T>(&self, lobby_id: LobbyId, f: impl FnOnce(&Lobby) -> T) -> Result<T, P2pError> {
        self.with_state(|s| {
            s.lobbies
                .get(lobby_id)
                .map(f)
                .ok_or(P2pError::UnknownLobby(lobby_id))
        })
    }

    pub fn lobby_owner(&self, lobby_id: LobbyId) -> Result<PeerId, P2pError> {
        self.with_lobby(lobby_id, |l| l.owner)
    }

    pub fn lobby_max_members(&self, lobby_id: LobbyId) -> Result<u16, P2pError> {
        self.with_lobby(lobby_id, |l| l.max_members)
    }

    pub fn lobby_type(&self, lobby_id: LobbyId) -> Result<LobbyType, P2pError> {
        self.with_lobby(lobby_id, |l| l.lobby_type)
    }

    pub fn lobby_member_count(&self, lobby_id: LobbyId) -> Result<usize, P2pError> {
        self.with_lobby(lobby_id, Lobby::member_count)
    }

    pub fn lobby_members(&self, lobby_id: LobbyId) -> Result<Vec<PeerId>, P2pError> {
        self.with_lobby(lobby_id, Lobby::member_ids)
    }

    pub fn lobby_attributes(&self, lobby_id: LobbyId) -> Result<AttributeMap, P2pError> {
        self.with_lobby(lobby_id, |l| l.attributes.clone())
    }

    /// A member's attributes; `None` if `peer` is not in the lobby
    pub fn lobby_member_attributes(
        &self,
        lobby_id: LobbyId,
        peer: PeerId,
    ) -> Result<Option<AttributeMap>, P2pError> {
        self.with_lobby(lobby_id, |l| l.members.get(&peer).cloned())
    }
}

// ============================================================================
// Connection lookup
// ============================================================================

/// Connection the application addresses as `peer`, created on first use
fn connection_for(s: &mut NetworkState, peer: PeerId) -> Result<ConnectionId, P2pError> {
    if let Some(&id) = s.peers.get(&peer) {
        if s.registry.contains(id) {
            return Ok(id);
        }
        s.peers.remove(&peer);
    }

    let id = if is_virtual_peer(peer) {
        alias_connection(s, peer)?
    } else {
        s.connect_peer(peer)?
    };
    s.peers.insert(peer, id);
    Ok(id)
}

/// Connection to the peer behind virtual peer `vpeer`
///
/// The connection waits, keyed by alias name, until the server resolves it.
fn alias_connection(s: &mut NetworkState, vpeer: PeerId) -> Result<ConnectionId, P2pError> {
    if let Some(id) = s.aliases.find_connection(vpeer) {
        if s.registry.status(id).is_some_and(|st| st != ConnectionStatus::Closed) {
            return Ok(id);
        }
    }

    let name = s
        .aliases
        .name_for(vpeer)
        .ok_or(P2pError::NotVirtualPeer(vpeer))?
        .to_string();
    if s.my_peer_id == 0 {
        return Err(P2pError::NoPeerId);
    }

    s.send_signal(SignalingMessage::AliasLookup {
        alias: name.clone(),
    })?;

    let id = s.registry.insert(Connection::new(Direction::Outgoing, 0));
    s.registry.add_pending_alias(&name, id);
    s.aliases.track(vpeer, id);
    log::info!("connecting to alias \"{}\" ({:#x})", name, vpeer);
    Ok(id)
}

// ============================================================================
// Tests
// ============================================================================

//! Signaling message dispatch
//!
//! Applies one server message to the network state. Nothing here is fatal
//! to the session: stale or unexpected input is logged and dropped.

use std::time::Instant;

use super::alias::is_virtual_peer;
use super::connection::{Connection, ConnectionStatus, Direction};
use super::lobby::{AttributeMap, Lobby};
use super::signaling::{IceServer, RejectReason, SignalingMessage, OFFER_FLAG_EMULATED};
use crate::events::Event;
use crate::state::NetworkState;
use crate::{PeerId, RequestId};

impl NetworkState {
    pub(crate) fn process_message(&mut self, request_id: RequestId, message: SignalingMessage) {
        log::trace!("signaling recv {} (request {})", message.kind(), request_id);

        match message {
            SignalingMessage::HelloClient {
                peer_id,
                reconnect_token,
                ice_servers,
            } => self.on_hello(peer_id, reconnect_token, ice_servers),

            SignalingMessage::P2POffer {
                peer_id,
                flags,
                offer,
            } => self.on_offer(peer_id, flags, &offer),

            SignalingMessage::P2PAnswer { peer_id, offer } => self.on_answer(peer_id, &offer),

            SignalingMessage::ICECandidate { peer_id, offer } => {
                self.on_ice_candidate(peer_id, &offer)
            }

            SignalingMessage::P2PReject { peer_id, reason } => self.on_reject(peer_id, reason),

            SignalingMessage::P2PConnected { peer_id } => {
                log::info!("Established connection to peer {}", peer_id);
                self.events.push(Event::PeerConnected { peer: peer_id });
            }

            SignalingMessage::P2PDisconnect { peer_id } => {
                log::info!("Disconnecting peer {}", peer_id);
                self.events.push(Event::PeerDisconnected { peer: peer_id });
            }

            SignalingMessage::P2PRelayData { peer_id, data } => {
                log::trace!("Got {} bytes relayed from peer {}", data.len(), peer_id);
                match self.registry.find_by_peer(peer_id) {
                    Some(id) => {
                        self.registry.append_data(id, &data);
                        self.inbox.interrupt();
                    }
                    None => log::debug!("Relay data for unknown peer {}", peer_id),
                }
            }

            SignalingMessage::AliasResolved { alias, peer_id } => {
                self.on_alias_resolved(&alias, peer_id);
                let event = if peer_id != 0 {
                    Event::AliasResolved {
                        request_id,
                        peer: peer_id,
                    }
                } else {
                    Event::AliasNotFound {
                        request_id,
                        error: "Failed to resolve alias".to_string(),
                    }
                };
                self.events.push(event);
            }

            SignalingMessage::AliasRegisterSuccess { alias } => {
                log::info!("Alias '{}' registered", alias);
                self.events.push(Event::AliasRegisterSuccess { request_id });
            }

            SignalingMessage::AliasRegisterError { alias, error } => {
                log::warn!("Failed to register alias '{}': {}", alias, error);
                self.events.push(Event::AliasRegisterError {
                    request_id,
                    error: error_or(error, "Failed to register alias"),
                });
            }

            SignalingMessage::LobbyDidCreate {
                lobby_id,
                owner,
                lobby_type,
                max_members,
                attributes,
            } => {
                let mut lobby = Lobby::new(lobby_id, owner, lobby_type, max_members);
                lobby.attributes = attributes;
                lobby.add_member(owner, AttributeMap::new());
                self.lobbies.insert(lobby);
                self.events.push(Event::LobbyCreateSuccess {
                    request_id,
                    lobby_id,
                });
            }

            SignalingMessage::LobbyDidJoin {
                lobby_id,
                peer_id,
                member_attributes,
                lobby,
            } => {
                if peer_id == self.my_peer_id {
                    let mut lobby = match lobby {
                        Some(snapshot) => Lobby::from_snapshot(lobby_id, snapshot),
                        None => self
                            .lobbies
                            .remove(lobby_id)
                            .unwrap_or_else(|| Lobby::new(lobby_id, 0, Default::default(), 0)),
                    };
                    if !lobby.has_member(peer_id) {
                        lobby.add_member(peer_id, member_attributes);
                    }
                    self.lobbies.insert(lobby);
                    self.events.push(Event::LobbyJoin {
                        request_id,
                        lobby_id,
                        peer: peer_id,
                    });
                } else {
                    match self.lobbies.get_mut(lobby_id) {
                        Some(lobby) => lobby.add_member(peer_id, member_attributes),
                        None => log::debug!("member join for unknown lobby {}", lobby_id),
                    }
                    self.events.push(Event::LobbyMemberJoin {
                        lobby_id,
                        peer: peer_id,
                    });
                }
            }

            SignalingMessage::LobbyDidLeave { lobby_id, peer_id } => {
                if peer_id == self.my_peer_id {
                    self.lobbies.remove(lobby_id);
                    self.events.push(Event::LobbyLeave {
                        request_id,
                        lobby_id,
                        peer: peer_id,
                    });
                } else {
                    if let Some(lobby) = self.lobbies.get_mut(lobby_id) {
                        lobby.remove_member(peer_id);
                    }
                    self.events.push(Event::LobbyMemberLeave {
                        lobby_id,
                        peer: peer_id,
                    });
                }
            }

            SignalingMessage::LobbyDidUpdate {
                lobby_id,
                lobby_type,
                max_members,
                attribute_set,
            } => {
                match self.lobbies.get_mut(lobby_id) {
                    Some(lobby) => lobby.apply_update(lobby_type, max_members, attribute_set.as_ref()),
                    None => log::debug!("update for unknown lobby {}", lobby_id),
                }
                self.events.push(Event::LobbyUpdate {
                    request_id,
                    lobby_id,
                });
            }

            SignalingMessage::LobbyMemberDidUpdate {
                lobby_id,
                peer_id,
                attribute_set,
            } => {
                let applied = self
                    .lobbies
                    .get_mut(lobby_id)
                    .is_some_and(|lobby| lobby.apply_member_update(peer_id, &attribute_set));
                if !applied {
                    log::debug!("member update for {} not in lobby {}", peer_id, lobby_id);
                }
                self.events.push(Event::LobbyMemberUpdate {
                    request_id,
                    lobby_id,
                    peer: peer_id,
                });
            }

            SignalingMessage::LobbyCreateError { error } => {
                self.events.push(Event::LobbyCreateError {
                    request_id,
                    error: error_or(error, "Failed to create lobby"),
                });
            }

            SignalingMessage::LobbyJoinError { error } => {
                self.events.push(Event::LobbyJoinError {
                    request_id,
                    error: error_or(error, "Failed to join lobby"),
                });
            }

            SignalingMessage::LobbyLeaveError { error } => {
                self.events.push(Event::LobbyLeaveError {
                    request_id,
                    error: error_or(error, "Failed to leave lobby"),
                });
            }

            SignalingMessage::LobbyUpdateError { error } => {
                self.events.push(Event::LobbyUpdateError {
                    request_id,
                    error: error_or(error, "Failed to update lobby"),
                });
            }

            SignalingMessage::LobbyMemberUpdateError { error } => {
                self.events.push(Event::LobbyMemberUpdateError {
                    request_id,
                    error: error_or(error, "Failed to update lobby member"),
                });
            }

            other => {
                log::warn!("p2pSignalProcess unhandled {}", other.kind());
            }
        }
    }

    fn on_hello(&mut self, peer_id: PeerId, reconnect_token: String, ice_servers: Vec<IceServer>) {
        if self.my_peer_id != 0 {
            log::error!("Error: got HelloClient but we already have a peer id");
            return;
        }
        if peer_id == 0 || is_virtual_peer(peer_id) {
            log::error!("Server assigned an invalid peer id {:#x}", peer_id);
            return;
        }

        log::info!("My peer id is {}", peer_id);
        self.my_peer_id = peer_id;
        self.reconnect_token = reconnect_token;

        if ice_servers.is_empty() {
            log::info!("No STUN/TURN credentials provided by the server");
        }
        let stun: Vec<String> = ice_servers
            .iter()
            .filter(|s| matches!(s, IceServer::Stun { .. }))
            .map(|s| s.server().to_string())
            .collect();
        self.ice_servers = ice_servers;
        self.transport.set_stun_servers(&stun);

        self.events.push(Event::P2pConnected);
        self.events.push(Event::P2pAssignPeer { peer: peer_id });
    }

    fn refuse_peer(&mut self, peer: PeerId) {
        let reject = SignalingMessage::P2PReject {
            peer_id: peer,
            reason: RejectReason::PeerRefused,
        };
        if let Err(e) = self.send_signal(reject) {
            log::warn!("Failed to refuse peer {}: {}", peer, e);
        }
    }

    fn on_offer(&mut self, peer: PeerId, flags: u8, offer: &str) {
        if self.registry.has_pending_in(peer) {
            log::warn!("already a pending connection to peer {}", peer);
            return;
        }

        let emulated = flags & OFFER_FLAG_EMULATED != 0;
        if emulated || !self.webrtc_supported {
            self.refuse_peer(peer);
        }

        let id = self.registry.insert(Connection::new(Direction::Incoming, peer));
        let socket = match self.transport.create_peer_socket() {
            Ok(socket) => socket,
            Err(e) => {
                log::warn!("Unable to create socket for peer {}: {}", peer, e);
                self.registry.release(id);
                self.refuse_peer(peer);
                return;
            }
        };
        self.registry.register(socket, id);
        self.registry.add_pending_in(peer, id);

        log::info!("Got SDP offer from peer {}", peer);
        if let Err(e) = self.transport.set_offer(socket, offer) {
            log::warn!("Unable to apply offer from peer {}: {}", peer, e);
            self.close(id);
            self.refuse_peer(peer);
        }
    }

    fn on_answer(&mut self, peer: PeerId, answer: &str) {
        let Some(id) = self.registry.pending_out(peer) else {
            log::debug!("P2PAnswer for connection we didn't initiate: {}", peer);
            return;
        };
        let socket = match self.registry.get(id) {
            Some(c) if c.status == ConnectionStatus::Connecting => c.socket,
            _ => None,
        };
        let Some(socket) = socket else {
            log::debug!("P2PAnswer for peer {} not connecting", peer);
            return;
        };

        log::info!("Got SDP answer from peer {}", peer);
        if let Err(e) = self.transport.set_answer(socket, answer) {
            log::warn!("Unable to apply answer from peer {}: {}", peer, e);
            self.make_closed(id);
        }
    }

    fn on_ice_candidate(&mut self, peer: PeerId, candidate: &str) {
        let Some(id) = self
            .registry
            .pending_in(peer)
            .or_else(|| self.registry.pending_out(peer))
        else {
            log::trace!("ICE candidate from {} with no pending connection", peer);
            return;
        };

        let socket = match self.registry.get(id) {
            Some(c) if c.status == ConnectionStatus::Connecting => c.socket,
            _ => None,
        };
        if let Some(socket) = socket {
            log::debug!("Got ice candidate from peer {}", peer);
            if let Err(e) = self.transport.add_ice_candidate(socket, candidate) {
                log::warn!("Failed to add ICE candidate from peer {}: {}", peer, e);
            }
        }
    }

    fn on_reject(&mut self, peer: PeerId, reason: RejectReason) {
        match reason {
            RejectReason::NotFound => {
                log::info!("Peer {} does not exist", peer);
                self.events.push(Event::PeerNotFound { peer });
            }
            RejectReason::PeerRefused => {
                log::info!("Peer {} rejected our connection", peer);
                self.events.push(Event::PeerRejected { peer });
            }
        }

        if let Some(id) = self.registry.pending_out(peer) {
            self.blacklist.insert(peer, Instant::now());
            self.make_closed(id);
        }
    }

    fn on_alias_resolved(&mut self, alias: &str, peer: PeerId) {
        let Some(id) = self.registry.take_pending_alias(alias) else {
            log::debug!(
                "Got resolve message for alias \"{}\" which we're not connecting to",
                alias
            );
            return;
        };

        if peer == 0 {
            log::info!("AliasError: unable to resolve \"{}\"", alias);
            self.make_closed(id);
            return;
        }

        log::info!("Alias \"{}\" resolved to peer {}", alias, peer);
        self.start_outgoing(id, peer);
    }
}

fn error_or(error: String, default: &str) -> String {
    if error.is_empty() {
        default.to_string()
    } else {
        error
    }
}

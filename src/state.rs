//! Network state
//!
//! Everything the P2P layer knows lives in one [`NetworkState`], owned by the
//! [`HumbleNet`](crate::HumbleNet) facade behind a single lock. Transport
//! callbacks reach it only as queued events, applied by [`NetworkState::pump`]
//! at the start of every API call.
//!
//! # Connection lifecycle
//!
//! ```text
//!               offer/answer/ICE          channel open
//!  Connecting ───────────────────────► Connected
//!      │                                   │
//!      │ reject, failure, disconnect       │ disconnect, close
//!      ▼                                   ▼
//!    Closed ◄──────────────────────────────┘
//!      │
//!      │ app sees ConnectionClosed / calls disconnect
//!      ▼
//!   released
//! ```

use std::collections::HashMap;
use std::io;
use std::time::Instant;

use crate::config::{Hints, P2pConfig, HINT_USE_RELAY};
use crate::error::P2pError;
use crate::events::{Event, EventQueue};
use crate::p2p::alias::{is_virtual_peer, AliasTable};
use crate::p2p::blacklist::Blacklist;
use crate::p2p::connection::{Connection, ConnectionId, ConnectionStatus, Direction};
use crate::p2p::datagram::DatagramTable;
use crate::p2p::lobby::{AttributeMap, LobbyStore};
use crate::p2p::registry::ConnectionRegistry;
use crate::p2p::session::SignalingSession;
use crate::p2p::signaling::{
    self, HelloParams, IceServer, SignalingMessage, ATTR_PLATFORM, HELLO_FLAG_TRICKLE,
    HELLO_FLAG_WEBRTC, OFFER_FLAG_TRICKLE, SIGNALING_PROTOCOL,
};
use crate::transport::{SocketId, Transport, TransportEvent, TransportEvents, DATA_CHANNEL_NAME};
use crate::{PeerId, RequestId};

// ============================================================================
// Network State
// ============================================================================

pub struct NetworkState {
    pub(crate) config: P2pConfig,
    pub(crate) hints: Hints,
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) inbox: TransportEvents,

    pub(crate) registry: ConnectionRegistry,
    pub(crate) blacklist: Blacklist,
    pub(crate) aliases: AliasTable,
    pub(crate) lobbies: LobbyStore,
    pub(crate) datagrams: DatagramTable,
    /// Connections the application addresses by (virtual) peer id
    pub(crate) peers: HashMap<PeerId, ConnectionId>,

    pub(crate) session: Option<SignalingSession>,
    pub(crate) my_peer_id: PeerId,
    pub(crate) reconnect_token: String,
    pub(crate) ice_servers: Vec<IceServer>,
    pub(crate) webrtc_supported: bool,

    pub(crate) events: EventQueue,
    pub(crate) initialized: bool,
}

impl NetworkState {
    pub fn new(config: P2pConfig, transport: Box<dyn Transport>, inbox: TransportEvents) -> Self {
        let webrtc_supported = transport.supports_webrtc();
        Self {
            hints: Hints::new(config.hints.clone()),
            blacklist: Blacklist::new(config.blacklist_ttl()),
            datagrams: DatagramTable::new(config.flush_threshold),
            config,
            transport,
            inbox,
            registry: ConnectionRegistry::new(),
            aliases: AliasTable::new(),
            lobbies: LobbyStore::new(),
            peers: HashMap::new(),
            session: None,
            my_peer_id: 0,
            reconnect_token: String::new(),
            ice_servers: Vec::new(),
            webrtc_supported,
            events: EventQueue::new(),
            initialized: true,
        }
    }

    // ------------------------------------------------------------------------
    // Transport events
    // ------------------------------------------------------------------------

    /// Apply every queued transport event
    pub fn pump(&mut self) {
        for (socket, event) in self.inbox.drain() {
            self.handle_transport_event(socket, event);
        }
    }

    pub fn handle_transport_event(&mut self, socket: SocketId, event: TransportEvent) {
        if self.session.as_ref().map(SignalingSession::socket) == Some(socket) {
            self.handle_signaling_event(event);
            return;
        }

        let Some(id) = self.registry.by_socket(socket) else {
            // Late callback for a socket we already closed
            log::trace!("{} event for unknown socket: {:?}", socket, event);
            return;
        };

        self.handle_peer_event(id, socket, event);
    }

    fn handle_peer_event(&mut self, id: ConnectionId, socket: SocketId, event: TransportEvent) {
        let (direction, status, peer) = match self.registry.get(id) {
            Some(c) => (c.direction, c.status, c.peer),
            None => return,
        };

        match event {
            TransportEvent::Sdp(sdp) => {
                if status != ConnectionStatus::Connecting {
                    log::debug!("SDP for peer {} after handshake, ignoring", peer);
                    return;
                }
                let message = match direction {
                    Direction::Incoming => {
                        log::info!("Sending SDP answer to peer {}", peer);
                        SignalingMessage::P2PAnswer { peer_id: peer, offer: sdp }
                    }
                    Direction::Outgoing => {
                        log::info!("Sending SDP offer to peer {}", peer);
                        SignalingMessage::P2POffer {
                            peer_id: peer,
                            flags: OFFER_FLAG_TRICKLE,
                            offer: sdp,
                        }
                    }
                };
                if let Err(e) = self.send_signal(message) {
                    log::warn!("Failed to send SDP to peer {}: {}", peer, e);
                    self.make_closed(id);
                }
            }

            TransportEvent::IceCandidate(candidate) => {
                if status != ConnectionStatus::Connecting {
                    return;
                }
                log::debug!("Sending ICE candidate to peer {}", peer);
                let message = SignalingMessage::ICECandidate {
                    peer_id: peer,
                    offer: candidate,
                };
                if let Err(e) = self.send_signal(message) {
                    log::warn!("Failed to send ICE candidate to peer {}: {}", peer, e);
                }
            }

            TransportEvent::Accept => {
                log::debug!("Transport accepted for peer {}", peer);
            }

            TransportEvent::Connect => {
                log::info!("Transport connected to peer {}", peer);
                if direction == Direction::Outgoing {
                    if let Err(e) = self.transport.create_channel(socket, DATA_CHANNEL_NAME) {
                        log::warn!("Unable to create data channel to peer {}: {}", peer, e);
                        self.make_closed(id);
                    }
                }
            }

            TransportEvent::AcceptChannel(name) => {
                if !self.mark_connected(id) {
                    return;
                }
                log::info!("Accepted channel '{}' from peer {}", name, peer);
                self.registry.push_accept(id);
                self.inbox.interrupt();
            }

            TransportEvent::ConnectChannel(name) => {
                if !self.mark_connected(id) {
                    return;
                }
                log::info!("Connected channel '{}' to peer {}", name, peer);
                self.registry.unlink_pending(id);
                self.flush_connection(id, "connected");
            }

            TransportEvent::Data(data) => {
                if status == ConnectionStatus::Closed {
                    return;
                }
                log::trace!("Received {} bytes from peer {}", data.len(), peer);
                self.registry.append_data(id, &data);
            }

            TransportEvent::Writable => {
                if let Some(conn) = self.registry.get_mut(id) {
                    conn.writable = true;
                }
                self.flush_connection(id, "writable");
            }

            TransportEvent::Disconnect | TransportEvent::Destroy => {
                log::info!("Transport to peer {} went away", peer);
                self.make_closed(id);
            }
        }
    }

    /// Connecting → Connected; false if the connection is not connecting
    fn mark_connected(&mut self, id: ConnectionId) -> bool {
        match self.registry.get_mut(id) {
            Some(conn) if conn.status == ConnectionStatus::Connecting => {
                conn.status = ConnectionStatus::Connected;
                conn.writable = true;
                true
            }
            Some(conn) => {
                log::debug!("channel event for peer {} in state {}", conn.peer, conn.status);
                false
            }
            None => false,
        }
    }

    fn handle_signaling_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connect => self.on_signaling_connected(),

            TransportEvent::Data(data) => {
                let Some(session) = self.session.as_mut() else {
                    return;
                };
                match session.receive(&data) {
                    Ok(envelopes) => {
                        for envelope in envelopes {
                            self.process_message(envelope.request_id, envelope.message);
                        }
                    }
                    Err(e) => {
                        log::error!("Malformed signaling data: {}", e);
                        self.teardown_session(true);
                    }
                }
            }

            TransportEvent::Writable => self.flush_signaling(),

            TransportEvent::Disconnect | TransportEvent::Destroy => {
                log::info!("Signaling connection closed by server");
                self.teardown_session(false);
            }

            other => log::trace!("ignoring signaling event {:?}", other),
        }
    }

    // ------------------------------------------------------------------------
    // Signaling session
    // ------------------------------------------------------------------------

    /// Open a new signaling session, dropping any existing one
    pub fn connect_signaling(&mut self) -> Result<(), P2pError> {
        if let Some(old) = self.session.take() {
            self.transport.close(old.socket());
        }
        self.my_peer_id = 0;

        log::info!(
            "connecting to signaling server \"{}\" with gameToken \"{}\"",
            self.config.server,
            self.config.game_token
        );

        let socket = self
            .transport
            .connect_websocket(&self.config.server, SIGNALING_PROTOCOL)
            .map_err(|e| {
                P2pError::Transport(format!(
                    "WebSocket connection to signaling server failed: {}",
                    e
                ))
            })?;

        self.session = Some(SignalingSession::new(socket));
        Ok(())
    }

    fn on_signaling_connected(&mut self) {
        let flags = if self.webrtc_supported {
            HELLO_FLAG_WEBRTC | HELLO_FLAG_TRICKLE
        } else {
            0
        };

        let mut attributes = AttributeMap::new();
        attributes.insert(ATTR_PLATFORM.to_string(), signaling::platform_info());

        let params = HelloParams {
            flags,
            game_token: &self.config.game_token,
            game_secret: &self.config.game_secret,
            auth_token: self.config.auth_token.as_deref().unwrap_or(""),
            reconnect_token: &self.reconnect_token,
        };
        let hello = signaling::build_hello(&params, attributes);

        let Some(session) = self.session.as_mut() else {
            return;
        };
        match session.on_connected(hello) {
            Ok(()) => {
                log::info!("Signaling connected, sent hello");
                self.flush_signaling();
            }
            Err(e) => {
                log::error!("Failed to encode hello: {}", e);
                self.teardown_session(true);
            }
        }
    }

    /// Queue a message to the server and return its request id
    pub fn send_signal(&mut self, message: SignalingMessage) -> Result<RequestId, P2pError> {
        let session = self.session.as_mut().ok_or(P2pError::SignalingNotConnected)?;

        log::trace!("signaling send {}", message.kind());
        let request_id = session.queue(message)?;

        self.flush_signaling();
        if self.session.is_none() {
            return Err(P2pError::SignalingNotConnected);
        }
        Ok(request_id)
    }

    fn flush_signaling(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if let Err(e) = session.flush(self.transport.as_mut()) {
            log::error!("Signaling write failed: {}", e);
            self.teardown_session(true);
        }
    }

    /// Drop the signaling session; peers stay as they are
    pub fn teardown_session(&mut self, close_socket: bool) {
        let Some(session) = self.session.take() else {
            return;
        };
        if close_socket {
            self.transport.close(session.socket());
        }
        log::info!("Signaling session torn down");
        self.events.push(Event::P2pDisconnected);
        self.inbox.interrupt();
    }

    // ------------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------------

    /// Check we may start a connection to `peer`
    fn can_try_peer(&mut self, peer: PeerId) -> Result<(), P2pError> {
        if self.session.is_none() {
            return Err(P2pError::SignalingNotConnected);
        }
        if self.my_peer_id == 0 {
            return Err(P2pError::NoPeerId);
        }
        if self.registry.has_pending_out(peer) {
            log::debug!("already a pending connection to peer {}", peer);
            return Err(P2pError::AlreadyPending(peer));
        }
        if self.blacklist.is_blacklisted(peer, Instant::now()) {
            log::debug!("peer blacklisted {}", peer);
            return Err(P2pError::PeerBlacklisted(peer));
        }
        Ok(())
    }

    /// Start an outgoing connection to a real peer
    pub fn connect_peer(&mut self, peer: PeerId) -> Result<ConnectionId, P2pError> {
        if peer == 0 || is_virtual_peer(peer) {
            return Err(P2pError::InvalidArgument(format!("not a peer id: {:#x}", peer)));
        }
        self.can_try_peer(peer)?;

        let id = self.registry.insert(Connection::new(Direction::Outgoing, peer));
        let socket = match self.transport.create_peer_socket() {
            Ok(socket) => socket,
            Err(e) => {
                self.registry.release(id);
                return Err(e.into());
            }
        };
        self.registry.register(socket, id);
        self.registry.add_pending_out(peer, id);

        if let Err(e) = self.transport.create_offer(socket) {
            log::warn!("Unable to generate sdp offer to peer {}: {}", peer, e);
            self.close(id);
            return Err(P2pError::Transport("Unable to generate sdp offer".to_string()));
        }

        log::info!("connecting to peer {}", peer);
        Ok(id)
    }

    /// Start the offer for a connection whose alias resolved to `peer`
    pub(crate) fn start_outgoing(&mut self, id: ConnectionId, peer: PeerId) {
        if let Some(conn) = self.registry.get_mut(id) {
            conn.peer = peer;
        }

        // One pending outgoing connection per peer; an earlier one keeps its slot
        if self.registry.has_pending_out(peer) {
            log::info!("alias resolved to peer {} which is already being connected", peer);
            self.make_closed(id);
            return;
        }
        self.registry.add_pending_out(peer, id);

        if self.blacklist.is_blacklisted(peer, Instant::now()) {
            log::info!("alias resolved to blacklisted peer {}", peer);
            self.make_closed(id);
            return;
        }

        let socket = match self.transport.create_peer_socket() {
            Ok(socket) => socket,
            Err(e) => {
                log::warn!("Unable to create socket for peer {}: {}", peer, e);
                self.make_closed(id);
                return;
            }
        };
        self.registry.register(socket, id);

        if let Err(e) = self.transport.create_offer(socket) {
            log::warn!("Unable to create offer, aborting connection to alias: {}", e);
            self.make_closed(id);
        }
    }

    /// Mark a connection closed; calling it again is a no-op
    pub fn make_closed(&mut self, id: ConnectionId) {
        let (direction, peer) = match self.registry.get(id) {
            Some(c) if c.status != ConnectionStatus::Closed => (c.direction, c.peer),
            _ => return,
        };

        if let Some(socket) = self.registry.detach_socket(id) {
            self.transport.close(socket);
        }
        if let Some(conn) = self.registry.get_mut(id) {
            conn.status = ConnectionStatus::Closed;
        }

        if direction == Direction::Incoming && peer != 0 {
            self.blacklist.insert(peer, Instant::now());
        }

        self.registry.unlink_pending(id);
        self.registry.mark_closed_pending(id);

        log::info!("Marking connection closed: peer {}", peer);
        self.inbox.interrupt();
    }

    /// Close a connection and free it
    pub fn close(&mut self, id: ConnectionId) {
        self.make_closed(id);
        self.aliases.untrack(id);
        self.registry.clear_closed_pending(id);
        self.datagrams.remove(id);
        self.peers.retain(|_, c| *c != id);
        self.registry.release(id);
    }

    /// Close every connection and forget all peer state
    pub fn close_all(&mut self) {
        for id in self.registry.ids() {
            self.close(id);
        }
        self.peers.clear();
        self.datagrams.clear();
    }

    /// Write bytes to a connection
    ///
    /// Returns `Ok(0)` while connecting or when the transport would block.
    pub fn connection_write(&mut self, id: ConnectionId, data: &[u8]) -> Result<usize, P2pError> {
        let (status, peer, socket) = match self.registry.get(id) {
            Some(c) => (c.status, c.peer, c.socket),
            None => return Err(P2pError::ConnectionClosed { peer: 0 }),
        };

        match status {
            ConnectionStatus::Closed => Err(P2pError::ConnectionClosed { peer }),
            ConnectionStatus::Connecting => Ok(0),
            ConnectionStatus::Connected => {
                if self.hints.is_enabled(HINT_USE_RELAY) {
                    self.send_signal(SignalingMessage::P2PRelayData {
                        peer_id: peer,
                        data: data.to_vec(),
                    })?;
                    return Ok(data.len());
                }

                let Some(socket) = socket else {
                    return Err(P2pError::ConnectionClosed { peer });
                };
                match self.transport.write(socket, data) {
                    Ok(n) => Ok(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        if let Some(conn) = self.registry.get_mut(id) {
                            conn.writable = false;
                        }
                        Ok(0)
                    }
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    /// Write out a connection's buffered datagrams if it can take them
    pub fn flush_connection(&mut self, id: ConnectionId, reason: &str) {
        let writable = self.registry.get(id).is_some_and(Connection::is_writable);
        let Some(dg) = self.datagrams.get_mut(id) else {
            return;
        };
        if dg.buf_out.is_empty() {
            return;
        }
        if !writable {
            log::debug!(
                "Waiting({}) {} packets ({} bytes) to peer {}",
                reason,
                dg.queued,
                dg.buf_out.len(),
                dg.peer
            );
            return;
        }
        if dg.queued > 1 {
            log::debug!(
                "Flushing({}) {} packets ({} bytes) to peer {}",
                reason,
                dg.queued,
                dg.buf_out.len(),
                dg.peer
            );
        }

        let out = std::mem::take(&mut dg.buf_out);
        let result = self.connection_write(id, &out);

        let Some(dg) = self.datagrams.get_mut(id) else {
            return;
        };
        dg.buf_out = out;
        match result {
            Ok(n) => dg.consume_out(n),
            Err(e) => {
                log::warn!("Error flushing packets to peer {}: {}", dg.peer, e);
                dg.clear_out();
            }
        }
    }

    /// Flush every connection with buffered output
    pub fn flush_all(&mut self, reason: &str) {
        for id in self.datagrams.ids() {
            self.flush_connection(id, reason);
        }
    }

    /// Claim newly accepted inbound connections for the datagram layer
    pub fn accept_pending(&mut self) {
        while let Some(id) = self.registry.accept_next() {
            let Some(peer) = self.registry.get(id).map(|c| c.peer) else {
                continue;
            };
            if peer == 0 {
                log::debug!("Accepted connection {} is not a peer connection", id);
                continue;
            }
            self.datagrams.entry(id, peer);
            self.peers.entry(peer).or_insert(id);
            log::info!("Tracking inbound connection from peer {}", peer);
        }
    }

    /// Peer id the application knows a connection by
    pub fn app_peer_of(&self, id: ConnectionId) -> PeerId {
        self.aliases
            .virtual_peer_of(id)
            .or_else(|| self.registry.get(id).map(|c| c.peer))
            .unwrap_or(0)
    }

    /// Whether the application has anything to look at
    pub fn is_ready(&self) -> bool {
        self.registry.has_readable() || self.registry.has_pending_accept() || !self.events.is_empty()
    }

    /// Drop every connection, session and lobby
    pub fn shutdown(&mut self) {
        log::info!("humblenet_p2p_shutdown");
        self.close_all();
        if let Some(session) = self.session.take() {
            self.transport.close(session.socket());
        }
        self.lobbies.clear();
        self.aliases.clear();
        self.my_peer_id = 0;
        self.initialized = false;
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Loopback transport and in-process signaling server for the integration tests
//!
//! Every `HumbleNet` instance created by a [`World`] gets a [`LoopbackTransport`]
//! sharing one [`Hub`]. Peer sockets are linked through the SDP strings they
//! exchange, and writes on the signaling websocket are handled synchronously
//! by a tiny server living in the hub.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;

use humblenet::p2p::signaling::{decode_messages, encode_message, Envelope, RejectReason, SignalingMessage};
use humblenet::{HumbleNet, P2pConfig, PeerId, RequestId, SocketId, Transport, TransportEvent, TransportEvents};

/// First peer id the fake server hands out
pub const FIRST_PEER_ID: PeerId = 1001;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ============================================================================
// Hub
// ============================================================================

#[derive(Default)]
struct Client {
    events: Option<TransportEvents>,
    websocket: Option<SocketId>,
    peer_id: PeerId,
    /// Bytes written to the server not yet decoded
    server_buf: Vec<u8>,
    peer_writes: usize,
}

struct Socket {
    owner: usize,
    remote: Option<SocketId>,
    websocket: bool,
}

#[derive(Default)]
struct Hub {
    clients: Vec<Client>,
    sockets: HashMap<SocketId, Socket>,
    next_socket: u64,
    aliases: HashMap<String, PeerId>,
    next_lobby: u32,
    /// Every event delivered to a client
    log: Vec<(usize, TransportEvent)>,
    /// Kinds the server relayed between peers, in order
    forwarded: Vec<&'static str>,
}

impl Hub {
    fn alloc(&mut self, owner: usize, websocket: bool) -> SocketId {
        self.next_socket += 1;
        let socket = SocketId(self.next_socket);
        self.sockets.insert(
            socket,
            Socket {
                owner,
                remote: None,
                websocket,
            },
        );
        socket
    }

    fn push(&mut self, socket: SocketId, event: TransportEvent) {
        let Some(owner) = self.sockets.get(&socket).map(|s| s.owner) else {
            return;
        };
        if let Some(events) = &self.clients[owner].events {
            events.push(socket, event.clone());
        }
        self.log.push((owner, event));
    }

    fn remote_of(&self, socket: SocketId) -> Option<SocketId> {
        self.sockets.get(&socket).and_then(|s| s.remote)
    }

    fn client_by_peer(&self, peer: PeerId) -> Option<usize> {
        self.clients.iter().position(|c| c.peer_id == peer && peer != 0)
    }

    // ------------------------------------------------------------------------
    // Signaling server
    // ------------------------------------------------------------------------

    fn reply(&mut self, client: usize, request_id: RequestId, message: SignalingMessage) {
        let Some(ws) = self.clients[client].websocket else {
            return;
        };
        let bytes = encode_message(&Envelope::new(request_id, message)).expect("encode");
        self.push(ws, TransportEvent::Data(bytes));
    }

    fn forward(&mut self, to: PeerId, message: SignalingMessage) -> bool {
        match self.client_by_peer(to) {
            Some(target) => {
                self.forwarded.push(message.kind());
                self.reply(target, 0, message);
                true
            }
            None => false,
        }
    }

    fn server_recv(&mut self, client: usize, data: &[u8]) {
        self.clients[client].server_buf.extend_from_slice(data);
        let (envelopes, consumed) =
            decode_messages(&self.clients[client].server_buf).expect("client sent garbage");
        self.clients[client].server_buf.drain(..consumed);

        for envelope in envelopes {
            self.handle(client, envelope);
        }
    }

    fn handle(&mut self, client: usize, envelope: Envelope) {
        let from = self.clients[client].peer_id;
        let request_id = envelope.request_id;

        match envelope.message {
            SignalingMessage::HelloServer { .. } => {
                let peer_id = FIRST_PEER_ID + client as PeerId;
                self.clients[client].peer_id = peer_id;
                self.reply(
                    client,
                    0,
                    SignalingMessage::HelloClient {
                        peer_id,
                        reconnect_token: format!("reconnect-{}", peer_id),
                        ice_servers: Vec::new(),
                    },
                );
            }

            SignalingMessage::P2POffer { peer_id, flags, offer } => {
                let delivered = self.forward(
                    peer_id,
                    SignalingMessage::P2POffer {
                        peer_id: from,
                        flags,
                        offer,
                    },
                );
                if !delivered {
                    self.reply(
                        client,
                        0,
                        SignalingMessage::P2PReject {
                            peer_id,
                            reason: RejectReason::NotFound,
                        },
                    );
                }
            }

            SignalingMessage::P2PAnswer { peer_id, offer } => {
                self.forward(peer_id, SignalingMessage::P2PAnswer { peer_id: from, offer });
            }

            SignalingMessage::ICECandidate { peer_id, offer } => {
                self.forward(peer_id, SignalingMessage::ICECandidate { peer_id: from, offer });
            }

            SignalingMessage::P2PReject { peer_id, reason } => {
                self.forward(peer_id, SignalingMessage::P2PReject { peer_id: from, reason });
            }

            SignalingMessage::P2PRelayData { peer_id, data } => {
                self.forward(peer_id, SignalingMessage::P2PRelayData { peer_id: from, data });
            }

            SignalingMessage::AliasRegister { alias } => {
                self.aliases.insert(alias.clone(), from);
                self.reply(client, request_id, SignalingMessage::AliasRegisterSuccess { alias });
            }

            SignalingMessage::AliasLookup { alias } => {
                let peer_id = self.aliases.get(&alias).copied().unwrap_or(0);
                self.reply(client, request_id, SignalingMessage::AliasResolved { alias, peer_id });
            }

            SignalingMessage::LobbyCreate {
                lobby_type,
                max_members,
                attributes,
            } => {
                self.next_lobby += 1;
                let lobby_id = self.next_lobby;
                self.reply(
                    client,
                    request_id,
                    SignalingMessage::LobbyDidCreate {
                        lobby_id,
                        owner: from,
                        lobby_type,
                        max_members,
                        attributes,
                    },
                );
            }

            _ => {}
        }
    }
}

// ============================================================================
// Loopback transport
// ============================================================================

pub struct LoopbackTransport {
    hub: Arc<Mutex<Hub>>,
    client: usize,
}

fn parse_sdp(sdp: &str, prefix: &str) -> io::Result<SocketId> {
    sdp.strip_prefix(prefix)
        .and_then(|n| n.parse().ok())
        .map(SocketId)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad sdp"))
}

impl Transport for LoopbackTransport {
    fn attach(&mut self, events: TransportEvents) {
        self.hub.lock().clients[self.client].events = Some(events);
    }

    fn supports_webrtc(&self) -> bool {
        true
    }

    fn connect_websocket(&mut self, _url: &str, _protocol: &str) -> io::Result<SocketId> {
        let mut hub = self.hub.lock();
        let socket = hub.alloc(self.client, true);
        hub.clients[self.client].websocket = Some(socket);
        hub.push(socket, TransportEvent::Connect);
        Ok(socket)
    }

    fn create_peer_socket(&mut self) -> io::Result<SocketId> {
        Ok(self.hub.lock().alloc(self.client, false))
    }

    fn create_offer(&mut self, socket: SocketId) -> io::Result<()> {
        let mut hub = self.hub.lock();
        hub.push(socket, TransportEvent::Sdp(format!("offer:{}", socket.0)));
        hub.push(socket, TransportEvent::IceCandidate(format!("candidate:{}", socket.0)));
        Ok(())
    }

    fn set_offer(&mut self, socket: SocketId, sdp: &str) -> io::Result<()> {
        let remote = parse_sdp(sdp, "offer:")?;
        let mut hub = self.hub.lock();
        if let Some(s) = hub.sockets.get_mut(&socket) {
            s.remote = Some(remote);
        }
        if let Some(s) = hub.sockets.get_mut(&remote) {
            s.remote = Some(socket);
        }
        hub.push(socket, TransportEvent::Sdp(format!("answer:{}", socket.0)));
        hub.push(socket, TransportEvent::IceCandidate(format!("candidate:{}", socket.0)));
        Ok(())
    }

    fn set_answer(&mut self, socket: SocketId, sdp: &str) -> io::Result<()> {
        parse_sdp(sdp, "answer:")?;
        let mut hub = self.hub.lock();
        hub.push(socket, TransportEvent::Connect);
        if let Some(remote) = hub.remote_of(socket) {
            hub.push(remote, TransportEvent::Accept);
        }
        Ok(())
    }

    fn add_ice_candidate(&mut self, _socket: SocketId, candidate: &str) -> io::Result<()> {
        parse_sdp(candidate, "candidate:").map(|_| ())
    }

    fn create_channel(&mut self, socket: SocketId, name: &str) -> io::Result<()> {
        let mut hub = self.hub.lock();
        hub.push(socket, TransportEvent::ConnectChannel(name.to_string()));
        if let Some(remote) = hub.remote_of(socket) {
            hub.push(remote, TransportEvent::AcceptChannel(name.to_string()));
        }
        Ok(())
    }

    fn write(&mut self, socket: SocketId, data: &[u8]) -> io::Result<usize> {
        let mut hub = self.hub.lock();
        let websocket = hub.sockets.get(&socket).map(|s| s.websocket);
        match websocket {
            Some(true) => hub.server_recv(self.client, data),
            Some(false) => {
                let remote = hub
                    .remote_of(socket)
                    .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
                hub.clients[self.client].peer_writes += 1;
                hub.push(remote, TransportEvent::Data(data.to_vec()));
            }
            None => return Err(io::ErrorKind::NotConnected.into()),
        }
        Ok(data.len())
    }

    fn close(&mut self, socket: SocketId) {
        let mut hub = self.hub.lock();
        let Some(closed) = hub.sockets.remove(&socket) else {
            return;
        };
        if let Some(remote) = closed.remote {
            if let Some(s) = hub.sockets.get_mut(&remote) {
                s.remote = None;
            }
            hub.push(remote, TransportEvent::Disconnect);
        }
    }
}

// ============================================================================
// World
// ============================================================================

/// A set of clients sharing one loopback hub
#[derive(Default)]
pub struct World {
    hub: Arc<Mutex<Hub>>,
}

impl World {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new client; the n-th client gets peer id `FIRST_PEER_ID + n`
    pub fn client(&self) -> HumbleNet {
        let client = {
            let mut hub = self.hub.lock();
            hub.clients.push(Client::default());
            hub.clients.len() - 1
        };
        let transport = LoopbackTransport {
            hub: Arc::clone(&self.hub),
            client,
        };
        let config = P2pConfig::new("ws://loopback/ws", "game-token", "game-secret");
        HumbleNet::init(config, Box::new(transport)).expect("init")
    }

    /// Let every client process what the others sent
    pub fn settle(&self, nets: &[&HumbleNet]) {
        for _ in 0..32 {
            for net in nets {
                net.has_events();
            }
        }
    }

    pub fn forwarded(&self) -> Vec<&'static str> {
        self.hub.lock().forwarded.clone()
    }

    /// Events delivered to client `n`
    pub fn events_for(&self, client: usize) -> Vec<TransportEvent> {
        self.hub
            .lock()
            .log
            .iter()
            .filter(|(owner, _)| *owner == client)
            .map(|(_, event)| event.clone())
            .collect()
    }

    /// Writes client `n` made on peer sockets
    pub fn peer_writes(&self, client: usize) -> usize {
        self.hub.lock().clients[client].peer_writes
    }
}

/// Drain `net`'s events, returning the first that matches
pub fn find_event(net: &HumbleNet, pred: impl Fn(&humblenet::Event) -> bool) -> Option<humblenet::Event> {
    while let Some(event) = net.poll_event() {
        if pred(&event) {
            return Some(event);
        }
    }
    None
}

//! Signaling protocol between peers and the signaling server
//!
//! Peers never talk to each other until a data channel is up, so everything
//! needed to get there (SDP offers/answers, ICE candidates, alias lookups,
//! lobby membership) travels through the server.
//!
//! # Protocol Overview
//!
//! ```text
//! Peer A                   Server                    Peer B
//!   │─── HelloServer ──────►│◄────── HelloServer ──────│
//!   │◄── HelloClient(id) ───│─────── HelloClient(id) ─►│
//!   │                       │                          │
//!   │─── P2POffer(B) ──────►│──── P2POffer(A) ────────►│
//!   │─── ICECandidate(B) ──►│──── ICECandidate(A) ────►│
//!   │◄── P2PAnswer(B) ──────│◄─── P2PAnswer(A) ────────│
//!   │◄── ICECandidate(B) ───│◄─── ICECandidate(A) ─────│
//! ```
//!
//! # Message Framing
//!
//! Every message is wrapped in an [`Envelope`] carrying the request id and
//! length-prefixed with a 4-byte big-endian header:
//! ```text
//! ┌─────────────┬─────────────────────────────────┐
//! │ Length (4B) │ Envelope (bincode-encoded)      │
//! └─────────────┴─────────────────────────────────┘
//! ```

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use ring::hmac;
use serde::{Deserialize, Serialize};

use super::lobby::{AttributeMap, AttributeMode, LobbyType};
use crate::{LobbyId, PeerId, RequestId};

// ============================================================================
// Constants
// ============================================================================

/// Maximum signaling message size
pub const MAX_MESSAGE_SIZE: u32 = 65536;

/// Length of the message header (4 bytes for length)
pub const HEADER_LEN: usize = 4;

/// Websocket sub-protocol spoken with the signaling server
pub const SIGNALING_PROTOCOL: &str = "humblepeer";

/// Protocol version sent in the hello
pub const PROTOCOL_VERSION: u32 = 0;

/// Hello flag: this peer can do WebRTC
pub const HELLO_FLAG_WEBRTC: u8 = 0x1;
/// Hello flag: this peer supports trickle ICE
pub const HELLO_FLAG_TRICKLE: u8 = 0x2;

/// Offer flag: the offering peer cannot do WebRTC and wants relay
pub const OFFER_FLAG_EMULATED: u8 = 0x1;
/// Offer flag: candidates will trickle in after the offer
pub const OFFER_FLAG_TRICKLE: u8 = 0x2;

/// Hello attribute holding the platform description
pub const ATTR_PLATFORM: &str = "platform";
/// Hello attribute holding the unix time the hello was signed
pub const ATTR_TIMESTAMP: &str = "timestamp";

// ============================================================================
// Signaling Messages
// ============================================================================

/// ICE server handed out by the signaling server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IceServer {
    Stun {
        server: String,
    },
    Turn {
        server: String,
        username: String,
        password: String,
    },
}

impl IceServer {
    pub fn server(&self) -> &str {
        match self {
            IceServer::Stun { server } | IceServer::Turn { server, .. } => server,
        }
    }
}

/// Why a peer connection attempt was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum RejectReason {
    /// No such peer on the server
    NotFound = 0,
    /// The peer refused the offer
    PeerRefused = 1,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::NotFound => write!(f, "peer not found"),
            RejectReason::PeerRefused => write!(f, "peer refused"),
        }
    }
}

/// A set of attribute changes and how to apply them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeSet {
    pub mode: AttributeMode,
    pub attributes: AttributeMap,
}

/// Full lobby state as sent by the server when we join
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LobbySnapshot {
    pub owner: PeerId,
    pub lobby_type: LobbyType,
    pub max_members: u16,
    pub attributes: AttributeMap,
    pub members: BTreeMap<PeerId, AttributeMap>,
}

/// Signaling message kinds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalingMessage {
    // ---- session ----
    /// Peer introduces itself; signed with the game secret
    HelloServer {
        version: u32,
        flags: u8,
        game_token: String,
        signature: String,
        auth_token: String,
        reconnect_token: String,
        attributes: AttributeMap,
    },

    /// Server accepts the hello and assigns a peer id
    HelloClient {
        peer_id: PeerId,
        reconnect_token: String,
        ice_servers: Vec<IceServer>,
    },

    // ---- peer negotiation ----
    P2POffer {
        peer_id: PeerId,
        flags: u8,
        offer: String,
    },

    P2PAnswer {
        peer_id: PeerId,
        offer: String,
    },

    ICECandidate {
        peer_id: PeerId,
        offer: String,
    },

    P2PReject {
        peer_id: PeerId,
        reason: RejectReason,
    },

    P2PConnected {
        peer_id: PeerId,
    },

    P2PDisconnect {
        peer_id: PeerId,
    },

    /// Payload tunneled through the server
    P2PRelayData {
        peer_id: PeerId,
        data: Vec<u8>,
    },

    // ---- aliases ----
    AliasRegister {
        alias: String,
    },

    /// `None` unregisters every alias of this peer
    AliasUnregister {
        alias: Option<String>,
    },

    AliasLookup {
        alias: String,
    },

    /// Lookup answer; `peer_id == 0` means not found
    AliasResolved {
        alias: String,
        peer_id: PeerId,
    },

    AliasRegisterSuccess {
        alias: String,
    },

    AliasRegisterError {
        alias: String,
        error: String,
    },

    // ---- lobbies: requests ----
    LobbyCreate {
        lobby_type: LobbyType,
        max_members: u16,
        attributes: AttributeMap,
    },

    LobbyJoin {
        lobby_id: LobbyId,
    },

    LobbyLeave {
        lobby_id: LobbyId,
    },

    /// Zero/`Unknown` fields are left unchanged
    LobbyUpdate {
        lobby_id: LobbyId,
        lobby_type: LobbyType,
        max_members: u16,
        attribute_set: Option<AttributeSet>,
    },

    LobbyMemberUpdate {
        lobby_id: LobbyId,
        peer_id: PeerId,
        attribute_set: AttributeSet,
    },

    // ---- lobbies: server notifications ----
    LobbyDidCreate {
        lobby_id: LobbyId,
        owner: PeerId,
        lobby_type: LobbyType,
        max_members: u16,
        attributes: AttributeMap,
    },

    /// `lobby` is present when the joining peer is the receiver
    LobbyDidJoin {
        lobby_id: LobbyId,
        peer_id: PeerId,
        member_attributes: AttributeMap,
        lobby: Option<LobbySnapshot>,
    },

    LobbyDidLeave {
        lobby_id: LobbyId,
        peer_id: PeerId,
    },

    LobbyDidUpdate {
        lobby_id: LobbyId,
        lobby_type: LobbyType,
        max_members: u16,
        attribute_set: Option<AttributeSet>,
    },

    LobbyMemberDidUpdate {
        lobby_id: LobbyId,
        peer_id: PeerId,
        attribute_set: AttributeSet,
    },

    LobbyCreateError {
        error: String,
    },

    LobbyJoinError {
        error: String,
    },

    LobbyLeaveError {
        error: String,
    },

    LobbyUpdateError {
        error: String,
    },

    LobbyMemberUpdateError {
        error: String,
    },
}

impl SignalingMessage {
    /// Short kind name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::HelloServer { .. } => "HelloServer",
            SignalingMessage::HelloClient { .. } => "HelloClient",
            SignalingMessage::P2POffer { .. } => "P2POffer",
            SignalingMessage::P2PAnswer { .. } => "P2PAnswer",
            SignalingMessage::ICECandidate { .. } => "ICECandidate",
            SignalingMessage::P2PReject { .. } => "P2PReject",
            SignalingMessage::P2PConnected { .. } => "P2PConnected",
            SignalingMessage::P2PDisconnect { .. } => "P2PDisconnect",
            SignalingMessage::P2PRelayData { .. } => "P2PRelayData",
            SignalingMessage::AliasRegister { .. } => "AliasRegister",
            SignalingMessage::AliasUnregister { .. } => "AliasUnregister",
            SignalingMessage::AliasLookup { .. } => "AliasLookup",
            SignalingMessage::AliasResolved { .. } => "AliasResolved",
            SignalingMessage::AliasRegisterSuccess { .. } => "AliasRegisterSuccess",
            SignalingMessage::AliasRegisterError { .. } => "AliasRegisterError",
            SignalingMessage::LobbyCreate { .. } => "LobbyCreate",
            SignalingMessage::LobbyJoin { .. } => "LobbyJoin",
            SignalingMessage::LobbyLeave { .. } => "LobbyLeave",
            SignalingMessage::LobbyUpdate { .. } => "LobbyUpdate",
            SignalingMessage::LobbyMemberUpdate { .. } => "LobbyMemberUpdate",
            SignalingMessage::LobbyDidCreate { .. } => "LobbyDidCreate",
            SignalingMessage::LobbyDidJoin { .. } => "LobbyDidJoin",
            SignalingMessage::LobbyDidLeave { .. } => "LobbyDidLeave",
            SignalingMessage::LobbyDidUpdate { .. } => "LobbyDidUpdate",
            SignalingMessage::LobbyMemberDidUpdate { .. } => "LobbyMemberDidUpdate",
            SignalingMessage::LobbyCreateError { .. } => "LobbyCreateError",
            SignalingMessage::LobbyJoinError { .. } => "LobbyJoinError",
            SignalingMessage::LobbyLeaveError { .. } => "LobbyLeaveError",
            SignalingMessage::LobbyUpdateError { .. } => "LobbyUpdateError",
            SignalingMessage::LobbyMemberUpdateError { .. } => "LobbyMemberUpdateError",
        }
    }
}

/// A message plus the request id it belongs to (0 for unsolicited messages)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub request_id: RequestId,
    pub message: SignalingMessage,
}

impl Envelope {
    pub fn new(request_id: RequestId, message: SignalingMessage) -> Self {
        Self { request_id, message }
    }

    pub fn unsolicited(message: SignalingMessage) -> Self {
        Self::new(0, message)
    }
}

// ============================================================================
// Message Encoding/Decoding
// ============================================================================

/// Encode an envelope with length prefix
///
/// Returns a Vec containing: [4-byte BE length][bincode payload]
pub fn encode_message(envelope: &Envelope) -> Result<Vec<u8>, EncodeError> {
    let payload =
        bincode::serialize(envelope).map_err(|e| EncodeError::Serialization(e.to_string()))?;

    if payload.len() > MAX_MESSAGE_SIZE as usize {
        return Err(EncodeError::MessageTooLarge(payload.len()));
    }

    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);

    Ok(buf)
}

/// Decode an envelope from a length-prefixed buffer
///
/// Returns the envelope and the number of bytes consumed
pub fn decode_message(buf: &[u8]) -> Result<(Envelope, usize), DecodeError> {
    if buf.len() < HEADER_LEN {
        return Err(DecodeError::Incomplete(HEADER_LEN - buf.len()));
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > MAX_MESSAGE_SIZE as usize {
        return Err(DecodeError::MessageTooLarge(length));
    }

    let total_len = HEADER_LEN + length;
    if buf.len() < total_len {
        return Err(DecodeError::Incomplete(total_len - buf.len()));
    }

    let payload = &buf[HEADER_LEN..total_len];
    let envelope =
        bincode::deserialize(payload).map_err(|e| DecodeError::Deserialization(e.to_string()))?;

    Ok((envelope, total_len))
}

/// Decode every complete envelope in `buf`
///
/// Returns the envelopes and the number of bytes consumed. A trailing partial
/// frame is left for the next call; a malformed frame is an error.
pub fn decode_messages(mut buf: &[u8]) -> Result<(Vec<Envelope>, usize), DecodeError> {
    let mut envelopes = Vec::new();
    let mut consumed_total = 0;

    while !buf.is_empty() {
        match decode_message(buf) {
            Ok((envelope, consumed)) => {
                envelopes.push(envelope);
                buf = &buf[consumed..];
                consumed_total += consumed;
            }
            Err(DecodeError::Incomplete(_)) => break,
            Err(e) => return Err(e),
        }
    }

    Ok((envelopes, consumed_total))
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during message encoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Serialization failed
    Serialization(String),
    /// Message exceeds maximum size
    MessageTooLarge(usize),
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodeError::Serialization(e) => write!(f, "serialization error: {}", e),
            EncodeError::MessageTooLarge(size) => {
                write!(
                    f,
                    "message too large: {} bytes (max {})",
                    size, MAX_MESSAGE_SIZE
                )
            }
        }
    }
}

impl std::error::Error for EncodeError {}

/// Errors that can occur during message decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not enough data (need N more bytes)
    Incomplete(usize),
    /// Deserialization failed
    Deserialization(String),
    /// Message exceeds maximum size
    MessageTooLarge(usize),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Incomplete(needed) => {
                write!(f, "incomplete message, need {} more bytes", needed)
            }
            DecodeError::Deserialization(e) => write!(f, "deserialization error: {}", e),
            DecodeError::MessageTooLarge(size) => {
                write!(
                    f,
                    "message too large: {} bytes (max {})",
                    size, MAX_MESSAGE_SIZE
                )
            }
        }
    }
}

impl std::error::Error for DecodeError {}

// ============================================================================
// Hello
// ============================================================================

/// Credentials and capabilities sent in the hello
#[derive(Debug, Clone, Default)]
pub struct HelloParams<'a> {
    pub flags: u8,
    pub game_token: &'a str,
    pub game_secret: &'a str,
    pub auth_token: &'a str,
    pub reconnect_token: &'a str,
}

/// Build a signed `HelloServer`
///
/// The `timestamp` attribute is always set to the current unix time,
/// overriding any caller-supplied value.
pub fn build_hello(params: &HelloParams<'_>, mut attributes: AttributeMap) -> SignalingMessage {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    attributes.insert(ATTR_TIMESTAMP.to_string(), now.to_string());

    let signature = sign_hello(
        params.game_secret,
        params.auth_token,
        params.reconnect_token,
        &attributes,
    );

    SignalingMessage::HelloServer {
        version: PROTOCOL_VERSION,
        flags: params.flags,
        game_token: params.game_token.to_string(),
        signature,
        auth_token: params.auth_token.to_string(),
        reconnect_token: params.reconnect_token.to_string(),
        attributes,
    }
}

/// HMAC-SHA1 over the auth token, reconnect token and sorted attributes, as hex
pub fn sign_hello(
    game_secret: &str,
    auth_token: &str,
    reconnect_token: &str,
    attributes: &AttributeMap,
) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, game_secret.as_bytes());
    let mut ctx = hmac::Context::with_key(&key);

    ctx.update(auth_token.as_bytes());
    ctx.update(reconnect_token.as_bytes());
    for (k, v) in attributes {
        ctx.update(k.as_bytes());
        ctx.update(v.as_bytes());
    }

    to_hex(ctx.sign().as_ref())
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Human readable description of the host, sent as the `platform` attribute
#[cfg(unix)]
pub fn platform_info() -> String {
    fn field(raw: &[libc::c_char]) -> String {
        let bytes: Vec<u8> = raw
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    // SAFETY: utsname is plain old data; uname fills it in place.
    let mut buf: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut buf) } != 0 {
        log::debug!("Failed getting system info with uname");
        return String::new();
    }

    format!(
        "Sysname: {}, Release: {}, Version: {}, Machine: {}",
        field(&buf.sysname),
        field(&buf.release),
        field(&buf.version),
        field(&buf.machine)
    )
}

#[cfg(not(unix))]
pub fn platform_info() -> String {
    format!("{}, {}", std::env::consts::OS, std::env::consts::ARCH)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn offer(peer_id: PeerId) -> Envelope {
        Envelope::new(
            0,
            SignalingMessage::P2POffer {
                peer_id,
                flags: OFFER_FLAG_TRICKLE,
                offer: "v=0 sdp".to_string(),
            },
        )
    }

    #[test]
    fn test_encode_decode_offer() {
        let env = offer(7);

        let encoded = encode_message(&env).unwrap();
        let (decoded, consumed) = decode_message(&encoded).unwrap();

        assert_eq!(decoded, env);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn test_encode_decode_lobby_join_snapshot() {
        let mut members = BTreeMap::new();
        members.insert(3, AttributeMap::new());
        members.insert(4, AttributeMap::from([("ready".to_string(), "1".to_string())]));

        let env = Envelope::new(
            12,
            SignalingMessage::LobbyDidJoin {
                lobby_id: 99,
                peer_id: 4,
                member_attributes: AttributeMap::new(),
                lobby: Some(LobbySnapshot {
                    owner: 3,
                    lobby_type: LobbyType::Public,
                    max_members: 8,
                    attributes: AttributeMap::from([("map".to_string(), "dm1".to_string())]),
                    members,
                }),
            },
        );

        let encoded = encode_message(&env).unwrap();
        let (decoded, _) = decode_message(&encoded).unwrap();
        assert_eq!(decoded, env);
        assert_eq!(decoded.request_id, 12);
    }

    #[test]
    fn test_decode_incomplete() {
        let encoded = encode_message(&offer(1)).unwrap();

        assert!(matches!(
            decode_message(&encoded[..2]),
            Err(DecodeError::Incomplete(2))
        ));
        assert!(matches!(
            decode_message(&encoded[..encoded.len() - 1]),
            Err(DecodeError::Incomplete(1))
        ));
    }

    #[test]
    fn test_decode_multiple_with_remainder() {
        let mut buf = encode_message(&offer(1)).unwrap();
        buf.extend(encode_message(&offer(2)).unwrap());
        let complete = buf.len();
        buf.extend(&[0x00, 0x00, 0x00, 0x10]);

        let (envelopes, consumed) = decode_messages(&buf).unwrap();

        assert_eq!(envelopes.len(), 2);
        assert_eq!(envelopes[1], offer(2));
        assert_eq!(consumed, complete);
    }

    #[test]
    fn test_decode_multiple_malformed_is_error() {
        let mut buf = encode_message(&offer(1)).unwrap();
        buf.extend(&[0x00, 0x00, 0x00, 0x02, 0xff, 0xff]);

        assert!(matches!(
            decode_messages(&buf),
            Err(DecodeError::Deserialization(_))
        ));
    }

    #[test]
    fn test_message_too_large() {
        let fake_header = (MAX_MESSAGE_SIZE + 1).to_be_bytes();

        assert!(matches!(
            decode_message(&fake_header),
            Err(DecodeError::MessageTooLarge(_))
        ));

        let env = Envelope::unsolicited(SignalingMessage::P2PRelayData {
            peer_id: 1,
            data: vec![0u8; MAX_MESSAGE_SIZE as usize + 1],
        });
        assert!(matches!(
            encode_message(&env),
            Err(EncodeError::MessageTooLarge(_))
        ));
    }

    #[test]
    fn test_sign_hello_known_vector() {
        // RFC 2202 test case 2: key "Jefe", data "what do ya want for nothing?"
        let attrs = AttributeMap::new();
        let sig = sign_hello("Jefe", "what do ya want ", "for nothing?", &attrs);
        assert_eq!(sig, "effcdf6ae5eb2fa2d27416d5f184df9c259a7c79");
    }

    #[test]
    fn test_sign_hello_covers_attributes() {
        let mut attrs = AttributeMap::new();
        attrs.insert("platform".to_string(), "linux".to_string());
        let a = sign_hello("secret", "", "", &attrs);

        attrs.insert("platform".to_string(), "windows".to_string());
        let b = sign_hello("secret", "", "", &attrs);

        assert_ne!(a, b);
        assert_eq!(a.len(), 40);
    }

    #[test]
    fn test_build_hello_sets_timestamp_and_signature() {
        let params = HelloParams {
            flags: HELLO_FLAG_WEBRTC | HELLO_FLAG_TRICKLE,
            game_token: "token",
            game_secret: "secret",
            auth_token: "",
            reconnect_token: "rt",
        };
        let mut attrs = AttributeMap::new();
        attrs.insert(ATTR_PLATFORM.to_string(), "test".to_string());
        attrs.insert(ATTR_TIMESTAMP.to_string(), "bogus".to_string());

        match build_hello(&params, attrs) {
            SignalingMessage::HelloServer {
                flags,
                game_token,
                signature,
                reconnect_token,
                attributes,
                ..
            } => {
                assert_eq!(flags, 0x3);
                assert_eq!(game_token, "token");
                assert_eq!(reconnect_token, "rt");
                assert_ne!(attributes[ATTR_TIMESTAMP], "bogus");
                assert_eq!(signature, sign_hello("secret", "", "rt", &attributes));
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_message_kind() {
        assert_eq!(offer(1).message.kind(), "P2POffer");
        assert_eq!(
            SignalingMessage::LobbyLeave { lobby_id: 1 }.kind(),
            "LobbyLeave"
        );
    }
}

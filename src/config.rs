//! Configuration for the P2P subsystem
//!
//! ```json
//! {
//!   "server": "wss://peer.example.com/ws",
//!   "game_token": "token",
//!   "game_secret": "secret",
//!   "hints": { "p2p_use_relay": "0" }
//! }
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::P2pError;

// ============================================================================
// Constants
// ============================================================================

/// How long a peer stays blacklisted after a failed inbound connection
pub const DEFAULT_BLACKLIST_TTL_MS: u64 = 5000;

/// Buffered datagram output is flushed once it grows past this many bytes
pub const DEFAULT_FLUSH_THRESHOLD: usize = 1024;

/// Hint: when "1", connected writes are tunneled through the signaling server
pub const HINT_USE_RELAY: &str = "p2p_use_relay";

// ============================================================================
// P2P Configuration
// ============================================================================

/// Settings passed to `HumbleNet::init`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct P2pConfig {
    /// Signaling server URL
    pub server: String,
    /// Game token identifying the application to the server
    pub game_token: String,
    /// Game secret used to sign the hello handshake
    pub game_secret: String,
    /// Optional user auth token
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Blacklist duration in milliseconds
    #[serde(default = "default_blacklist_ttl_ms")]
    pub blacklist_ttl_ms: u64,
    /// Size at which buffered datagrams are flushed
    #[serde(default = "default_flush_threshold")]
    pub flush_threshold: usize,
    /// Initial hint values
    #[serde(default)]
    pub hints: HashMap<String, String>,
}

fn default_blacklist_ttl_ms() -> u64 {
    DEFAULT_BLACKLIST_TTL_MS
}

fn default_flush_threshold() -> usize {
    DEFAULT_FLUSH_THRESHOLD
}

impl P2pConfig {
    pub fn new(
        server: impl Into<String>,
        game_token: impl Into<String>,
        game_secret: impl Into<String>,
    ) -> Self {
        Self {
            server: server.into(),
            game_token: game_token.into(),
            game_secret: game_secret.into(),
            auth_token: None,
            blacklist_ttl_ms: DEFAULT_BLACKLIST_TTL_MS,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            hints: HashMap::new(),
        }
    }

    /// Set the auth token
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Set an initial hint
    pub fn with_hint(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.hints.insert(name.into(), value.into());
        self
    }

    /// Parse a configuration from JSON text
    pub fn from_json(text: &str) -> Result<Self, P2pError> {
        serde_json::from_str(text).map_err(|e| P2pError::InvalidArgument(e.to_string()))
    }

    /// Load a configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, P2pError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&text)
    }

    /// Check the required fields
    pub fn validate(&self) -> Result<(), P2pError> {
        if self.server.is_empty() || self.game_token.is_empty() || self.game_secret.is_empty() {
            return Err(P2pError::InvalidArgument(
                "Must specify server, game_token, and game_secret".to_string(),
            ));
        }
        Ok(())
    }

    pub fn blacklist_ttl(&self) -> Duration {
        Duration::from_millis(self.blacklist_ttl_ms)
    }
}

// ============================================================================
// Hints
// ============================================================================

/// String key/value tuning knobs, settable at runtime
#[derive(Debug, Clone, Default)]
pub struct Hints {
    values: HashMap<String, String>,
}

impl Hints {
    pub fn new(initial: HashMap<String, String>) -> Self {
        Self { values: initial }
    }

    pub fn set(&mut self, name: &str, value: &str) {
        self.values.insert(name.to_string(), value.to_string());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Whether the hint is set to a value starting with '1'
    pub fn is_enabled(&self, name: &str) -> bool {
        self.get(name).is_some_and(|v| v.starts_with('1'))
    }
}

//! Lobby membership and attributes
//!
//! Local lobby state only changes when the server confirms it. Update calls
//! from the application are sent as requests and applied when the matching
//! `LobbyDid*` notification arrives.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use super::signaling::{AttributeSet, LobbySnapshot};
use crate::{LobbyId, PeerId};

/// String attributes attached to a lobby or a member
pub type AttributeMap = BTreeMap<String, String>;

/// Lobby visibility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum LobbyType {
    /// Unset; in an update this leaves the type unchanged
    #[default]
    Unknown = 0,
    Private = 1,
    Public = 2,
}

/// How an attribute set is applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AttributeMode {
    /// Keep existing keys, overwrite the given ones
    #[default]
    Merge,
    /// Clear everything first
    Replace,
}

/// Apply `set` to `target`; an empty value erases its key
pub fn apply_attributes(target: &mut AttributeMap, set: &AttributeSet) {
    if set.mode == AttributeMode::Replace {
        target.clear();
    }
    for (key, value) in &set.attributes {
        if value.is_empty() {
            target.remove(key);
        } else {
            target.insert(key.clone(), value.clone());
        }
    }
}

// ============================================================================
// Lobby
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lobby {
    pub lobby_id: LobbyId,
    pub owner: PeerId,
    pub lobby_type: LobbyType,
    pub max_members: u16,
    pub attributes: AttributeMap,
    pub members: BTreeMap<PeerId, AttributeMap>,
}

impl Lobby {
    pub fn new(lobby_id: LobbyId, owner: PeerId, lobby_type: LobbyType, max_members: u16) -> Self {
        Self {
            lobby_id,
            owner,
            lobby_type,
            max_members,
            attributes: AttributeMap::new(),
            members: BTreeMap::new(),
        }
    }

    pub fn from_snapshot(lobby_id: LobbyId, snapshot: LobbySnapshot) -> Self {
        Self {
            lobby_id,
            owner: snapshot.owner,
            lobby_type: snapshot.lobby_type,
            max_members: snapshot.max_members,
            attributes: snapshot.attributes,
            members: snapshot.members,
        }
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn has_member(&self, peer: PeerId) -> bool {
        self.members.contains_key(&peer)
    }

    pub fn member_ids(&self) -> Vec<PeerId> {
        self.members.keys().copied().collect()
    }

    pub fn add_member(&mut self, peer: PeerId, attributes: AttributeMap) {
        self.members.insert(peer, attributes);
    }

    pub fn remove_member(&mut self, peer: PeerId) -> bool {
        self.members.remove(&peer).is_some()
    }

    /// Apply a server-confirmed update; `Unknown` type and 0 max are ignored
    pub fn apply_update(
        &mut self,
        lobby_type: LobbyType,
        max_members: u16,
        attribute_set: Option<&AttributeSet>,
    ) {
        if lobby_type != LobbyType::Unknown {
            self.lobby_type = lobby_type;
        }
        if max_members != 0 {
            self.max_members = max_members;
        }
        if let Some(set) = attribute_set {
            apply_attributes(&mut self.attributes, set);
        }
    }

    /// Apply member attributes; returns false if the peer is not a member
    pub fn apply_member_update(&mut self, peer: PeerId, set: &AttributeSet) -> bool {
        match self.members.get_mut(&peer) {
            Some(attrs) => {
                apply_attributes(attrs, set);
                true
            }
            None => false,
        }
    }
}

// ============================================================================
// Lobby Store
// ============================================================================

/// Lobbies this peer created or joined
#[derive(Debug, Default)]
pub struct LobbyStore {
    lobbies: HashMap<LobbyId, Lobby>,
}

impl LobbyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, lobby: Lobby) {
        log::debug!(
            "lobby {} stored (owner {}, {} members)",
            lobby.lobby_id,
            lobby.owner,
            lobby.member_count()
        );
        self.lobbies.insert(lobby.lobby_id, lobby);
    }

    pub fn remove(&mut self, lobby_id: LobbyId) -> Option<Lobby> {
        self.lobbies.remove(&lobby_id)
    }

    pub fn get(&self, lobby_id: LobbyId) -> Option<&Lobby> {
        self.lobbies.get(&lobby_id)
    }

    pub fn get_mut(&mut self, lobby_id: LobbyId) -> Option<&mut Lobby> {
        self.lobbies.get_mut(&lobby_id)
    }

    pub fn contains(&self, lobby_id: LobbyId) -> bool {
        self.lobbies.contains_key(&lobby_id)
    }

    pub fn len(&self) -> usize {
        self.lobbies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lobbies.is_empty()
    }

    pub fn clear(&mut self) {
        self.lobbies.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> AttributeMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_merge_keeps_existing_and_erases_empty() {
        let mut target = attrs(&[("map", "dm1"), ("mode", "ffa"), ("motd", "hi")]);
        let set = AttributeSet {
            mode: AttributeMode::Merge,
            attributes: attrs(&[("map", "dm2"), ("motd", "")]),
        };

        apply_attributes(&mut target, &set);

        assert_eq!(target, attrs(&[("map", "dm2"), ("mode", "ffa")]));
    }

    #[test]
    fn test_replace_clears_first() {
        let mut target = attrs(&[("map", "dm1"), ("mode", "ffa")]);
        let set = AttributeSet {
            mode: AttributeMode::Replace,
            attributes: attrs(&[("rules", "tdm")]),
        };

        apply_attributes(&mut target, &set);

        assert_eq!(target, attrs(&[("rules", "tdm")]));
    }

    #[test]
    fn test_apply_update_ignores_unset_fields() {
        let mut lobby = Lobby::new(1, 10, LobbyType::Private, 4);

        lobby.apply_update(LobbyType::Unknown, 0, None);
        assert_eq!(lobby.lobby_type, LobbyType::Private);
        assert_eq!(lobby.max_members, 4);

        lobby.apply_update(LobbyType::Public, 8, None);
        assert_eq!(lobby.lobby_type, LobbyType::Public);
        assert_eq!(lobby.max_members, 8);
    }

    #[test]
    fn test_member_update_requires_membership() {
        let mut lobby = Lobby::new(1, 10, LobbyType::Public, 4);
        lobby.add_member(10, AttributeMap::new());

        let set = AttributeSet {
            mode: AttributeMode::Merge,
            attributes: attrs(&[("ready", "1")]),
        };
        assert!(lobby.apply_member_update(10, &set));
        assert!(!lobby.apply_member_update(11, &set));
        assert_eq!(lobby.members[&10], attrs(&[("ready", "1")]));
    }

    #[test]
    fn test_store_insert_remove() {
        let mut store = LobbyStore::new();
        let mut lobby = Lobby::new(5, 1, LobbyType::Private, 2);
        lobby.add_member(1, AttributeMap::new());
        store.insert(lobby);

        assert!(store.contains(5));
        assert_eq!(store.get(5).map(Lobby::member_count), Some(1));
        assert_eq!(store.len(), 1);

        assert!(store.remove(5).is_some());
        assert!(store.is_empty());
    }
}

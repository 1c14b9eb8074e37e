//! Short-term peer blacklist
//!
//! A peer whose inbound connection failed (or who refused us) is ignored for
//! a while. Entries expire lazily: the check that finds an expired entry
//! evicts it and reports the peer as not blacklisted.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::PeerId;

#[derive(Debug)]
pub struct Blacklist {
    ttl: Duration,
    entries: HashMap<PeerId, Instant>,
}

impl Blacklist {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Blacklist `peer` until `now + ttl`
    pub fn insert(&mut self, peer: PeerId, now: Instant) {
        let expires = now + self.ttl;
        log::debug!("blacklisting peer {} for {:?}", peer, self.ttl);
        self.entries.insert(peer, expires);
    }

    /// Whether `peer` is currently blacklisted; evicts an expired entry
    pub fn is_blacklisted(&mut self, peer: PeerId, now: Instant) -> bool {
        match self.entries.get(&peer) {
            Some(&expires) if now < expires => true,
            Some(_) => {
                log::trace!("blacklist entry for peer {} expired", peer);
                self.entries.remove(&peer);
                false
            }
            None => false,
        }
    }

    pub fn remove(&mut self, peer: PeerId) {
        self.entries.remove(&peer);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

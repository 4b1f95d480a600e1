//! Local-Origin Set
//!
//! Identifiers of records this client just wrote. The realtime reconciler
//! consumes one tag per inbound notification to recognise our own writes
//! echoing back. Tags expire after a fixed lifetime.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::domain::{Group, GroupId, Item};

/// Stable identifier carried by a change notification
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EchoKey {
    /// Group rows are matched by id
    Group(GroupId),
    /// Item rows are matched by element reference
    Element(String),
}

/// Records that can be recognised when they echo back
pub trait EchoSource {
    fn echo_key(&self) -> EchoKey;
}

impl EchoSource for Group {
    fn echo_key(&self) -> EchoKey {
        EchoKey::Group(self.id)
    }
}

impl EchoSource for Item {
    fn echo_key(&self) -> EchoKey {
        EchoKey::Element(self.element_ref.clone())
    }
}

#[derive(Debug)]
pub struct EchoSet {
    ttl: Duration,
    /// One expiry per expected echo
    entries: HashMap<EchoKey, Vec<Instant>>,
}

impl EchoSet {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Expect one more echo for `key`
    pub fn tag(&mut self, key: EchoKey) {
        let expires = Instant::now() + self.ttl;
        self.entries.entry(key).or_default().push(expires);
    }

    pub fn tag_all(&mut self, keys: impl IntoIterator<Item = EchoKey>) {
        for key in keys {
            self.tag(key);
        }
    }

    /// Withdraw one expectation per key (the write never happened)
    pub fn untag_all(&mut self, keys: impl IntoIterator<Item = EchoKey>) {
        for key in keys {
            if let Some(expiries) = self.entries.get_mut(&key) {
                expiries.pop();
                if expiries.is_empty() {
                    self.entries.remove(&key);
                }
            }
        }
    }

    /// Consume one live tag for `key`; false if none is left
    pub fn take(&mut self, key: &EchoKey) -> bool {
        self.purge_expired();
        let Some(expiries) = self.entries.get_mut(key) else {
            return false;
        };
        // Oldest first
        expiries.remove(0);
        if expiries.is_empty() {
            self.entries.remove(key);
        }
        true
    }

    pub fn contains(&self, key: &EchoKey) -> bool {
        let now = Instant::now();
        self.entries
            .get(key)
            .map_or(false, |expiries| expiries.iter().any(|at| *at > now))
    }

    /// Live tags across all keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.values().flatten().filter(|at| **at > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn purge_expired(&mut self) {
        let now = Instant::now();
        self.entries.retain(|_, expiries| {
            expiries.retain(|at| *at > now);
            !expiries.is_empty()
        });
    }
}

//! Connection registries: capacity-bounded tables of live connections.
//!
//! One instance tracks clients, another tracks peer servers. Each entry holds
//! the per-connection metadata the reactor needs: the heartbeat miss counter,
//! the remote listen address (peers) and the nickname (clients).
//!
//! Lookups on an absent handle return [`RegistryError::NotFound`]; the same
//! connection can be found dead by both an I/O failure and the heartbeat
//! sweep, so callers treat `NotFound` as "already cleaned up".

use std::collections::HashMap;
use std::fmt;

use super::message::PeerAddr;

/// Nickname given to clients until they announce one.
pub const DEFAULT_NICK: &str = "guest";

/// Heartbeat counter value meaning "answered since the last sweep".
const ANSWERED: i32 = -1;

/// Opaque identifier for one connection. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl ConnId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("{what} full ({max} max)")]
    CapacityExceeded { what: &'static str, max: usize },
    #[error("connection {0} is already registered")]
    DuplicateHandle(ConnId),
    #[error("connection {0} is not registered")]
    NotFound(ConnId),
}

#[derive(Debug, Clone)]
struct Entry {
    missed: i32,
    listen_addr: Option<PeerAddr>,
    nickname: String,
}

#[derive(Debug)]
pub struct ConnectionRegistry {
    what: &'static str,
    max: usize,
    entries: HashMap<ConnId, Entry>,
}

impl ConnectionRegistry {
    /// `what` names the registry in errors and logs ("clients", "peers").
    pub fn new(what: &'static str, max: usize) -> Self {
        Self {
            what,
            max,
            entries: HashMap::new(),
        }
    }

    pub fn add(
        &mut self,
        id: ConnId,
        listen_addr: Option<PeerAddr>,
        nickname: Option<&str>,
    ) -> Result<(), RegistryError> {
        if self.entries.len() >= self.max {
            return Err(RegistryError::CapacityExceeded {
                what: self.what,
                max: self.max,
            });
        }
        if self.entries.contains_key(&id) {
            return Err(RegistryError::DuplicateHandle(id));
        }
        self.entries.insert(
            id,
            Entry {
                missed: ANSWERED,
                listen_addr,
                nickname: nickname.unwrap_or(DEFAULT_NICK).to_owned(),
            },
        );
        Ok(())
    }

    /// Returns whether the handle was present. Removing twice is harmless.
    pub fn remove(&mut self, id: ConnId) -> bool {
        self.entries.remove(&id).is_some()
    }

    pub fn contains(&self, id: ConnId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of every registered handle, in id order.
    pub fn handles(&self) -> Vec<ConnId> {
        let mut ids: Vec<ConnId> = self.entries.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn entry(&self, id: ConnId) -> Result<&Entry, RegistryError> {
        self.entries.get(&id).ok_or(RegistryError::NotFound(id))
    }

    fn entry_mut(&mut self, id: ConnId) -> Result<&mut Entry, RegistryError> {
        self.entries.get_mut(&id).ok_or(RegistryError::NotFound(id))
    }

    pub fn nickname(&self, id: ConnId) -> Result<&str, RegistryError> {
        Ok(&self.entry(id)?.nickname)
    }

    /// Returns whether the stored nickname actually changed.
    pub fn set_nickname(&mut self, id: ConnId, nickname: &str) -> Result<bool, RegistryError> {
        let entry = self.entry_mut(id)?;
        if entry.nickname == nickname {
            return Ok(false);
        }
        entry.nickname = nickname.to_owned();
        Ok(true)
    }

    pub fn listen_addr(&self, id: ConnId) -> Result<Option<&PeerAddr>, RegistryError> {
        Ok(self.entry(id)?.listen_addr.as_ref())
    }

    /// Listen addresses of every entry that advertised one.
    pub fn listen_addrs(&self) -> Vec<PeerAddr> {
        let mut addrs: Vec<PeerAddr> = self
            .entries
            .values()
            .filter_map(|e| e.listen_addr.clone())
            .collect();
        addrs.sort();
        addrs
    }

    pub fn missed_heartbeats(&self, id: ConnId) -> Result<i32, RegistryError> {
        Ok(self.entry(id)?.missed)
    }

    pub fn set_missed_heartbeats(&mut self, id: ConnId, missed: i32) -> Result<(), RegistryError> {
        self.entry_mut(id)?.missed = missed;
        Ok(())
    }

    /// Record a `BLEED` answer from `id`.
    pub fn heartbeat_received(&mut self, id: ConnId) -> Result<(), RegistryError> {
        self.set_missed_heartbeats(id, ANSWERED)
    }

    /// Advance every miss counter by one heartbeat period.
    ///
    /// Entries that answered since the last sweep drop back to 0, the rest
    /// count up to `threshold`. Entries already at the threshold are returned
    /// for eviction; the registry itself does not remove them.
    pub fn sweep(&mut self, threshold: i32) -> Vec<ConnId> {
        let mut expired = Vec::new();
        for (id, entry) in self.entries.iter_mut() {
            if entry.missed < 0 {
                entry.missed = 0;
            } else if entry.missed < threshold {
                entry.missed += 1;
            } else {
                expired.push(*id);
            }
        }
        expired.sort_unstable();
        expired
    }
}

//! Channel membership: channel name → set of joined client handles.
//!
//! Channels are created by the first join and deleted in the same step the
//! last member leaves, so a tracked channel never has an empty member set.

use std::collections::{HashMap, HashSet};

use super::registry::{ConnId, RegistryError};

#[derive(Debug)]
pub struct ChannelRegistry {
    max_channels: usize,
    max_members: usize,
    channels: HashMap<String, HashSet<ConnId>>,
}

impl ChannelRegistry {
    pub fn new(max_channels: usize, max_members: usize) -> Self {
        Self {
            max_channels,
            max_members,
            channels: HashMap::new(),
        }
    }

    /// Add `id` to `channel`, creating it if needed.
    ///
    /// Returns `Ok(true)` when a new membership was created and `Ok(false)`
    /// when `id` was already a member.
    pub fn join(&mut self, id: ConnId, channel: &str) -> Result<bool, RegistryError> {
        match self.channels.get_mut(channel) {
            Some(members) => {
                if members.contains(&id) {
                    return Ok(false);
                }
                if members.len() >= self.max_members {
                    return Err(RegistryError::CapacityExceeded {
                        what: "channel",
                        max: self.max_members,
                    });
                }
                members.insert(id);
            }
            None => {
                if self.channels.len() >= self.max_channels {
                    return Err(RegistryError::CapacityExceeded {
                        what: "channels",
                        max: self.max_channels,
                    });
                }
                self.channels.insert(channel.to_owned(), HashSet::from([id]));
            }
        }
        Ok(true)
    }

    /// Remove `id` from `channel`. Returns whether it had been a member.
    pub fn part(&mut self, id: ConnId, channel: &str) -> bool {
        let Some(members) = self.channels.get_mut(channel) else {
            return false;
        };
        let was_member = members.remove(&id);
        if members.is_empty() {
            self.channels.remove(channel);
        }
        was_member
    }

    /// Remove `id` from every channel. Returns the channels it left, once each.
    pub fn part_all(&mut self, id: ConnId) -> Vec<String> {
        let mut parted = Vec::new();
        self.channels.retain(|name, members| {
            if members.remove(&id) {
                parted.push(name.clone());
            }
            !members.is_empty()
        });
        parted.sort();
        parted
    }

    /// Snapshot of the members of `channel`; empty if it doesn't exist.
    pub fn members(&self, channel: &str) -> Vec<ConnId> {
        let mut ids: Vec<ConnId> = self
            .channels
            .get(channel)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    pub fn is_member(&self, id: ConnId, channel: &str) -> bool {
        self.channels
            .get(channel)
            .is_some_and(|members| members.contains(&id))
    }

    /// Channels `id` currently belongs to.
    pub fn channels_of(&self, id: ConnId) -> Vec<String> {
        let mut names: Vec<String> = self
            .channels
            .iter()
            .filter(|(_, members)| members.contains(&id))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn contains(&self, channel: &str) -> bool {
        self.channels.contains_key(channel)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn id(n: u64) -> ConnId {
        ConnId::new(n)
    }

    #[test]
    fn first_join_creates_channel() {
        let mut channels = ChannelRegistry::new(4, 4);
        assert!(channels.join(id(1), "lobby").unwrap());
        assert!(channels.contains("lobby"));
        assert_eq!(channels.members("lobby"), vec![id(1)]);
    }

    #[test]
    fn rejoin_is_a_silent_no_op() {
        let mut channels = ChannelRegistry::new(4, 4);
        channels.join(id(1), "lobby").unwrap();
        assert!(!channels.join(id(1), "lobby").unwrap());
        assert_eq!(channels.members("lobby"), vec![id(1)]);
    }

    #[test]
    fn rejoin_of_full_channel_is_still_a_no_op() {
        let mut channels = ChannelRegistry::new(4, 1);
        channels.join(id(1), "lobby").unwrap();
        assert_eq!(channels.join(id(1), "lobby"), Ok(false));
    }

    #[test]
    fn join_beyond_member_cap_fails() {
        let mut channels = ChannelRegistry::new(4, 2);
        channels.join(id(1), "lobby").unwrap();
        channels.join(id(2), "lobby").unwrap();
        assert_eq!(
            channels.join(id(3), "lobby"),
            Err(RegistryError::CapacityExceeded {
                what: "channel",
                max: 2
            })
        );
        assert_eq!(channels.members("lobby"), vec![id(1), id(2)]);
    }

    #[test]
    fn join_beyond_channel_cap_fails() {
        let mut channels = ChannelRegistry::new(1, 8);
        channels.join(id(1), "lobby").unwrap();
        assert_eq!(
            channels.join(id(1), "other"),
            Err(RegistryError::CapacityExceeded {
                what: "channels",
                max: 1
            })
        );
        assert!(!channels.contains("other"));
        // Existing channels still accept members.
        assert!(channels.join(id(2), "lobby").unwrap());
    }

    #[test]
    fn join_then_part_restores_previous_state() {
        let mut channels = ChannelRegistry::new(4, 4);
        channels.join(id(1), "lobby").unwrap();

        channels.join(id(2), "fresh").unwrap();
        assert!(channels.part(id(2), "fresh"));
        assert!(!channels.contains("fresh"));

        channels.join(id(2), "lobby").unwrap();
        assert!(channels.part(id(2), "lobby"));
        assert_eq!(channels.members("lobby"), vec![id(1)]);
        assert_eq!(channels.len(), 1);
    }

    #[test]
    fn part_of_non_member_reports_false() {
        let mut channels = ChannelRegistry::new(4, 4);
        channels.join(id(1), "lobby").unwrap();
        assert!(!channels.part(id(2), "lobby"));
        assert!(!channels.part(id(1), "missing"));
        assert!(channels.contains("lobby"));
    }

    #[test]
    fn part_all_leaves_handle_in_no_channel() {
        let mut channels = ChannelRegistry::new(8, 8);
        channels.join(id(1), "a").unwrap();
        channels.join(id(1), "b").unwrap();
        channels.join(id(2), "b").unwrap();
        channels.join(id(2), "c").unwrap();

        assert_eq!(channels.part_all(id(1)), vec!["a".to_string(), "b".to_string()]);
        assert!(channels.channels_of(id(1)).is_empty());
        // "a" emptied and is gone, "b" keeps its other member.
        assert!(!channels.contains("a"));
        assert_eq!(channels.members("b"), vec![id(2)]);
        assert!(channels.part_all(id(1)).is_empty());
    }

    #[test]
    fn members_of_missing_channel_is_empty() {
        let channels = ChannelRegistry::new(4, 4);
        assert!(channels.members("nowhere").is_empty());
    }

    #[test]
    fn members_is_a_snapshot() {
        let mut channels = ChannelRegistry::new(4, 4);
        channels.join(id(1), "lobby").unwrap();
        let mut snapshot = channels.members("lobby");
        snapshot.push(id(99));
        snapshot.clear();
        assert_eq!(channels.members("lobby"), vec![id(1)]);
    }

    #[test]
    fn channels_of_lists_memberships() {
        let mut channels = ChannelRegistry::new(4, 4);
        channels.join(id(1), "z").unwrap();
        channels.join(id(1), "m").unwrap();
        assert_eq!(channels.channels_of(id(1)), vec!["m".to_string(), "z".to_string()]);
        assert!(channels.is_member(id(1), "m"));
        assert!(!channels.is_member(id(2), "m"));
    }
}

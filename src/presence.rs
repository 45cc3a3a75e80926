//! Room membership with reference counting
//!
//! Several screens may show the same conversation. Only the first join and
//! the last leave produce wire traffic. Each room remembers the link its
//! join was written to, since the server forgets rooms with the socket.

use crate::protocol::PendingCommand;
use std::collections::HashMap;

#[derive(Debug)]
struct Room {
    refs: u32,
    /// `None` while the join is queued for the next link
    link_epoch: Option<u64>,
}

impl Room {
    /// Joined on a link other than the one commands now go to
    fn is_stale(&self, link_epoch: Option<u64>) -> bool {
        self.link_epoch.is_some() && self.link_epoch != link_epoch
    }
}

/// Tracks joined conversation rooms
#[derive(Debug, Default)]
pub struct PresenceManager {
    rooms: HashMap<String, Room>,
}

impl PresenceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a reference. Returns the `Join` command on the 0 -> 1 transition,
    /// or when the room was joined on a link that is no longer written to.
    ///
    /// `link_epoch` is the link the command will be written to, if any.
    pub fn join(&mut self, conversation_id: &str, link_epoch: Option<u64>) -> Option<PendingCommand> {
        let join = self.refresh(conversation_id, link_epoch);
        let room = self.rooms.get_mut(conversation_id)?;
        room.refs += 1;
        tracing::debug!(conv_id = %conversation_id, refs = room.refs, "Room joined");
        join
    }

    /// Make sure the room is joined on the current link without adding a
    /// reference beyond the first
    pub fn ensure_joined(&mut self, conversation_id: &str, link_epoch: Option<u64>) -> Option<PendingCommand> {
        let join = self.refresh(conversation_id, link_epoch);
        let room = self.rooms.get_mut(conversation_id)?;
        room.refs = room.refs.max(1);
        join
    }

    fn refresh(&mut self, conversation_id: &str, link_epoch: Option<u64>) -> Option<PendingCommand> {
        match self.rooms.get_mut(conversation_id) {
            Some(room) if room.refs > 0 && !room.is_stale(link_epoch) => None,
            Some(room) => {
                tracing::debug!(conv_id = %conversation_id, "Rejoining room on the current link");
                room.link_epoch = link_epoch;
                Some(PendingCommand::join(conversation_id))
            }
            None => {
                self.rooms
                    .insert(conversation_id.to_string(), Room { refs: 0, link_epoch });
                Some(PendingCommand::join(conversation_id))
            }
        }
    }

    /// Drop a reference. Returns the `Leave` command on the 1 -> 0 transition.
    ///
    /// Leaving a room that is not joined does nothing.
    pub fn leave(&mut self, conversation_id: &str) -> Option<PendingCommand> {
        let room = self.rooms.get_mut(conversation_id)?;
        room.refs = room.refs.saturating_sub(1);
        tracing::debug!(conv_id = %conversation_id, refs = room.refs, "Room left");

        if room.refs == 0 {
            self.rooms.remove(conversation_id);
            Some(PendingCommand::leave(conversation_id))
        } else {
            None
        }
    }

    pub fn is_joined(&self, conversation_id: &str) -> bool {
        self.rooms.contains_key(conversation_id)
    }

    pub fn ref_count(&self, conversation_id: &str) -> u32 {
        self.rooms.get(conversation_id).map_or(0, |room| room.refs)
    }

    pub fn joined_rooms(&self) -> Vec<String> {
        let mut rooms: Vec<String> = self.rooms.keys().cloned().collect();
        rooms.sort();
        rooms
    }

    /// Joins queued while unattached were written to link `epoch`
    pub fn bind_link(&mut self, epoch: u64) {
        for room in self.rooms.values_mut().filter(|room| room.link_epoch.is_none()) {
            room.link_epoch = Some(epoch);
        }
    }

    /// Forget rooms joined on link `epoch` or an older one. No `Leave`
    /// commands: the server already dropped them with the socket.
    pub fn release_link(&mut self, epoch: u64) -> Vec<String> {
        let mut released: Vec<String> = self
            .rooms
            .iter()
            .filter(|(_, room)| room.link_epoch.is_some_and(|e| e <= epoch))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &released {
            self.rooms.remove(id);
        }
        released.sort();
        released
    }

    /// Forget every membership. The server drops rooms with the socket, so
    /// no `Leave` commands are produced.
    pub fn release_all(&mut self) -> Vec<String> {
        let mut released: Vec<String> = self.rooms.drain().map(|(id, _)| id).collect();
        released.sort();
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CommandKind;

    #[test]
    fn test_only_first_join_and_last_leave_hit_the_wire() {
        let mut presence = PresenceManager::new();

        let first = presence.join("c1", None).unwrap();
        assert_eq!(first.kind, CommandKind::Join);
        assert!(presence.join("c1", None).is_none());
        assert_eq!(presence.ref_count("c1"), 2);

        assert!(presence.leave("c1").is_none());
        assert!(presence.is_joined("c1"));

        let last = presence.leave("c1").unwrap();
        assert_eq!(last.kind, CommandKind::Leave);
        assert_eq!(last.conversation_id, "c1");
        assert!(!presence.is_joined("c1"));
    }

    #[test]
    fn test_leave_without_join_is_noop() {
        let mut presence = PresenceManager::new();
        assert!(presence.leave("c1").is_none());
        assert_eq!(presence.ref_count("c1"), 0);
    }

    #[test]
    fn test_rooms_are_independent() {
        let mut presence = PresenceManager::new();
        presence.join("c1", None);
        presence.join("c2", None);
        presence.leave("c1");
        assert_eq!(presence.joined_rooms(), vec!["c2".to_string()]);
    }

    #[test]
    fn test_release_all_clears_memberships_quietly() {
        let mut presence = PresenceManager::new();
        presence.join("b", None);
        presence.join("a", None);
        presence.join("a", None);

        assert_eq!(presence.release_all(), vec!["a".to_string(), "b".to_string()]);
        assert!(presence.joined_rooms().is_empty());
        // A fresh join after release is a first join again
        assert!(presence.join("a", None).is_some());
    }

    #[test]
    fn test_rooms_from_a_dead_link_are_joined_again() {
        let mut presence = PresenceManager::new();
        presence.join("c1", Some(1));
        presence.join("c2", Some(1));

        // Link 2 is attached before the loss of link 1 is processed
        let rejoin = presence.join("c1", Some(2)).unwrap();
        assert_eq!(rejoin.kind, CommandKind::Join);
        assert_eq!(presence.ref_count("c1"), 2);
        assert!(presence.ensure_joined("c2", Some(2)).is_some());
        assert!(presence.ensure_joined("c2", Some(2)).is_none());
        assert_eq!(presence.ref_count("c2"), 1);

        assert!(presence.release_link(1).is_empty());
        assert_eq!(presence.joined_rooms(), vec!["c1".to_string(), "c2".to_string()]);
    }

    #[test]
    fn test_release_link_keeps_newer_and_queued_rooms() {
        let mut presence = PresenceManager::new();
        presence.join("old", Some(1));
        presence.join("new", Some(2));
        presence.join("queued", None);

        assert_eq!(presence.release_link(1), vec!["old".to_string()]);
        assert_eq!(presence.joined_rooms(), vec!["new".to_string(), "queued".to_string()]);

        presence.bind_link(2);
        assert_eq!(presence.release_link(2), vec!["new".to_string(), "queued".to_string()]);
    }
}

//! Record types owned by the state backend.

use roomcast_proto::{DeliveredMessage, ListName, MessagePayload};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet, VecDeque};

/// One connection instance for a user.
///
/// A socket belongs to exactly one user and one instance; it exists only
/// while its transport connection is alive (or until recovery reclaims it).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocketRecord {
    pub id: String,
    pub user: String,
    /// Owning cluster instance.
    pub instance: String,
    /// Rooms this socket has joined.
    pub rooms: HashSet<String>,
}

impl SocketRecord {
    pub fn new(id: impl Into<String>, user: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            user: user.into(),
            instance: instance.into(),
            rooms: HashSet::new(),
        }
    }
}

/// A logical identity, possibly multi-socket.
///
/// Removed by the backend when its last socket goes away.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub name: String,
    pub sockets: HashSet<String>,
    /// Direct-messaging permission lists, checked against the *recipient*.
    #[serde(default)]
    pub direct: DirectLists,
}

impl UserRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sockets: HashSet::new(),
            direct: DirectLists::default(),
        }
    }
}

/// Per-user direct-messaging permission lists.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DirectLists {
    pub whitelist: BTreeSet<String>,
    pub blacklist: BTreeSet<String>,
    pub whitelist_only: bool,
}

impl DirectLists {
    /// May `from` message the owner of these lists?
    pub fn allows(&self, from: &str) -> bool {
        if self.blacklist.contains(from) {
            return false;
        }
        if self.whitelist_only && !self.whitelist.contains(from) {
            return false;
        }
        true
    }

    pub fn list(&self, name: ListName) -> Option<&BTreeSet<String>> {
        match name {
            ListName::Whitelist => Some(&self.whitelist),
            ListName::Blacklist => Some(&self.blacklist),
            ListName::Adminlist | ListName::Userlist => None,
        }
    }

    pub fn list_mut(&mut self, name: ListName) -> Option<&mut BTreeSet<String>> {
        match name {
            ListName::Whitelist => Some(&mut self.whitelist),
            ListName::Blacklist => Some(&mut self.blacklist),
            ListName::Adminlist | ListName::Userlist => None,
        }
    }
}

/// One delivered room message, retained in the room's history ring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Monotonic per room, assigned under the room lock.
    pub id: u64,
    pub author: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub payload: MessagePayload,
}

impl HistoryEntry {
    pub fn to_delivered(&self) -> DeliveredMessage {
        DeliveredMessage {
            id: Some(self.id),
            author: self.author.clone(),
            timestamp: self.timestamp,
            payload: self.payload.clone(),
        }
    }
}

/// A named channel with permission lists and a bounded history ring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomRecord {
    pub name: String,
    pub owner: Option<String>,
    pub whitelist: BTreeSet<String>,
    pub blacklist: BTreeSet<String>,
    pub adminlist: BTreeSet<String>,
    pub whitelist_only: bool,
    /// Users currently joined (the `userlist` view).
    pub joined: BTreeSet<String>,
    pub history: VecDeque<HistoryEntry>,
    /// Last assigned message id; ids are gap-free from 1.
    pub last_id: u64,
}

impl RoomRecord {
    pub fn new(name: impl Into<String>, owner: Option<String>, whitelist_only: bool) -> Self {
        let mut adminlist = BTreeSet::new();
        if let Some(owner) = &owner {
            adminlist.insert(owner.clone());
        }
        Self {
            name: name.into(),
            owner,
            whitelist: BTreeSet::new(),
            blacklist: BTreeSet::new(),
            adminlist,
            whitelist_only,
            joined: BTreeSet::new(),
            history: VecDeque::new(),
            last_id: 0,
        }
    }

    /// Owner and adminlist members administer the room.
    pub fn is_admin(&self, user: &str) -> bool {
        self.owner.as_deref() == Some(user) || self.adminlist.contains(user)
    }

    /// Join admission check. The blacklist always wins; whitelist mode
    /// restricts join to listed or admin users.
    pub fn may_join(&self, user: &str) -> bool {
        if self.blacklist.contains(user) {
            return false;
        }
        if self.is_admin(user) {
            return true;
        }
        !self.whitelist_only || self.whitelist.contains(user)
    }

    pub fn list(&self, name: ListName) -> &BTreeSet<String> {
        match name {
            ListName::Whitelist => &self.whitelist,
            ListName::Blacklist => &self.blacklist,
            ListName::Adminlist => &self.adminlist,
            ListName::Userlist => &self.joined,
        }
    }

    /// Mutable access to a permission list. `Userlist` is a derived view
    /// and cannot be mutated directly.
    pub fn list_mut(&mut self, name: ListName) -> Option<&mut BTreeSet<String>> {
        match name {
            ListName::Whitelist => Some(&mut self.whitelist),
            ListName::Blacklist => Some(&mut self.blacklist),
            ListName::Adminlist => Some(&mut self.adminlist),
            ListName::Userlist => None,
        }
    }

    /// Append an entry with the next id, evicting the oldest past `max_size`.
    pub fn append_history(
        &mut self,
        author: &str,
        timestamp: i64,
        payload: MessagePayload,
        max_size: usize,
    ) -> u64 {
        self.last_id += 1;
        self.history.push_back(HistoryEntry {
            id: self.last_id,
            author: author.to_string(),
            timestamp,
            payload,
        });
        while self.history.len() > max_size {
            self.history.pop_front();
        }
        self.last_id
    }

    /// Entries with id greater than `after_id`, oldest first, capped at `limit`.
    pub fn history_after(&self, after_id: u64, limit: usize) -> Vec<HistoryEntry> {
        self.history
            .iter()
            .filter(|e| e.id > after_id)
            .take(limit)
            .cloned()
            .collect()
    }
}

/// Liveness record for a cluster member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceHeartbeat {
    pub instance: String,
    /// Milliseconds since the Unix epoch.
    pub last_seen: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomcast_proto::MessagePayload;

    fn room() -> RoomRecord {
        RoomRecord::new("lobby", Some("alice".into()), false)
    }

    #[test]
    fn owner_is_admin_and_seeded_in_adminlist() {
        let r = room();
        assert!(r.is_admin("alice"));
        assert!(r.adminlist.contains("alice"));
        assert!(!r.is_admin("bob"));
    }

    #[test]
    fn blacklist_wins_over_whitelist() {
        let mut r = room();
        r.whitelist.insert("bob".into());
        r.blacklist.insert("bob".into());
        assert!(!r.may_join("bob"));
    }

    #[test]
    fn whitelist_mode_restricts_join() {
        let mut r = room();
        r.whitelist_only = true;
        assert!(!r.may_join("bob"));
        r.whitelist.insert("bob".into());
        assert!(r.may_join("bob"));
        // Admins are exempt.
        assert!(r.may_join("alice"));
    }

    #[test]
    fn history_ids_are_monotonic_and_ring_is_bounded() {
        let mut r = room();
        for i in 0..5 {
            let id = r.append_history("alice", i, MessagePayload::text("m"), 3);
            assert_eq!(id, (i + 1) as u64);
        }
        assert_eq!(r.history.len(), 3);
        // Oldest evicted first: ids 3..=5 remain.
        assert_eq!(r.history.front().unwrap().id, 3);
        assert_eq!(r.history_after(3, 10).iter().map(|e| e.id).collect::<Vec<_>>(), vec![4, 5]);
        assert_eq!(r.history_after(0, 1).len(), 1);
    }

    #[test]
    fn userlist_is_not_mutable() {
        let mut r = room();
        assert!(r.list_mut(ListName::Userlist).is_none());
        assert!(r.list_mut(ListName::Whitelist).is_some());
    }

    #[test]
    fn direct_lists_check_the_sender() {
        let mut d = DirectLists::default();
        assert!(d.allows("carol"));
        d.blacklist.insert("carol".into());
        assert!(!d.allows("carol"));
        d.blacklist.clear();
        d.whitelist_only = true;
        assert!(!d.allows("carol"));
        d.whitelist.insert("carol".into());
        assert!(d.allows("carol"));
    }
}

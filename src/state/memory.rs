//! In-memory state backend.
//!
//! Single-process concurrent maps. Lock primitives keep the same expiry
//! semantics as the shared backend so the lock manager behaves identically,
//! even though contention within one process is the only contention there is.

use super::types::{InstanceHeartbeat, RoomRecord, SocketRecord, UserRecord};
use super::{LockHolder, StateBackend};
use crate::error::{ChatError, ChatResult};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use roomcast_proto::{ListName, MessagePayload};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

const SUBSCRIBER_BUFFER: usize = 256;

#[derive(Debug, Clone)]
struct LockEntry {
    holder: LockHolder,
    deadline: Instant,
}

impl LockEntry {
    fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

/// Single-process backend over concurrent maps.
#[derive(Default)]
pub struct MemoryBackend {
    sockets: DashMap<String, SocketRecord>,
    users: DashMap<String, UserRecord>,
    rooms: DashMap<String, RoomRecord>,
    locks: DashMap<String, LockEntry>,
    heartbeats: DashMap<String, i64>,
    subscribers: Mutex<Vec<(String, mpsc::Sender<Vec<u8>>)>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn count_user_sockets_in_room(&self, user: &str, room: &str) -> usize {
        let Some(u) = self.users.get(user) else { return 0 };
        u.sockets
            .iter()
            .filter(|sid| {
                self.sockets
                    .get(sid.as_str())
                    .is_some_and(|s| s.rooms.contains(room))
            })
            .count()
    }
}

#[async_trait]
impl StateBackend for MemoryBackend {
    async fn add_socket(&self, socket: SocketRecord) -> ChatResult<usize> {
        let user = socket.user.clone();
        self.sockets.insert(socket.id.clone(), socket.clone());
        let mut entry = self
            .users
            .entry(user.clone())
            .or_insert_with(|| UserRecord::new(user));
        entry.sockets.insert(socket.id);
        Ok(entry.sockets.len())
    }

    async fn remove_socket(&self, socket_id: &str) -> ChatResult<Option<(SocketRecord, usize)>> {
        let Some((_, record)) = self.sockets.remove(socket_id) else {
            return Ok(None);
        };
        let mut remaining = 0;
        let mut drop_user = false;
        if let Some(mut user) = self.users.get_mut(&record.user) {
            user.sockets.remove(socket_id);
            remaining = user.sockets.len();
            drop_user = remaining == 0;
        }
        if drop_user {
            self.users.remove(&record.user);
        }
        Ok(Some((record, remaining)))
    }

    async fn socket(&self, socket_id: &str) -> ChatResult<Option<SocketRecord>> {
        Ok(self.sockets.get(socket_id).map(|s| s.clone()))
    }

    async fn user(&self, name: &str) -> ChatResult<Option<UserRecord>> {
        Ok(self.users.get(name).map(|u| u.clone()))
    }

    async fn user_sockets(&self, name: &str) -> ChatResult<Vec<SocketRecord>> {
        let Some(user) = self.users.get(name) else {
            return Ok(Vec::new());
        };
        let ids: Vec<String> = user.sockets.iter().cloned().collect();
        drop(user);
        Ok(ids
            .iter()
            .filter_map(|sid| self.sockets.get(sid).map(|s| s.clone()))
            .collect())
    }

    async fn instance_sockets(&self, instance: &str) -> ChatResult<Vec<SocketRecord>> {
        Ok(self
            .sockets
            .iter()
            .filter(|s| s.instance == instance)
            .map(|s| s.clone())
            .collect())
    }

    async fn add_direct_member(
        &self,
        user: &str,
        list: ListName,
        member: &str,
        limit: usize,
    ) -> ChatResult<bool> {
        let mut record = self
            .users
            .get_mut(user)
            .ok_or_else(|| ChatError::no_user(user))?;
        let set = record
            .direct
            .list_mut(list)
            .ok_or_else(|| ChatError::NotAllowed(format!("list {list} is not mutable")))?;
        if set.contains(member) {
            return Ok(false);
        }
        if set.len() >= limit {
            return Err(ChatError::NotAllowed(format!("list {list} is full")));
        }
        set.insert(member.to_string());
        Ok(true)
    }

    async fn remove_direct_member(
        &self,
        user: &str,
        list: ListName,
        member: &str,
    ) -> ChatResult<bool> {
        let mut record = self
            .users
            .get_mut(user)
            .ok_or_else(|| ChatError::no_user(user))?;
        let set = record
            .direct
            .list_mut(list)
            .ok_or_else(|| ChatError::NotAllowed(format!("list {list} is not mutable")))?;
        Ok(set.remove(member))
    }

    async fn set_direct_whitelist_mode(&self, user: &str, mode: bool) -> ChatResult<()> {
        let mut record = self
            .users
            .get_mut(user)
            .ok_or_else(|| ChatError::no_user(user))?;
        record.direct.whitelist_only = mode;
        Ok(())
    }

    async fn create_room(&self, room: RoomRecord) -> ChatResult<bool> {
        use dashmap::mapref::entry::Entry;
        match self.rooms.entry(room.name.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(v) => {
                v.insert(room);
                Ok(true)
            }
        }
    }

    async fn remove_room(&self, name: &str) -> ChatResult<bool> {
        Ok(self.rooms.remove(name).is_some())
    }

    async fn room(&self, name: &str) -> ChatResult<Option<RoomRecord>> {
        Ok(self.rooms.get(name).map(|r| r.clone()))
    }

    async fn join_room(&self, room: &str, user: &str, socket_id: &str) -> ChatResult<usize> {
        let fresh = {
            let mut socket = self
                .sockets
                .get_mut(socket_id)
                .ok_or_else(|| ChatError::no_socket(socket_id))?;
            socket.rooms.insert(room.to_string())
        };
        match self.rooms.get_mut(room) {
            Some(mut record) => {
                record.joined.insert(user.to_string());
            }
            None => {
                // Room vanished: undo the socket write so no phantom
                // membership survives the failed join.
                if fresh {
                    if let Some(mut socket) = self.sockets.get_mut(socket_id) {
                        socket.rooms.remove(room);
                    }
                }
                return Err(ChatError::no_room(room));
            }
        }
        Ok(self.count_user_sockets_in_room(user, room))
    }

    async fn leave_room(&self, room: &str, user: &str, socket_id: &str) -> ChatResult<usize> {
        if let Some(mut socket) = self.sockets.get_mut(socket_id) {
            socket.rooms.remove(room);
        }
        let remaining = self.count_user_sockets_in_room(user, room);
        if remaining == 0 {
            if let Some(mut record) = self.rooms.get_mut(room) {
                record.joined.remove(user);
            }
        }
        Ok(remaining)
    }

    async fn append_history(
        &self,
        room: &str,
        author: &str,
        timestamp: i64,
        payload: MessagePayload,
        max_size: usize,
    ) -> ChatResult<u64> {
        let mut record = self
            .rooms
            .get_mut(room)
            .ok_or_else(|| ChatError::no_room(room))?;
        Ok(record.append_history(author, timestamp, payload, max_size))
    }

    async fn add_list_member(
        &self,
        room: &str,
        list: ListName,
        member: &str,
        limit: usize,
    ) -> ChatResult<bool> {
        let mut record = self
            .rooms
            .get_mut(room)
            .ok_or_else(|| ChatError::no_room(room))?;
        let set = record
            .list_mut(list)
            .ok_or_else(|| ChatError::NotAllowed(format!("list {list} is not mutable")))?;
        if set.contains(member) {
            return Ok(false);
        }
        if set.len() >= limit {
            return Err(ChatError::NotAllowed(format!("list {list} is full")));
        }
        set.insert(member.to_string());
        Ok(true)
    }

    async fn remove_list_member(
        &self,
        room: &str,
        list: ListName,
        member: &str,
    ) -> ChatResult<bool> {
        let mut record = self
            .rooms
            .get_mut(room)
            .ok_or_else(|| ChatError::no_room(room))?;
        let set = record
            .list_mut(list)
            .ok_or_else(|| ChatError::NotAllowed(format!("list {list} is not mutable")))?;
        Ok(set.remove(member))
    }

    async fn set_whitelist_mode(&self, room: &str, mode: bool) -> ChatResult<()> {
        let mut record = self
            .rooms
            .get_mut(room)
            .ok_or_else(|| ChatError::no_room(room))?;
        record.whitelist_only = mode;
        Ok(())
    }

    async fn try_lock(&self, key: &str, holder: &LockHolder, ttl: Duration) -> ChatResult<bool> {
        let mut entry = self.locks.entry(key.to_string()).or_insert_with(|| LockEntry {
            holder: holder.clone(),
            deadline: Instant::now() + ttl,
        });
        if entry.holder.token == holder.token {
            // Fresh insert above, or re-entry with the same token.
            entry.deadline = Instant::now() + ttl;
            return Ok(true);
        }
        if entry.expired() {
            *entry = LockEntry { holder: holder.clone(), deadline: Instant::now() + ttl };
            return Ok(true);
        }
        Ok(false)
    }

    async fn unlock(&self, key: &str, token: &str) -> ChatResult<bool> {
        let removed = self
            .locks
            .remove_if(key, |_, e| e.holder.token == token && !e.expired());
        Ok(removed.is_some())
    }

    async fn renew_lock(&self, key: &str, token: &str, ttl: Duration) -> ChatResult<bool> {
        let Some(mut entry) = self.locks.get_mut(key) else {
            return Ok(false);
        };
        if entry.holder.token != token || entry.expired() {
            return Ok(false);
        }
        entry.deadline = Instant::now() + ttl;
        Ok(true)
    }

    async fn release_instance_locks(&self, instance: &str) -> ChatResult<usize> {
        let before = self.locks.len();
        self.locks.retain(|_, e| e.holder.instance != instance);
        Ok(before - self.locks.len())
    }

    async fn write_heartbeat(&self, instance: &str, now_ms: i64) -> ChatResult<()> {
        self.heartbeats.insert(instance.to_string(), now_ms);
        Ok(())
    }

    async fn heartbeats(&self) -> ChatResult<Vec<InstanceHeartbeat>> {
        Ok(self
            .heartbeats
            .iter()
            .map(|e| InstanceHeartbeat { instance: e.key().clone(), last_seen: *e.value() })
            .collect())
    }

    async fn remove_heartbeat(&self, instance: &str) -> ChatResult<()> {
        self.heartbeats.remove(instance);
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> ChatResult<()> {
        let targets: Vec<mpsc::Sender<Vec<u8>>> = {
            let mut subs = self.subscribers.lock();
            subs.retain(|(_, tx)| !tx.is_closed());
            subs.iter()
                .filter(|(c, _)| c == channel)
                .map(|(_, tx)| tx.clone())
                .collect()
        };
        for tx in targets {
            let _ = tx.send(payload.clone()).await;
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> ChatResult<mpsc::Receiver<Vec<u8>>> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers.lock().push((channel.to_string(), tx));
        Ok(rx)
    }
}

//! Shared state backend over a key-value store.
//!
//! Every record lives under a typed key prefix in a store reachable by all
//! instances. Single-key read-modify-writes go through a compare-and-swap
//! loop so two racing instances observe one consistent winner; cross-key
//! sequences rely on the lock manager and the saga runner, exactly like the
//! in-memory backend.

use super::types::{InstanceHeartbeat, RoomRecord, SocketRecord, UserRecord};
use super::kv::KvStore;
use super::{LockHolder, StateBackend};
use crate::error::{ChatError, ChatResult};
use async_trait::async_trait;
use roomcast_proto::{ListName, MessagePayload};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Attempts before a contended compare-and-swap loop reports `Busy`.
const CAS_RETRIES: usize = 16;

fn socket_key(id: &str) -> String {
    format!("socket:{id}")
}

fn user_key(name: &str) -> String {
    format!("user:{name}")
}

fn room_key(name: &str) -> String {
    format!("room:{name}")
}

fn lock_key(key: &str) -> String {
    format!("lock:{key}")
}

fn heartbeat_key(instance: &str) -> String {
    format!("hb:{instance}")
}

fn encode<T: Serialize>(value: &T) -> ChatResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| ChatError::Internal(format!("encode record: {e}")))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> ChatResult<T> {
    serde_json::from_slice(bytes).map_err(|e| ChatError::Internal(format!("decode record: {e}")))
}

/// State backend over a shared [`KvStore`].
pub struct StoreBackend {
    kv: Arc<dyn KvStore>,
}

impl StoreBackend {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> ChatResult<Option<T>> {
        match self.kv.get(key).await? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Compare-and-swap loop over one existing record.
    async fn rmw_existing<T, R, F>(&self, key: &str, not_found: ChatError, mut f: F) -> ChatResult<R>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(&mut T) -> ChatResult<R> + Send,
    {
        for _ in 0..CAS_RETRIES {
            let Some(bytes) = self.kv.get(key).await? else {
                return Err(not_found.clone());
            };
            let mut value: T = decode(&bytes)?;
            let result = f(&mut value)?;
            let updated = encode(&value)?;
            if self.kv.compare_and_swap(key, Some(&bytes), updated).await? {
                return Ok(result);
            }
        }
        Err(ChatError::Busy(key.to_string()))
    }

    /// Compare-and-swap loop that creates the record when absent.
    async fn rmw_or_insert<T, R, F, I>(&self, key: &str, init: I, mut f: F) -> ChatResult<R>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(&mut T) -> ChatResult<R> + Send,
        I: Fn() -> T + Send + Sync,
    {
        for _ in 0..CAS_RETRIES {
            let current = self.kv.get(key).await?;
            let (mut value, expected) = match &current {
                Some(bytes) => (decode::<T>(bytes)?, Some(bytes.as_slice())),
                None => (init(), None),
            };
            let result = f(&mut value)?;
            let updated = encode(&value)?;
            if self.kv.compare_and_swap(key, expected, updated).await? {
                return Ok(result);
            }
        }
        Err(ChatError::Busy(key.to_string()))
    }

    async fn count_user_sockets_in_room(&self, user: &str, room: &str) -> ChatResult<usize> {
        Ok(self
            .user_sockets(user)
            .await?
            .iter()
            .filter(|s| s.rooms.contains(room))
            .count())
    }
}

#[async_trait]
impl StateBackend for StoreBackend {
    async fn add_socket(&self, socket: SocketRecord) -> ChatResult<usize> {
        let user = socket.user.clone();
        let socket_id = socket.id.clone();
        self.kv.set(&socket_key(&socket.id), encode(&socket)?).await?;
        self.rmw_or_insert(
            &user_key(&user),
            || UserRecord::new(user.clone()),
            move |u: &mut UserRecord| {
                u.sockets.insert(socket_id.clone());
                Ok(u.sockets.len())
            },
        )
        .await
    }

    async fn remove_socket(&self, socket_id: &str) -> ChatResult<Option<(SocketRecord, usize)>> {
        let Some(record) = self.get_json::<SocketRecord>(&socket_key(socket_id)).await? else {
            return Ok(None);
        };
        self.kv.delete(&socket_key(socket_id)).await?;

        let key = user_key(&record.user);
        for _ in 0..CAS_RETRIES {
            let Some(bytes) = self.kv.get(&key).await? else {
                return Ok(Some((record, 0)));
            };
            let mut user: UserRecord = decode(&bytes)?;
            user.sockets.remove(socket_id);
            if user.sockets.is_empty() {
                // Last socket: the user record goes with it.
                if self.kv.compare_and_delete(&key, &bytes).await? {
                    return Ok(Some((record, 0)));
                }
            } else {
                let remaining = user.sockets.len();
                if self.kv.compare_and_swap(&key, Some(&bytes), encode(&user)?).await? {
                    return Ok(Some((record, remaining)));
                }
            }
        }
        Err(ChatError::Busy(key))
    }

    async fn socket(&self, socket_id: &str) -> ChatResult<Option<SocketRecord>> {
        self.get_json(&socket_key(socket_id)).await
    }

    async fn user(&self, name: &str) -> ChatResult<Option<UserRecord>> {
        self.get_json(&user_key(name)).await
    }

    async fn user_sockets(&self, name: &str) -> ChatResult<Vec<SocketRecord>> {
        let Some(user) = self.user(name).await? else {
            return Ok(Vec::new());
        };
        let mut sockets = Vec::with_capacity(user.sockets.len());
        for id in &user.sockets {
            if let Some(socket) = self.get_json::<SocketRecord>(&socket_key(id)).await? {
                sockets.push(socket);
            }
        }
        Ok(sockets)
    }

    async fn instance_sockets(&self, instance: &str) -> ChatResult<Vec<SocketRecord>> {
        let mut sockets = Vec::new();
        for key in self.kv.keys_with_prefix("socket:").await? {
            if let Some(socket) = self.get_json::<SocketRecord>(&key).await? {
                if socket.instance == instance {
                    sockets.push(socket);
                }
            }
        }
        Ok(sockets)
    }

    async fn add_direct_member(
        &self,
        user: &str,
        list: ListName,
        member: &str,
        limit: usize,
    ) -> ChatResult<bool> {
        let member = member.to_string();
        self.rmw_existing(&user_key(user), ChatError::no_user(user), move |u: &mut UserRecord| {
            let set = u
                .direct
                .list_mut(list)
                .ok_or_else(|| ChatError::NotAllowed(format!("list {list} is not mutable")))?;
            if set.contains(&member) {
                return Ok(false);
            }
            if set.len() >= limit {
                return Err(ChatError::NotAllowed(format!("list {list} is full")));
            }
            set.insert(member.clone());
            Ok(true)
        })
        .await
    }

    async fn remove_direct_member(
        &self,
        user: &str,
        list: ListName,
        member: &str,
    ) -> ChatResult<bool> {
        let member = member.to_string();
        self.rmw_existing(&user_key(user), ChatError::no_user(user), move |u: &mut UserRecord| {
            let set = u
                .direct
                .list_mut(list)
                .ok_or_else(|| ChatError::NotAllowed(format!("list {list} is not mutable")))?;
            Ok(set.remove(&member))
        })
        .await
    }

    async fn set_direct_whitelist_mode(&self, user: &str, mode: bool) -> ChatResult<()> {
        self.rmw_existing(&user_key(user), ChatError::no_user(user), move |u: &mut UserRecord| {
            u.direct.whitelist_only = mode;
            Ok(())
        })
        .await
    }

    async fn create_room(&self, room: RoomRecord) -> ChatResult<bool> {
        let key = room_key(&room.name);
        Ok(self.kv.compare_and_swap(&key, None, encode(&room)?).await?)
    }

    async fn remove_room(&self, name: &str) -> ChatResult<bool> {
        Ok(self.kv.delete(&room_key(name)).await?)
    }

    async fn room(&self, name: &str) -> ChatResult<Option<RoomRecord>> {
        self.get_json(&room_key(name)).await
    }

    async fn join_room(&self, room: &str, user: &str, socket_id: &str) -> ChatResult<usize> {
        let room_name = room.to_string();
        let fresh = self
            .rmw_existing(
                &socket_key(socket_id),
                ChatError::no_socket(socket_id),
                move |s: &mut SocketRecord| Ok(s.rooms.insert(room_name.clone())),
            )
            .await?;
        let user_name = user.to_string();
        let joined = self
            .rmw_existing(&room_key(room), ChatError::no_room(room), move |r: &mut RoomRecord| {
                r.joined.insert(user_name.clone());
                Ok(())
            })
            .await;
        if let Err(err) = joined {
            // Room vanished: undo the socket write so no phantom
            // membership survives the failed join.
            if fresh {
                let room_name = room.to_string();
                let _ = self
                    .rmw_existing(
                        &socket_key(socket_id),
                        ChatError::no_socket(socket_id),
                        move |s: &mut SocketRecord| {
                            s.rooms.remove(&room_name);
                            Ok(())
                        },
                    )
                    .await;
            }
            return Err(err);
        }
        self.count_user_sockets_in_room(user, room).await
    }

    async fn leave_room(&self, room: &str, user: &str, socket_id: &str) -> ChatResult<usize> {
        let room_name = room.to_string();
        // Tolerate an already-gone socket: leave must stay idempotent.
        let _ = self
            .rmw_existing(
                &socket_key(socket_id),
                ChatError::no_socket(socket_id),
                move |s: &mut SocketRecord| {
                    s.rooms.remove(&room_name);
                    Ok(())
                },
            )
            .await;
        let remaining = self.count_user_sockets_in_room(user, room).await?;
        if remaining == 0 {
            let user_name = user.to_string();
            let _ = self
                .rmw_existing(&room_key(room), ChatError::no_room(room), move |r: &mut RoomRecord| {
                    r.joined.remove(&user_name);
                    Ok(())
                })
                .await;
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
        let author = author.to_string();
        self.rmw_existing(&room_key(room), ChatError::no_room(room), move |r: &mut RoomRecord| {
            Ok(r.append_history(&author, timestamp, payload.clone(), max_size))
        })
        .await
    }

    async fn add_list_member(
        &self,
        room: &str,
        list: ListName,
        member: &str,
        limit: usize,
    ) -> ChatResult<bool> {
        let member = member.to_string();
        self.rmw_existing(&room_key(room), ChatError::no_room(room), move |r: &mut RoomRecord| {
            let set = r
                .list_mut(list)
                .ok_or_else(|| ChatError::NotAllowed(format!("list {list} is not mutable")))?;
            if set.contains(&member) {
                return Ok(false);
            }
            if set.len() >= limit {
                return Err(ChatError::NotAllowed(format!("list {list} is full")));
            }
            set.insert(member.clone());
            Ok(true)
        })
        .await
    }

    async fn remove_list_member(
        &self,
        room: &str,
        list: ListName,
        member: &str,
    ) -> ChatResult<bool> {
        let member = member.to_string();
        self.rmw_existing(&room_key(room), ChatError::no_room(room), move |r: &mut RoomRecord| {
            let set = r
                .list_mut(list)
                .ok_or_else(|| ChatError::NotAllowed(format!("list {list} is not mutable")))?;
            Ok(set.remove(&member))
        })
        .await
    }

    async fn set_whitelist_mode(&self, room: &str, mode: bool) -> ChatResult<()> {
        self.rmw_existing(&room_key(room), ChatError::no_room(room), move |r: &mut RoomRecord| {
            r.whitelist_only = mode;
            Ok(())
        })
        .await
    }

    async fn try_lock(&self, key: &str, holder: &LockHolder, ttl: Duration) -> ChatResult<bool> {
        let lock = lock_key(key);
        let value = encode(holder)?;
        if self.kv.set_nx_px(&lock, value.clone(), ttl).await? {
            return Ok(true);
        }
        // Re-entry by the same token refreshes the TTL.
        if let Some(current) = self.kv.get(&lock).await? {
            let existing: LockHolder = decode(&current)?;
            if existing.token == holder.token {
                return Ok(self.kv.compare_and_expire(&lock, &current, ttl).await?);
            }
        }
        Ok(false)
    }

    async fn unlock(&self, key: &str, token: &str) -> ChatResult<bool> {
        let lock = lock_key(key);
        let Some(current) = self.kv.get(&lock).await? else {
            return Ok(false);
        };
        let holder: LockHolder = decode(&current)?;
        if holder.token != token {
            return Ok(false);
        }
        Ok(self.kv.compare_and_delete(&lock, &current).await?)
    }

    async fn renew_lock(&self, key: &str, token: &str, ttl: Duration) -> ChatResult<bool> {
        let lock = lock_key(key);
        let Some(current) = self.kv.get(&lock).await? else {
            return Ok(false);
        };
        let holder: LockHolder = decode(&current)?;
        if holder.token != token {
            return Ok(false);
        }
        Ok(self.kv.compare_and_expire(&lock, &current, ttl).await?)
    }

    async fn release_instance_locks(&self, instance: &str) -> ChatResult<usize> {
        let mut released = 0;
        for key in self.kv.keys_with_prefix("lock:").await? {
            let Some(current) = self.kv.get(&key).await? else { continue };
            let holder: LockHolder = decode(&current)?;
            if holder.instance == instance && self.kv.compare_and_delete(&key, &current).await? {
                released += 1;
            }
        }
        Ok(released)
    }

    async fn write_heartbeat(&self, instance: &str, now_ms: i64) -> ChatResult<()> {
        self.kv
            .set(&heartbeat_key(instance), encode(&now_ms)?)
            .await?;
        Ok(())
    }

    async fn heartbeats(&self) -> ChatResult<Vec<InstanceHeartbeat>> {
        let mut beats = Vec::new();
        for key in self.kv.keys_with_prefix("hb:").await? {
            let Some(bytes) = self.kv.get(&key).await? else { continue };
            let instance = key.trim_start_matches("hb:").to_string();
            beats.push(InstanceHeartbeat { instance, last_seen: decode(&bytes)? });
        }
        Ok(beats)
    }

    async fn remove_heartbeat(&self, instance: &str) -> ChatResult<()> {
        self.kv.delete(&heartbeat_key(instance)).await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> ChatResult<()> {
        Ok(self.kv.publish(channel, payload).await?)
    }

    async fn subscribe(&self, channel: &str) -> ChatResult<mpsc::Receiver<Vec<u8>>> {
        Ok(self.kv.subscribe(channel).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::super::kv::MemoryKv;
    use super::*;

    fn backend() -> StoreBackend {
        StoreBackend::new(Arc::new(MemoryKv::new()))
    }

    #[tokio::test]
    async fn records_survive_the_kv_round_trip() {
        let b = backend();
        b.add_socket(SocketRecord::new("s1", "alice", "n1")).await.unwrap();
        b.create_room(RoomRecord::new("lobby", Some("alice".into()), false))
            .await
            .unwrap();
        assert_eq!(b.join_room("lobby", "alice", "s1").await.unwrap(), 1);

        let room = b.room("lobby").await.unwrap().unwrap();
        assert!(room.joined.contains("alice"));
        assert!(room.is_admin("alice"));

        let id = b
            .append_history("lobby", "alice", 1, MessagePayload::text("hi"), 10)
            .await
            .unwrap();
        assert_eq!(id, 1);
    }

    #[tokio::test]
    async fn failed_join_leaves_no_phantom_membership() {
        let b = backend();
        b.add_socket(SocketRecord::new("s1", "alice", "n1")).await.unwrap();
        let err = b.join_room("ghost", "alice", "s1").await.unwrap_err();
        assert_eq!(err.error_code(), "not_found");
        assert!(b.socket("s1").await.unwrap().unwrap().rooms.is_empty());
    }

    #[tokio::test]
    async fn duplicate_room_creation_loses_the_race() {
        let b = backend();
        assert!(b.create_room(RoomRecord::new("lobby", None, false)).await.unwrap());
        assert!(!b.create_room(RoomRecord::new("lobby", None, true)).await.unwrap());
        // The first creation's state is untouched.
        assert!(!b.room("lobby").await.unwrap().unwrap().whitelist_only);
    }

    #[tokio::test]
    async fn two_backends_share_one_store() {
        let kv = Arc::new(MemoryKv::new());
        let a = StoreBackend::new(kv.clone());
        let b = StoreBackend::new(kv);

        a.add_socket(SocketRecord::new("s1", "alice", "node-a")).await.unwrap();
        let seen = b.instance_sockets("node-a").await.unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].id, "s1");

        let holder = LockHolder { instance: "node-a".into(), token: "t".into() };
        assert!(a.try_lock("room:lobby", &holder, Duration::from_secs(5)).await.unwrap());
        let other = LockHolder { instance: "node-b".into(), token: "u".into() };
        assert!(!b.try_lock("room:lobby", &other, Duration::from_secs(5)).await.unwrap());
        assert_eq!(b.release_instance_locks("node-a").await.unwrap(), 1);
        assert!(b.try_lock("room:lobby", &other, Duration::from_secs(5)).await.unwrap());
    }
}

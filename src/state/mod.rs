//! State backends.
//!
//! Two interchangeable implementations share one contract: [`MemoryBackend`]
//! keeps everything in single-process concurrent maps; [`StoreBackend`]
//! keeps every record in an external key-value store reachable by all
//! instances, expressed through the [`kv::KvStore`] client contract.
//!
//! Every mutation is idempotent-safe to retry: re-applying an add/remove is
//! a no-op, not an error, because cluster messages may be redelivered.

pub mod kv;
mod memory;
mod store;
mod types;

pub use memory::MemoryBackend;
pub use store::StoreBackend;
pub use types::{
    DirectLists, HistoryEntry, InstanceHeartbeat, RoomRecord, SocketRecord, UserRecord,
};

use crate::error::ChatResult;
use async_trait::async_trait;
use roomcast_proto::{ListName, MessagePayload};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Identity of a lock holder: the owning instance plus a per-acquisition
/// token so a stale holder can never release a successor's lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockHolder {
    pub instance: String,
    pub token: String,
}

/// The state backend contract.
///
/// Owns User, Socket, Room, and heartbeat records, the lock primitives the
/// [`crate::lock::LockManager`] layers on, and the pub/sub capability the
/// [`crate::bus::ClusterBus`] rides.
#[async_trait]
pub trait StateBackend: Send + Sync {
    // --- sockets and users ---

    /// Register a socket, creating its user record if absent.
    /// Returns the user's socket count after the add.
    async fn add_socket(&self, socket: SocketRecord) -> ChatResult<usize>;

    /// Remove a socket. The user record goes with its last socket.
    /// Returns the removed record and the user's remaining socket count;
    /// `None` if the socket was already gone.
    async fn remove_socket(&self, socket_id: &str) -> ChatResult<Option<(SocketRecord, usize)>>;

    async fn socket(&self, socket_id: &str) -> ChatResult<Option<SocketRecord>>;

    async fn user(&self, name: &str) -> ChatResult<Option<UserRecord>>;

    async fn user_sockets(&self, name: &str) -> ChatResult<Vec<SocketRecord>>;

    /// All sockets owned by a cluster instance, for recovery.
    async fn instance_sockets(&self, instance: &str) -> ChatResult<Vec<SocketRecord>>;

    // --- direct-messaging lists ---

    /// Add to a per-user direct list. `Ok(false)` when already present;
    /// `NotAllowed` when the add would exceed `limit`.
    async fn add_direct_member(
        &self,
        user: &str,
        list: ListName,
        member: &str,
        limit: usize,
    ) -> ChatResult<bool>;

    async fn remove_direct_member(&self, user: &str, list: ListName, member: &str)
        -> ChatResult<bool>;

    async fn set_direct_whitelist_mode(&self, user: &str, mode: bool) -> ChatResult<()>;

    // --- rooms ---

    /// `Ok(false)` when a room with that name already exists (no change).
    async fn create_room(&self, room: RoomRecord) -> ChatResult<bool>;

    async fn remove_room(&self, name: &str) -> ChatResult<bool>;

    async fn room(&self, name: &str) -> ChatResult<Option<RoomRecord>>;

    /// Associate a socket with a room. Idempotent. Returns the number of the
    /// user's sockets joined to the room after the add.
    async fn join_room(&self, room: &str, user: &str, socket_id: &str) -> ChatResult<usize>;

    /// Inverse of [`join_room`](Self::join_room). Idempotent. Returns the
    /// user's remaining socket count in the room; at zero the user leaves
    /// the room's userlist.
    async fn leave_room(&self, room: &str, user: &str, socket_id: &str) -> ChatResult<usize>;

    /// Append a history entry and bump the room's message id, atomically
    /// with respect to other writers. Returns the assigned id.
    async fn append_history(
        &self,
        room: &str,
        author: &str,
        timestamp: i64,
        payload: MessagePayload,
        max_size: usize,
    ) -> ChatResult<u64>;

    /// Add to a room access list. `Ok(false)` when already present;
    /// `NotAllowed` when the add would exceed `limit`.
    async fn add_list_member(
        &self,
        room: &str,
        list: ListName,
        member: &str,
        limit: usize,
    ) -> ChatResult<bool>;

    async fn remove_list_member(&self, room: &str, list: ListName, member: &str)
        -> ChatResult<bool>;

    async fn set_whitelist_mode(&self, room: &str, mode: bool) -> ChatResult<()>;

    // --- locks ---

    /// Take the lock if free or expired. `Ok(false)` when live-held by
    /// someone else.
    async fn try_lock(&self, key: &str, holder: &LockHolder, ttl: Duration) -> ChatResult<bool>;

    /// Release if still held under `token`. `Ok(false)` when the lock
    /// expired or was taken over.
    async fn unlock(&self, key: &str, token: &str) -> ChatResult<bool>;

    /// Extend the TTL if still held under `token`.
    async fn renew_lock(&self, key: &str, token: &str, ttl: Duration) -> ChatResult<bool>;

    /// Drop every lock held in an instance's name. Returns how many fell.
    async fn release_instance_locks(&self, instance: &str) -> ChatResult<usize>;

    // --- heartbeats ---

    async fn write_heartbeat(&self, instance: &str, now_ms: i64) -> ChatResult<()>;

    async fn heartbeats(&self) -> ChatResult<Vec<InstanceHeartbeat>>;

    async fn remove_heartbeat(&self, instance: &str) -> ChatResult<()>;

    // --- pub/sub ---

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> ChatResult<()>;

    async fn subscribe(&self, channel: &str) -> ChatResult<mpsc::Receiver<Vec<u8>>>;
}

/// Shared trait-object handle used across the engine.
pub type SharedBackend = Arc<dyn StateBackend>;

/// Milliseconds since the Unix epoch; the timestamp all records carry.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

//! Key-value store client contract for the shared backend.
//!
//! The concrete store client library is out of scope; what matters here is
//! its contract: plain get/set, the conditional primitives the shared
//! backend needs to make every read-modify-write race-safe (compare-and-swap,
//! set-if-absent-with-expiry, compare-and-delete/expire), and pub/sub. Any
//! store offering these can back a cluster. [`MemoryKv`] is the in-process
//! implementation used by tests and single-node deployments.

use crate::error::ChatError;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;

const SUBSCRIBER_BUFFER: usize = 256;

/// Store client failures.
#[derive(Debug, Error)]
pub enum KvError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store call timed out: {0}")]
    Timeout(String),
}

impl From<KvError> for ChatError {
    fn from(e: KvError) -> Self {
        match e {
            KvError::Unavailable(detail) => ChatError::Internal(detail),
            KvError::Timeout(what) => ChatError::Timeout(what),
        }
    }
}

pub type KvResult<T> = Result<T, KvError>;

/// The store client contract.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> KvResult<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: Vec<u8>) -> KvResult<()>;

    /// Set only if the key is absent, with a TTL. The lock primitive.
    async fn set_nx_px(&self, key: &str, value: Vec<u8>, ttl: Duration) -> KvResult<bool>;

    /// Replace the value only if the current value equals `expected`
    /// (`None` = key must be absent). The winner of a race is consistent
    /// across all instances.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
    ) -> KvResult<bool>;

    /// Delete only if the current value equals `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> KvResult<bool>;

    /// Refresh the TTL only if the current value equals `expected`.
    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &[u8],
        ttl: Duration,
    ) -> KvResult<bool>;

    async fn delete(&self, key: &str) -> KvResult<bool>;

    async fn keys_with_prefix(&self, prefix: &str) -> KvResult<Vec<String>>;

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> KvResult<()>;

    async fn subscribe(&self, channel: &str) -> KvResult<mpsc::Receiver<Vec<u8>>>;
}

#[derive(Debug, Clone)]
struct ValueEntry {
    data: Vec<u8>,
    expires: Option<Instant>,
}

impl ValueEntry {
    fn live(&self) -> bool {
        self.expires.is_none_or(|deadline| Instant::now() < deadline)
    }
}

/// In-process [`KvStore`]. Expiry is lazy: dead entries are treated as
/// absent on access and overwritten in place.
#[derive(Default)]
pub struct MemoryKv {
    entries: DashMap<String, ValueEntry>,
    subscribers: Mutex<Vec<(String, mpsc::Sender<Vec<u8>>)>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> KvResult<Option<Vec<u8>>> {
        Ok(self
            .entries
            .get(key)
            .filter(|e| e.live())
            .map(|e| e.data.clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> KvResult<()> {
        self.entries
            .insert(key.to_string(), ValueEntry { data: value, expires: None });
        Ok(())
    }

    async fn set_nx_px(&self, key: &str, value: Vec<u8>, ttl: Duration) -> KvResult<bool> {
        use dashmap::mapref::entry::Entry;
        let fresh = ValueEntry { data: value, expires: Some(Instant::now() + ttl) };
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().live() {
                    return Ok(false);
                }
                occupied.insert(fresh);
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
    ) -> KvResult<bool> {
        use dashmap::mapref::entry::Entry;
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                let matches = if current.live() {
                    expected.is_some_and(|e| e == current.data.as_slice())
                } else {
                    expected.is_none()
                };
                if !matches {
                    return Ok(false);
                }
                occupied.insert(ValueEntry { data: value, expires: None });
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    return Ok(false);
                }
                vacant.insert(ValueEntry { data: value, expires: None });
                Ok(true)
            }
        }
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> KvResult<bool> {
        Ok(self
            .entries
            .remove_if(key, |_, e| e.live() && e.data == expected)
            .is_some())
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &[u8],
        ttl: Duration,
    ) -> KvResult<bool> {
        let Some(mut entry) = self.entries.get_mut(key) else {
            return Ok(false);
        };
        if !entry.live() || entry.data != expected {
            return Ok(false);
        }
        entry.expires = Some(Instant::now() + ttl);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> KvResult<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> KvResult<Vec<String>> {
        Ok(self
            .entries
            .iter()
            .filter(|e| e.live() && e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect())
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> KvResult<()> {
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

    async fn subscribe(&self, channel: &str) -> KvResult<mpsc::Receiver<Vec<u8>>> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers.lock().push((channel.to_string(), tx));
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_nx_respects_ttl() {
        let kv = MemoryKv::new();
        assert!(kv.set_nx_px("k", b"a".to_vec(), Duration::from_millis(20)).await.unwrap());
        assert!(!kv.set_nx_px("k", b"b".to_vec(), Duration::from_secs(5)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(kv.set_nx_px("k", b"b".to_vec(), Duration::from_secs(5)).await.unwrap());
        assert_eq!(kv.get("k").await.unwrap().unwrap(), b"b");
    }

    #[tokio::test]
    async fn cas_has_a_single_winner() {
        let kv = MemoryKv::new();
        kv.set("k", b"v0".to_vec()).await.unwrap();
        assert!(kv.compare_and_swap("k", Some(b"v0"), b"v1".to_vec()).await.unwrap());
        // Second writer raced on the same expectation and loses.
        assert!(!kv.compare_and_swap("k", Some(b"v0"), b"v2".to_vec()).await.unwrap());
        assert_eq!(kv.get("k").await.unwrap().unwrap(), b"v1");
    }

    #[tokio::test]
    async fn cas_create_requires_absence() {
        let kv = MemoryKv::new();
        assert!(kv.compare_and_swap("k", None, b"v".to_vec()).await.unwrap());
        assert!(!kv.compare_and_swap("k", None, b"w".to_vec()).await.unwrap());
    }

    #[tokio::test]
    async fn compare_and_delete_checks_value() {
        let kv = MemoryKv::new();
        kv.set("k", b"v".to_vec()).await.unwrap();
        assert!(!kv.compare_and_delete("k", b"other").await.unwrap());
        assert!(kv.compare_and_delete("k", b"v").await.unwrap());
        assert!(kv.get("k").await.unwrap().is_none());
    }
}

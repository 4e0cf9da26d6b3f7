//! TTL-scoped mutual exclusion over named resources.
//!
//! The lock manager is the engine's only mutual-exclusion primitive for
//! cross-instance work. Acquisition on a busy key fails fast; most callers
//! wrap it in a bounded jittered retry via
//! [`LockManager::acquire_with_retry`] and surface `Busy` when the attempts
//! run out.

use crate::error::{ChatError, ChatResult};
use crate::state::{LockHolder, SharedBackend};
use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;
use uuid::Uuid;

/// Lock key for a room resource.
pub fn room_key(name: &str) -> String {
    format!("room:{name}")
}

/// Lock key for a user resource.
pub fn user_key(name: &str) -> String {
    format!("user:{name}")
}

/// Lock key guarding one dead instance's recovery pass.
pub fn recovery_key(instance: &str) -> String {
    format!("recovery:{instance}")
}

/// A held lock. Not a guard: TTL expiry can revoke it at any time, so
/// holders re-verify with [`LockManager::renew`] when an operation runs long
/// and must treat a failed renew as lost exclusivity.
#[derive(Debug, Clone)]
pub struct LockToken {
    pub key: String,
    pub token: String,
}

pub struct LockManager {
    backend: SharedBackend,
    instance: String,
    ttl: Duration,
}

impl LockManager {
    pub fn new(backend: SharedBackend, instance: impl Into<String>, ttl: Duration) -> Self {
        Self { backend, instance: instance.into(), ttl }
    }

    /// Acquire with the configured TTL. Fails fast with `Busy` when the key
    /// is live-held elsewhere; there is no queueing.
    pub async fn acquire(&self, key: &str) -> ChatResult<LockToken> {
        let holder = LockHolder {
            instance: self.instance.clone(),
            token: Uuid::new_v4().to_string(),
        };
        if self.backend.try_lock(key, &holder, self.ttl).await? {
            Ok(LockToken { key: key.to_string(), token: holder.token })
        } else {
            Err(ChatError::Busy(key.to_string()))
        }
    }

    /// Acquire, retrying with jittered backoff. Surfaces `Busy` once the
    /// attempts run out; there is no unbounded queueing.
    pub async fn acquire_with_retry(
        &self,
        key: &str,
        attempts: usize,
        base_backoff: Duration,
    ) -> ChatResult<LockToken> {
        let mut last = ChatError::Busy(key.to_string());
        for attempt in 0..attempts {
            match self.acquire(key).await {
                Ok(token) => return Ok(token),
                Err(e @ ChatError::Busy(_)) => last = e,
                Err(e) => return Err(e),
            }
            let jitter = rand::thread_rng().gen_range(0..=base_backoff.as_millis() as u64);
            sleep(base_backoff * (attempt as u32 + 1) + Duration::from_millis(jitter)).await;
        }
        Err(last)
    }

    /// Release. A `false` return means the lock already expired or was taken
    /// over; harmless, but logged since it implies the op outran its TTL.
    pub async fn release(&self, token: &LockToken) -> ChatResult<bool> {
        let released = self.backend.unlock(&token.key, &token.token).await?;
        if !released {
            warn!(key = %token.key, "lock expired before release");
        }
        Ok(released)
    }

    /// Extend the TTL. `false` means exclusivity was lost.
    pub async fn renew(&self, token: &LockToken) -> ChatResult<bool> {
        self.backend.renew_lock(&token.key, &token.token, self.ttl).await
    }
}

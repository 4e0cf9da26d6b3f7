//! Heartbeats and dead-instance recovery.
//!
//! Each live instance periodically writes its own heartbeat and scans the
//! others. An instance that misses heartbeats becomes `Suspected`, and past
//! the heartbeat timeout, `Dead`. The first survivor to take the dead
//! instance's recovery lock reclaims its sockets, room memberships, and
//! locks with the same compensating operations the command pipeline uses
//! for rollback; late runners observe already-cleaned state and no-op.

use crate::bus::{BusMessage, ClusterBus};
use crate::config::Config;
use crate::error::ChatResult;
use crate::lock::{recovery_key, LockManager};
use crate::saga::undo;
use crate::state::{now_ms, SharedBackend};
use roomcast_proto::Notification;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Liveness classification of a cluster member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    Active,
    /// Missed at least two heartbeat intervals.
    Suspected,
    /// Silent past the heartbeat timeout; eligible for recovery.
    Dead,
}

/// Classify an instance from its last heartbeat.
pub fn classify(now: i64, last_seen: i64, rate: Duration, timeout: Duration) -> InstanceStatus {
    let silence = now.saturating_sub(last_seen);
    if silence > timeout.as_millis() as i64 {
        InstanceStatus::Dead
    } else if silence >= 2 * rate.as_millis() as i64 {
        InstanceStatus::Suspected
    } else {
        InstanceStatus::Active
    }
}

pub struct RecoveryManager {
    backend: SharedBackend,
    locks: Arc<LockManager>,
    bus: Arc<ClusterBus>,
    config: Arc<Config>,
    instance: String,
}

impl RecoveryManager {
    pub fn new(
        backend: SharedBackend,
        locks: Arc<LockManager>,
        bus: Arc<ClusterBus>,
        config: Arc<Config>,
        instance: impl Into<String>,
    ) -> Self {
        Self { backend, locks, bus, config, instance: instance.into() }
    }

    /// Heartbeat-and-scan loop. Runs one pass immediately at startup,
    /// then every heartbeat interval until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: Arc<tokio::sync::Notify>) {
        let mut interval = tokio::time::interval(self.config.timing.heartbeat_rate());
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        // Retried on the next tick; never fatal.
                        warn!(error = %e, "recovery tick failed");
                    }
                }
                _ = shutdown.notified() => break,
            }
        }
    }

    /// One heartbeat write plus a liveness scan.
    pub async fn tick(&self) -> ChatResult<()> {
        self.backend.write_heartbeat(&self.instance, now_ms()).await?;
        let now = now_ms();
        for hb in self.backend.heartbeats().await? {
            if hb.instance == self.instance {
                continue;
            }
            match classify(
                now,
                hb.last_seen,
                self.config.timing.heartbeat_rate(),
                self.config.timing.heartbeat_timeout(),
            ) {
                InstanceStatus::Active => {}
                InstanceStatus::Suspected => {
                    debug!(instance = %hb.instance, "instance suspected");
                }
                InstanceStatus::Dead => {
                    if let Err(e) = self.recover_instance(&hb.instance).await {
                        warn!(instance = %hb.instance, error = %e, "recovery pass failed");
                    }
                }
            }
        }
        Ok(())
    }

    /// Reclaim everything a dead instance left behind. Idempotent and safe
    /// to race from multiple survivors: the recovery lock serializes
    /// cleaners, and a second pass finds nothing left to clean.
    pub async fn recover_instance(&self, dead: &str) -> ChatResult<()> {
        let token = match self
            .locks
            .acquire_with_retry(&recovery_key(dead), 3, Duration::from_millis(50))
            .await
        {
            Ok(token) => token,
            Err(crate::error::ChatError::Busy(_)) => {
                // Another survivor is already cleaning.
                debug!(instance = %dead, "recovery already in progress elsewhere");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let result = self.cleanup(dead).await;
        let _ = self.locks.release(&token).await;
        result
    }

    async fn cleanup(&self, dead: &str) -> ChatResult<()> {
        // Re-check under the lock: the instance may have been cleaned or
        // have come back while we waited.
        let still_dead = self.backend.heartbeats().await?.into_iter().any(|hb| {
            hb.instance == dead
                && classify(
                    now_ms(),
                    hb.last_seen,
                    self.config.timing.heartbeat_rate(),
                    self.config.timing.heartbeat_timeout(),
                ) == InstanceStatus::Dead
        });
        if !still_dead {
            return Ok(());
        }

        let sockets = self.backend.instance_sockets(dead).await?;
        info!(instance = %dead, sockets = sockets.len(), "recovering dead instance");

        let mut affected: BTreeSet<(String, String)> = BTreeSet::new();
        for socket in sockets {
            for room in &socket.rooms {
                undo::leave_room(
                    self.backend.clone(),
                    room.clone(),
                    socket.user.clone(),
                    socket.id.clone(),
                )
                .await?;
                affected.insert((room.clone(), socket.user.clone()));
            }
            undo::remove_socket(self.backend.clone(), socket.id.clone()).await?;
        }

        // Tell surviving members about users the dead instance took along.
        if self.config.features.enable_userlist_updates {
            for (room, user) in affected {
                let gone = self
                    .backend
                    .room(&room)
                    .await?
                    .is_some_and(|r| !r.joined.contains(&user));
                if gone {
                    let _ = self
                        .bus
                        .publish(BusMessage::RoomNotification {
                            room: room.clone(),
                            exclude_socket: None,
                            notification: Notification::RoomUserLeft { room, user },
                        })
                        .await;
                }
            }
        }

        let released = self.backend.release_instance_locks(dead).await?;
        if released > 0 {
            debug!(instance = %dead, released, "released stale locks");
        }
        self.backend.remove_heartbeat(dead).await?;
        Ok(())
    }
}

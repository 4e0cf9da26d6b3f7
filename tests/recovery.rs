//! Dead-instance recovery: reclaiming sockets, rooms, and locks, and
//! staying idempotent across repeated passes.

mod common;

use roomcast::bus::ClusterBus;
use roomcast::lock::{self, LockManager};
use roomcast::recovery::RecoveryManager;
use roomcast::state::{now_ms, MemoryBackend, RoomRecord, SharedBackend, SocketRecord};
use std::sync::Arc;
use std::time::Duration;

struct Cluster {
    backend: SharedBackend,
    recovery: RecoveryManager,
}

/// A survivor's recovery manager over a backend seeded with a dead
/// instance's leftovers.
async fn seeded() -> Cluster {
    let backend: SharedBackend = Arc::new(MemoryBackend::new());
    let config = Arc::new(common::config("survivor"));
    let locks = Arc::new(LockManager::new(
        backend.clone(),
        "survivor",
        config.timing.lock_ttl(),
    ));
    let bus = Arc::new(ClusterBus::new(
        backend.clone(),
        "survivor",
        config.timing.bus_ack_timeout(),
    ));

    backend
        .create_room(RoomRecord::new("lobby", None, false))
        .await
        .unwrap();
    for (socket, user) in [("d1", "alice"), ("d2", "alice"), ("d3", "bob")] {
        backend
            .add_socket(SocketRecord::new(socket, user, "dead-node"))
            .await
            .unwrap();
        backend.join_room("lobby", user, socket).await.unwrap();
    }
    // A lock the dead instance held, and one of ours that must survive.
    let dead_locks = LockManager::new(backend.clone(), "dead-node", Duration::from_secs(3600));
    dead_locks.acquire(&lock::room_key("lobby")).await.unwrap();
    let survivor_locks =
        LockManager::new(backend.clone(), "survivor", Duration::from_secs(3600));
    survivor_locks.acquire(&lock::room_key("other")).await.unwrap();

    // Last heartbeat far past the timeout.
    backend
        .write_heartbeat("dead-node", now_ms() - 60_000)
        .await
        .unwrap();

    let recovery = RecoveryManager::new(backend.clone(), locks, bus, config, "survivor");
    Cluster { backend, recovery }
}

#[tokio::test]
async fn tick_reclaims_a_dead_instance() {
    let c = seeded().await;
    c.recovery.tick().await.unwrap();

    for socket in ["d1", "d2", "d3"] {
        assert!(c.backend.socket(socket).await.unwrap().is_none());
    }
    assert!(c.backend.user("alice").await.unwrap().is_none());
    let room = c.backend.room("lobby").await.unwrap().unwrap();
    assert!(room.joined.is_empty());

    // The dead node's lock is gone; the room can be locked again at once.
    let locks = LockManager::new(c.backend.clone(), "survivor", Duration::from_secs(1));
    locks.acquire(&lock::room_key("lobby")).await.unwrap();

    // The survivor's own lock was untouched.
    assert!(locks.acquire(&lock::room_key("other")).await.is_err());

    // The dead heartbeat is gone; only the survivor's remains.
    let beats = c.backend.heartbeats().await.unwrap();
    assert_eq!(beats.len(), 1);
    assert_eq!(beats[0].instance, "survivor");
}

#[tokio::test]
async fn repeated_recovery_is_a_no_op() {
    let c = seeded().await;
    c.recovery.recover_instance("dead-node").await.unwrap();
    // The heartbeat is gone, so the second pass finds nothing to clean.
    c.recovery.recover_instance("dead-node").await.unwrap();

    let room = c.backend.room("lobby").await.unwrap().unwrap();
    assert!(room.joined.is_empty());
    assert!(c.backend.instance_sockets("dead-node").await.unwrap().is_empty());
}

#[tokio::test]
async fn live_instances_are_left_alone() {
    let c = seeded().await;
    c.backend
        .add_socket(SocketRecord::new("l1", "carol", "lively"))
        .await
        .unwrap();
    c.backend.write_heartbeat("lively", now_ms()).await.unwrap();

    c.recovery.tick().await.unwrap();

    assert!(c.backend.socket("l1").await.unwrap().is_some());
    assert!(c.backend.socket("d1").await.unwrap().is_none());
}

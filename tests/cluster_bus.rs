//! Two instances sharing one store: cross-instance fan-out, echoes, and
//! ejection spanning the bus.

mod common;

use common::{recv_matching, Harness};
use roomcast::hooks::Hooks;
use roomcast::service::Service;
use roomcast::state::kv::MemoryKv;
use roomcast::state::RoomRecord;
use roomcast::transport::MemoryTransport;
use roomcast_proto::Notification;
use serde_json::json;
use std::sync::Arc;

async fn cluster() -> (Harness, Harness) {
    let kv = Arc::new(MemoryKv::new());
    let mut nodes = Vec::new();
    for name in ["n1", "n2"] {
        let transport = Arc::new(MemoryTransport::new());
        let service = Service::start_with_kv(
            common::config(name),
            transport.clone(),
            Hooks::default(),
            kv.clone(),
        )
        .await
        .expect("service start");
        nodes.push(Harness { service, transport });
    }
    let n2 = nodes.pop().unwrap();
    let n1 = nodes.pop().unwrap();
    (n1, n2)
}

#[tokio::test]
async fn room_messages_cross_instances_exactly_once() {
    let (n1, n2) = cluster().await;
    n1.seed_room("lobby", None).await;
    let _alice = n1.connect("a1", "alice").await;
    let mut bob = n2.connect("b1", "bob").await;

    n1.command("a1", "roomJoin", &[json!("lobby")]).await.unwrap();
    n2.command("b1", "roomJoin", &[json!("lobby")]).await.unwrap();

    n1.command("a1", "roomMessage", &[json!("lobby"), json!({"textMessage": "hi"})])
        .await
        .unwrap();

    let n = recv_matching(&mut bob, |n| matches!(n, Notification::RoomMessage { .. })).await;
    match n {
        Notification::RoomMessage { message, .. } => {
            assert_eq!(message.id, Some(1));
            assert_eq!(message.author, "alice");
        }
        other => panic!("unexpected {other:?}"),
    }
    // At-least-once delivery, exactly-once application: no duplicate.
    common::assert_silent(&mut bob).await;
}

#[tokio::test]
async fn user_echoes_reach_sockets_on_other_instances() {
    let (n1, n2) = cluster().await;
    let mut home = n1.connect("a1", "alice").await;
    let _away = n2.connect("a2", "alice").await;

    let echo =
        recv_matching(&mut home, |n| matches!(n, Notification::SocketConnectEcho { .. })).await;
    match echo {
        Notification::SocketConnectEcho { socket, nconnected } => {
            assert_eq!(socket, "a2");
            assert_eq!(nconnected, 2);
        }
        other => panic!("unexpected {other:?}"),
    }

    n2.command("a2", "selfBroadcast", &[json!({"textMessage": "sync"})]).await.unwrap();
    let n = recv_matching(&mut home, |n| matches!(n, Notification::SelfBroadcast { .. })).await;
    match n {
        Notification::SelfBroadcast { message } => {
            assert_eq!(message.payload.text_message.as_deref(), Some("sync"));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn ejection_detaches_remote_channels() {
    let (n1, n2) = cluster().await;
    n1.service
        .backend()
        .create_room(RoomRecord::new("club", Some("owner".to_string()), false))
        .await
        .unwrap();
    let _owner = n1.connect("a1", "owner").await;
    let mut bob = n2.connect("b1", "bob").await;
    n2.command("b1", "roomJoin", &[json!("club")]).await.unwrap();
    assert_eq!(n2.transport.channels_of("b1"), vec!["club".to_string()]);

    n1.command("a1", "roomAddToList", &[json!("club"), json!("blacklist"), json!(["bob"])])
        .await
        .unwrap();

    let _ = recv_matching(&mut bob, |n| matches!(n, Notification::RoomAccessRemoved { .. })).await;
    // n2's deliverer detached the channel on its side of the bus.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(1);
    while !n2.transport.channels_of("b1").is_empty() {
        assert!(std::time::Instant::now() < deadline, "channel never detached");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn server_side_kick_severs_sockets_across_the_cluster() {
    let (n1, n2) = cluster().await;
    let _alice = n1.connect("a1", "alice").await;
    let _bob = n2.connect("b1", "bob").await;
    assert!(n2.transport.is_connected("b1"));

    // Remote: n1 asks b1's owning instance over the bus and awaits the ack,
    // so the socket is gone by the time the call returns.
    n1.service.disconnect_user_sockets("bob").await.unwrap();
    assert!(!n2.transport.is_connected("b1"));

    // Local sockets are told through the transport directly.
    n1.service.disconnect_user_sockets("alice").await.unwrap();
    assert!(!n1.transport.is_connected("a1"));
}

#[tokio::test]
async fn direct_messages_find_users_on_other_instances() {
    let (n1, n2) = cluster().await;
    let _alice = n1.connect("a1", "alice").await;
    let mut bob = n2.connect("b1", "bob").await;

    n1.command("a1", "directMessage", &[json!("bob"), json!({"textMessage": "psst"})])
        .await
        .unwrap();
    let n = recv_matching(&mut bob, |n| matches!(n, Notification::DirectMessage { .. })).await;
    match n {
        Notification::DirectMessage { message } => assert_eq!(message.author, "alice"),
        other => panic!("unexpected {other:?}"),
    }
}

//! End-to-end room flows: join/leave echoes, message fan-out, history.

mod common;

use common::{assert_silent, recv_matching};
use roomcast_proto::Notification;
use serde_json::json;

#[tokio::test]
async fn join_message_history_leave() {
    let h = common::start(common::config("n1")).await;
    h.seed_room("lobby", Some("alice")).await;
    let mut alice = h.connect("s1", "alice").await;
    let mut bob = h.connect("s2", "bob").await;

    assert_eq!(h.command("s1", "roomJoin", &[json!("lobby")]).await.unwrap(), json!(1));
    assert_eq!(h.command("s2", "roomJoin", &[json!("lobby")]).await.unwrap(), json!(1));

    // Alice sees bob arrive.
    let joined = recv_matching(&mut alice, |n| matches!(n, Notification::RoomUserJoined { .. })).await;
    match joined {
        Notification::RoomUserJoined { room, user } => {
            assert_eq!(room, "lobby");
            assert_eq!(user, "bob");
        }
        other => panic!("unexpected {other:?}"),
    }

    let id = h
        .command("s1", "roomMessage", &[json!("lobby"), json!({"textMessage": "hello"})])
        .await
        .unwrap();
    assert_eq!(id, json!(1));

    // Both members receive the fan-out, the author included.
    for rx in [&mut alice, &mut bob] {
        let n = recv_matching(rx, |n| matches!(n, Notification::RoomMessage { .. })).await;
        match n {
            Notification::RoomMessage { room, message } => {
                assert_eq!(room, "lobby");
                assert_eq!(message.id, Some(1));
                assert_eq!(message.author, "alice");
                assert_eq!(message.payload.text_message.as_deref(), Some("hello"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    let history = h
        .command("s2", "roomHistoryGet", &[json!("lobby"), json!(0), json!(10)])
        .await
        .unwrap();
    let entries = history.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["id"], json!(1));
    assert_eq!(entries[0]["author"], json!("alice"));

    assert_eq!(h.command("s2", "roomLeave", &[json!("lobby")]).await.unwrap(), json!(0));
    let left = recv_matching(&mut alice, |n| matches!(n, Notification::RoomUserLeft { .. })).await;
    match left {
        Notification::RoomUserLeft { user, .. } => assert_eq!(user, "bob"),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn join_echo_reaches_other_sockets_of_the_user() {
    let h = common::start(common::config("n1")).await;
    h.seed_room("lobby", None).await;
    let mut first = h.connect("s1", "alice").await;
    let mut second = h.connect("s2", "alice").await;

    // The first socket learns about the second one.
    let echo =
        recv_matching(&mut first, |n| matches!(n, Notification::SocketConnectEcho { .. })).await;
    match echo {
        Notification::SocketConnectEcho { socket, nconnected } => {
            assert_eq!(socket, "s2");
            assert_eq!(nconnected, 2);
        }
        other => panic!("unexpected {other:?}"),
    }

    assert_eq!(h.command("s2", "roomJoin", &[json!("lobby")]).await.unwrap(), json!(1));
    let echo = recv_matching(&mut first, |n| matches!(n, Notification::RoomJoinedEcho { .. })).await;
    match echo {
        Notification::RoomJoinedEcho { room, socket, njoined } => {
            assert_eq!(room, "lobby");
            assert_eq!(socket, "s2");
            assert_eq!(njoined, 1);
        }
        other => panic!("unexpected {other:?}"),
    }
    // The issuing socket got its count in the reply, not as an echo.
    assert_silent(&mut second).await;
}

#[tokio::test]
async fn connect_echo_addresses_only_sockets_present_at_publish() {
    let h = common::start(common::config("n1")).await;
    // Back-to-back connects: the first echo's bus delivery races the second
    // socket's registration.
    let mut first = h.connect("s1", "alice").await;
    let mut second = h.connect("s2", "alice").await;

    let echo =
        recv_matching(&mut first, |n| matches!(n, Notification::SocketConnectEcho { .. })).await;
    match echo {
        Notification::SocketConnectEcho { socket, nconnected } => {
            assert_eq!(socket, "s2");
            assert_eq!(nconnected, 2);
        }
        other => panic!("unexpected {other:?}"),
    }
    // s1 connected alone, so its echo addressed nobody; s2 must never see
    // the echo of a connect it was not yet part of.
    assert_silent(&mut second).await;
}

#[tokio::test]
async fn second_socket_join_does_not_reannounce_the_user() {
    let h = common::start(common::config("n1")).await;
    h.seed_room("lobby", None).await;
    let _alice1 = h.connect("s1", "alice").await;
    let _alice2 = h.connect("s2", "alice").await;
    let mut bob = h.connect("s3", "bob").await;

    h.command("s3", "roomJoin", &[json!("lobby")]).await.unwrap();
    h.command("s1", "roomJoin", &[json!("lobby")]).await.unwrap();
    let joined = recv_matching(&mut bob, |n| matches!(n, Notification::RoomUserJoined { .. })).await;
    match joined {
        Notification::RoomUserJoined { user, .. } => assert_eq!(user, "alice"),
        other => panic!("unexpected {other:?}"),
    }

    // Alice's second socket joins; she is already announced.
    assert_eq!(h.command("s2", "roomJoin", &[json!("lobby")]).await.unwrap(), json!(2));
    assert_silent(&mut bob).await;
}

#[tokio::test]
async fn disconnect_leaves_rooms_and_echoes_remaining_count() {
    let h = common::start(common::config("n1")).await;
    h.seed_room("lobby", None).await;
    let mut s1 = h.connect("s1", "alice").await;
    let _s2 = h.connect("s2", "alice").await;
    let _ = recv_matching(&mut s1, |n| matches!(n, Notification::SocketConnectEcho { .. })).await;

    h.command("s2", "roomJoin", &[json!("lobby")]).await.unwrap();
    let _ = recv_matching(&mut s1, |n| matches!(n, Notification::RoomJoinedEcho { .. })).await;

    h.service.disconnect("s2").await.unwrap();
    let left = recv_matching(&mut s1, |n| matches!(n, Notification::RoomLeftEcho { .. })).await;
    match left {
        Notification::RoomLeftEcho { room, socket, njoined } => {
            assert_eq!(room, "lobby");
            assert_eq!(socket, "s2");
            assert_eq!(njoined, 0);
        }
        other => panic!("unexpected {other:?}"),
    }
    let echo =
        recv_matching(&mut s1, |n| matches!(n, Notification::SocketDisconnectEcho { .. })).await;
    match echo {
        Notification::SocketDisconnectEcho { socket, nconnected } => {
            assert_eq!(socket, "s2");
            assert_eq!(nconnected, 1);
        }
        other => panic!("unexpected {other:?}"),
    }

    let room = h.service.backend().room("lobby").await.unwrap().unwrap();
    assert!(!room.joined.contains("alice"));
}

#[tokio::test]
async fn history_caps_and_recent_ring() {
    let mut config = common::config("n1");
    config.limits.history_max_size = 3;
    config.limits.history_max_get_messages = 2;
    let h = common::start(config).await;
    h.seed_room("lobby", None).await;
    let _rx = h.connect("s1", "alice").await;
    h.command("s1", "roomJoin", &[json!("lobby")]).await.unwrap();

    for i in 1..=5u32 {
        let text = format!("m{i}");
        h.command("s1", "roomMessage", &[json!("lobby"), json!({"textMessage": text})])
            .await
            .unwrap();
    }

    // The ring keeps the newest three; ids stay gap-free.
    let recent = h.command("s1", "roomRecentHistory", &[json!("lobby")]).await.unwrap();
    let ids: Vec<u64> = recent
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_u64().unwrap())
        .collect();
    assert_eq!(ids, vec![3, 4, 5]);

    // The get cap beats the caller's limit.
    let page = h
        .command("s1", "roomHistoryGet", &[json!("lobby"), json!(0), json!(100)])
        .await
        .unwrap();
    assert_eq!(page.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn concurrent_messages_get_distinct_gap_free_ids() {
    let h = common::start(common::config("n1")).await;
    h.seed_room("lobby", None).await;
    for i in 0..4 {
        let socket = format!("s{i}");
        let user = format!("user{i}");
        let _ = h.connect(&socket, &user).await;
        h.command(&socket, "roomJoin", &[json!("lobby")]).await.unwrap();
    }

    let mut tasks = Vec::new();
    for i in 0..4 {
        let service = h.service.clone();
        tasks.push(tokio::spawn(async move {
            let socket = format!("s{i}");
            service
                .command(&socket, "roomMessage", &[json!("lobby"), json!({"textMessage": "x"})])
                .await
        }));
    }
    let mut ids = Vec::new();
    for task in tasks {
        let reply = task.await.unwrap().unwrap();
        ids.push(reply.as_u64().unwrap());
    }
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn login_without_a_user_is_rejected_and_dropped() {
    let h = common::start(common::config("n1")).await;
    let mut rx = h.transport.register("s1", json!({}));

    let err = h.service.connect("s1", json!({})).await.unwrap_err();
    assert_eq!(err.error_code(), "hook_rejected");

    match common::recv(&mut rx).await {
        Notification::LoginRejected { reason, .. } => assert_eq!(reason.name, "noLogin"),
        other => panic!("unexpected {other:?}"),
    }
    assert!(!h.transport.is_connected("s1"));
    assert!(h.service.backend().socket("s1").await.unwrap().is_none());
}

#[tokio::test]
async fn list_own_sockets_maps_sockets_to_rooms() {
    let h = common::start(common::config("n1")).await;
    h.seed_room("lobby", None).await;
    let _s1 = h.connect("s1", "alice").await;
    let _s2 = h.connect("s2", "alice").await;
    h.command("s1", "roomJoin", &[json!("lobby")]).await.unwrap();

    let reply = h.command("s2", "listOwnSockets", &[]).await.unwrap();
    assert_eq!(reply, json!({ "s1": ["lobby"], "s2": [] }));
}

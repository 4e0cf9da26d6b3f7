//! Hook-driven pipeline behavior: teardown ordering against in-flight
//! commands, and after-hook reply overrides.

mod common;

use async_trait::async_trait;
use common::recv_matching;
use roomcast::error::{ChatError, ChatResult};
use roomcast::hooks::{AfterHook, BeforeHook, HookContext, HookOutcome, Hooks};
use roomcast_proto::{Command, Notification};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

struct SlowJoin;

#[async_trait]
impl BeforeHook for SlowJoin {
    async fn call(&self, _ctx: HookContext<'_>, _socket_id: &str, cmd: &Command) -> HookOutcome {
        if matches!(cmd, Command::RoomJoin { .. }) {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        HookOutcome::Proceed
    }
}

#[tokio::test]
async fn disconnect_waits_for_the_socket_in_flight_command() {
    let hooks = Hooks { before: Some(Arc::new(SlowJoin)), ..Default::default() };
    let h = common::start_with_hooks(common::config("n1"), hooks).await;
    h.seed_room("lobby", None).await;
    let _alice = h.connect("s1", "alice").await;

    let join = {
        let service = h.service.clone();
        tokio::spawn(async move { service.command("s1", "roomJoin", &[json!("lobby")]).await })
    };
    // The join is parked in its before-hook; teardown queues behind it on
    // the socket's ordering gate and then unwinds the committed join.
    tokio::time::sleep(Duration::from_millis(20)).await;
    h.service.disconnect("s1").await.unwrap();

    assert_eq!(join.await.unwrap().unwrap(), json!(1));
    let room = h.service.backend().room("lobby").await.unwrap().unwrap();
    assert!(!room.joined.contains("alice"));
    assert!(h.service.backend().socket("s1").await.unwrap().is_none());
}

struct VetoJoinReply;

#[async_trait]
impl AfterHook for VetoJoinReply {
    async fn call(
        &self,
        _ctx: HookContext<'_>,
        _socket_id: &str,
        cmd: &Command,
        result: &ChatResult<Value>,
    ) -> Option<ChatResult<Value>> {
        if matches!(cmd, Command::RoomJoin { .. }) && result.is_ok() {
            Some(Err(ChatError::NotAllowed("join quota exceeded".into())))
        } else {
            None
        }
    }
}

#[tokio::test]
async fn after_hook_override_changes_the_reply_not_the_outcome() {
    let hooks = Hooks { after: Some(Arc::new(VetoJoinReply)), ..Default::default() };
    let h = common::start_with_hooks(common::config("n1"), hooks).await;
    h.seed_room("lobby", None).await;
    let mut alice = h.connect("s1", "alice").await;
    let _bob = h.connect("s2", "bob").await;

    let err = h.command("s1", "roomJoin", &[json!("lobby")]).await.unwrap_err();
    assert_eq!(err.error_code(), "not_allowed");
    // The join committed; the override only rewrote the reply.
    let room = h.service.backend().room("lobby").await.unwrap().unwrap();
    assert!(room.joined.contains("alice"));

    // Its propagation happened too: alice hears about bob's (also
    // overridden) join.
    let _ = h.command("s2", "roomJoin", &[json!("lobby")]).await.unwrap_err();
    let joined =
        recv_matching(&mut alice, |n| matches!(n, Notification::RoomUserJoined { .. })).await;
    match joined {
        Notification::RoomUserJoined { room, user } => {
            assert_eq!(room, "lobby");
            assert_eq!(user, "bob");
        }
        other => panic!("unexpected {other:?}"),
    }
}

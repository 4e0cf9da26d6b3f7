//! Shared harness for the integration suites.

#![allow(dead_code)]

use roomcast::config::Config;
use roomcast::error::ChatResult;
use roomcast::hooks::Hooks;
use roomcast::service::Service;
use roomcast::state::RoomRecord;
use roomcast::transport::MemoryTransport;
use roomcast_proto::Notification;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

pub struct Harness {
    pub service: Arc<Service>,
    pub transport: Arc<MemoryTransport>,
}

/// A config with every feature toggle on, suitable for most suites.
pub fn config(instance: &str) -> Config {
    let mut config = Config::default();
    config.server.instance_id = Some(instance.to_string());
    config.features.enable_direct_messages = true;
    config.features.enable_rooms_management = true;
    config.features.enable_userlist_updates = true;
    config.features.enable_access_lists_updates = true;
    config
}

pub async fn start(config: Config) -> Harness {
    start_with_hooks(config, Hooks::default()).await
}

pub async fn start_with_hooks(config: Config, hooks: Hooks) -> Harness {
    let transport = Arc::new(MemoryTransport::new());
    let service = Service::start(config, transport.clone(), hooks)
        .await
        .expect("service start");
    Harness { service, transport }
}

impl Harness {
    /// Register a transport connection and log it in as `user`. The
    /// returned stream starts with `loginConfirmed`.
    pub async fn connect(&self, socket_id: &str, user: &str) -> UnboundedReceiver<Notification> {
        let mut rx = self.transport.register(socket_id, json!({ "user": user }));
        self.service
            .connect(socket_id, json!({ "user": user }))
            .await
            .expect("connect");
        match recv(&mut rx).await {
            Notification::LoginConfirmed { .. } => {}
            other => panic!("expected loginConfirmed, got {other:?}"),
        }
        rx
    }

    pub async fn seed_room(&self, name: &str, owner: Option<&str>) {
        let room = RoomRecord::new(name, owner.map(str::to_string), false);
        assert!(
            self.service.backend().create_room(room).await.expect("create room"),
            "room {name} already seeded"
        );
    }

    pub async fn command(&self, socket: &str, name: &str, args: &[Value]) -> ChatResult<Value> {
        self.service.command(socket, name, args).await
    }
}

/// Next notification within a second.
pub async fn recv(rx: &mut UnboundedReceiver<Notification>) -> Notification {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for a notification")
        .expect("notification stream closed")
}

/// Next notification matching `pred`, skipping unrelated traffic.
pub async fn recv_matching<F>(rx: &mut UnboundedReceiver<Notification>, mut pred: F) -> Notification
where
    F: FnMut(&Notification) -> bool,
{
    loop {
        let n = recv(rx).await;
        if pred(&n) {
            return n;
        }
    }
}

/// Assert nothing arrives within a short window.
pub async fn assert_silent(rx: &mut UnboundedReceiver<Notification>) {
    let got = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(got.is_err(), "unexpected notification: {got:?}");
}

//! Transport collaborator contract.
//!
//! The engine never parses transport framing; it drives the transport
//! through this seam and receives connects, commands, and disconnects from
//! it. A room's transport channel shares the room's name.
//!
//! [`MemoryTransport`] is the in-process implementation used by the daemon's
//! embedding examples and the integration tests; a production deployment
//! plugs a socket transport in instead.

use crate::error::{ChatError, ChatResult};
use async_trait::async_trait;
use dashmap::DashMap;
use roomcast_proto::Notification;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// What the core requires of a transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Subscribe a socket to a channel.
    async fn join_channel(&self, socket_id: &str, channel: &str) -> ChatResult<()>;

    /// Unsubscribe a socket from a channel.
    async fn leave_channel(&self, socket_id: &str, channel: &str) -> ChatResult<()>;

    /// Deliver to every socket in a channel, optionally excluding one.
    async fn send_to_channel(
        &self,
        channel: &str,
        notification: &Notification,
        exclude: Option<&str>,
    ) -> ChatResult<()>;

    /// Deliver to one socket. Delivery to a vanished socket is not an
    /// error; the command's mutation must not depend on it.
    async fn send_to_socket(&self, socket_id: &str, notification: &Notification) -> ChatResult<()>;

    /// Forcibly drop a connection.
    async fn disconnect_socket(&self, socket_id: &str) -> ChatResult<()>;

    /// Handshake data captured at connection time (auth headers, query).
    async fn handshake_data(&self, socket_id: &str) -> ChatResult<Value>;

    /// Stop accepting and drop remaining connections within `timeout`.
    async fn close(&self, timeout: Duration) -> ChatResult<()>;
}

/// Shared trait-object handle used across the engine.
pub type SharedTransport = Arc<dyn Transport>;

struct MemorySocket {
    tx: mpsc::UnboundedSender<Notification>,
    handshake: Value,
    channels: HashSet<String>,
}

/// In-process transport backed by per-socket unbounded channels.
#[derive(Default)]
pub struct MemoryTransport {
    sockets: DashMap<String, MemorySocket>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and get its notification stream.
    pub fn register(
        &self,
        socket_id: impl Into<String>,
        handshake: Value,
    ) -> mpsc::UnboundedReceiver<Notification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sockets.insert(
            socket_id.into(),
            MemorySocket { tx, handshake, channels: HashSet::new() },
        );
        rx
    }

    pub fn is_connected(&self, socket_id: &str) -> bool {
        self.sockets.contains_key(socket_id)
    }

    /// Channels a socket currently subscribes to.
    pub fn channels_of(&self, socket_id: &str) -> Vec<String> {
        self.sockets
            .get(socket_id)
            .map(|s| s.channels.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn join_channel(&self, socket_id: &str, channel: &str) -> ChatResult<()> {
        let mut socket = self
            .sockets
            .get_mut(socket_id)
            .ok_or_else(|| ChatError::no_socket(socket_id))?;
        socket.channels.insert(channel.to_string());
        Ok(())
    }

    async fn leave_channel(&self, socket_id: &str, channel: &str) -> ChatResult<()> {
        if let Some(mut socket) = self.sockets.get_mut(socket_id) {
            socket.channels.remove(channel);
        }
        Ok(())
    }

    async fn send_to_channel(
        &self,
        channel: &str,
        notification: &Notification,
        exclude: Option<&str>,
    ) -> ChatResult<()> {
        for socket in self.sockets.iter() {
            if exclude.is_some_and(|e| e == socket.key().as_str()) {
                continue;
            }
            if socket.channels.contains(channel) {
                let _ = socket.tx.send(notification.clone());
            }
        }
        Ok(())
    }

    async fn send_to_socket(&self, socket_id: &str, notification: &Notification) -> ChatResult<()> {
        if let Some(socket) = self.sockets.get(socket_id) {
            let _ = socket.tx.send(notification.clone());
        }
        Ok(())
    }

    async fn disconnect_socket(&self, socket_id: &str) -> ChatResult<()> {
        self.sockets.remove(socket_id);
        Ok(())
    }

    async fn handshake_data(&self, socket_id: &str) -> ChatResult<Value> {
        self.sockets
            .get(socket_id)
            .map(|s| s.handshake.clone())
            .ok_or_else(|| ChatError::no_socket(socket_id))
    }

    async fn close(&self, _timeout: Duration) -> ChatResult<()> {
        self.sockets.clear();
        Ok(())
    }
}

//! Cluster bus: at-least-once publish/subscribe plus request/ack between
//! instances, riding the state backend's pub/sub capability.
//!
//! Delivery is at-least-once and includes the sender, so one handler code
//! path serves local and remote effects alike. Handlers must be idempotent;
//! the bus helps by dropping envelopes it has already seen and by deduping
//! room messages on `(room, message id)`.

use crate::error::{ChatError, ChatResult};
use crate::state::SharedBackend;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use roomcast_proto::{DeliveredMessage, Notification};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Broadcast channel every instance subscribes to.
pub const BROADCAST_CHANNEL: &str = "roomcast:bus";

/// Per-instance channel for targeted requests and acks.
pub fn instance_channel(instance: &str) -> String {
    format!("roomcast:bus:{instance}")
}

/// Remember this many recently seen envelope ids / room-message ids.
const DEDUPE_WINDOW: usize = 4096;

/// Inter-instance message set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMessage {
    /// Fan a room message out to every instance's local members.
    RoomMessage { room: String, message: DeliveredMessage },
    /// Fan a notification out to a room's transport channel.
    RoomNotification {
        room: String,
        exclude_socket: Option<String>,
        notification: Notification,
    },
    /// Deliver a notification to every socket of a user, wherever they live.
    UserNotification { user: String, notification: Notification },
    /// Deliver to an exact socket set captured when the effect was built.
    /// Sockets that connect between capture and delivery are not addressed.
    SocketsNotification {
        targets: Vec<SocketTarget>,
        notification: Notification,
    },
    /// Detach a socket from a room's transport channel on its owning
    /// instance (ejection by list or mode change, or recovery cleanup).
    ChannelLeave { socket_id: String, room: String },
    /// Ask the owning instance to drop a socket.
    DisconnectSocket { socket_id: String },
}

/// One addressed socket and the instance that owns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocketTarget {
    pub socket_id: String,
    pub instance: String,
}

/// Envelope carrying an id for dedupe and an optional ack demand.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    id: String,
    origin: String,
    /// When set, the receiving instance acks to the origin's channel.
    ack: Option<String>,
    msg: BusMessage,
}

/// What an instance does with a delivered bus message.
#[async_trait]
pub trait BusHandler: Send + Sync {
    async fn handle(&self, msg: BusMessage) -> ChatResult<()>;
}

/// Ack payload sent back on the origin's instance channel.
#[derive(Debug, Serialize, Deserialize)]
struct Ack {
    request: String,
}

struct DedupeRing {
    seen: VecDeque<String>,
}

impl DedupeRing {
    fn new() -> Self {
        Self { seen: VecDeque::new() }
    }

    /// Returns true when `id` is new; remembers it.
    fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(&id.to_string()) {
            return false;
        }
        self.seen.push_back(id.to_string());
        while self.seen.len() > DEDUPE_WINDOW {
            self.seen.pop_front();
        }
        true
    }
}

pub struct ClusterBus {
    backend: SharedBackend,
    instance: String,
    ack_timeout: Duration,
    pending: DashMap<String, oneshot::Sender<()>>,
    envelopes_seen: Mutex<DedupeRing>,
    room_messages_seen: Mutex<DedupeRing>,
}

impl ClusterBus {
    pub fn new(backend: SharedBackend, instance: impl Into<String>, ack_timeout: Duration) -> Self {
        Self {
            backend,
            instance: instance.into(),
            ack_timeout,
            pending: DashMap::new(),
            envelopes_seen: Mutex::new(DedupeRing::new()),
            room_messages_seen: Mutex::new(DedupeRing::new()),
        }
    }

    /// Broadcast to all instances, the sender included.
    pub async fn publish(&self, msg: BusMessage) -> ChatResult<()> {
        let envelope = Envelope {
            id: Uuid::new_v4().to_string(),
            origin: self.instance.clone(),
            ack: None,
            msg,
        };
        self.backend
            .publish(BROADCAST_CHANNEL, encode(&envelope)?)
            .await
    }

    /// Send to one instance and wait for its ack, bounded by the configured
    /// ack timeout. A timeout is surfaced, never silently retried.
    pub async fn request(&self, target_instance: &str, msg: BusMessage) -> ChatResult<()> {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);
        let envelope = Envelope {
            id: id.clone(),
            origin: self.instance.clone(),
            ack: Some(self.instance.clone()),
            msg,
        };
        let sent = self
            .backend
            .publish(&instance_channel(target_instance), encode(&envelope)?)
            .await;
        if sent.is_err() {
            self.pending.remove(&id);
            sent?;
        }
        match tokio::time::timeout(self.ack_timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) | Err(_) => {
                self.pending.remove(&id);
                Err(ChatError::Timeout(format!("bus ack from {target_instance}")))
            }
        }
    }

    /// Subscribe both channels and spawn the delivery loops. Subscriptions
    /// are live before this returns, so nothing published afterwards is
    /// missed. Called once per instance by the service.
    pub async fn start(self: &Arc<Self>, handler: Arc<dyn BusHandler>) -> ChatResult<JoinHandle<()>> {
        let broadcast = self.backend.subscribe(BROADCAST_CHANNEL).await?;
        let direct = self
            .backend
            .subscribe(&instance_channel(&self.instance))
            .await?;
        let bus = self.clone();
        let h = handler.clone();
        let broadcast_task = tokio::spawn(async move { bus.consume(broadcast, h).await });
        let bus = self.clone();
        let direct_task = tokio::spawn(async move { bus.consume(direct, handler).await });
        Ok(tokio::spawn(async move {
            let _ = broadcast_task.await;
            let _ = direct_task.await;
        }))
    }

    async fn consume(&self, mut rx: mpsc::Receiver<Vec<u8>>, handler: Arc<dyn BusHandler>) {
        while let Some(payload) = rx.recv().await {
            let envelope: Envelope = match serde_json::from_slice(&payload) {
                Ok(e) => e,
                Err(_) => {
                    // The instance channel also carries acks.
                    if let Ok(ack) = serde_json::from_slice::<Ack>(&payload) {
                        self.complete(&ack.request);
                    } else {
                        warn!("undecodable bus payload dropped");
                    }
                    continue;
                }
            };
            if !self.envelopes_seen.lock().insert(&envelope.id) {
                debug!(id = %envelope.id, "duplicate envelope dropped");
                continue;
            }
            if let BusMessage::RoomMessage { room, message } = &envelope.msg {
                if let Some(id) = message.id {
                    let key = format!("{room}#{id}");
                    if !self.room_messages_seen.lock().insert(&key) {
                        debug!(room = %room, id, "duplicate room message dropped");
                        continue;
                    }
                }
            }
            let ack_to = envelope.ack.clone();
            let request_id = envelope.id.clone();
            if let Err(e) = handler.handle(envelope.msg).await {
                warn!(error = %e, "bus handler failed; message may be redelivered");
                continue;
            }
            if let Some(origin) = ack_to {
                let ack = Ack { request: request_id };
                if let Ok(bytes) = serde_json::to_vec(&ack) {
                    let _ = self.backend.publish(&instance_channel(&origin), bytes).await;
                }
            }
        }
    }

    fn complete(&self, request_id: &str) {
        if let Some((_, tx)) = self.pending.remove(request_id) {
            let _ = tx.send(());
        }
    }
}

fn encode(envelope: &Envelope) -> ChatResult<Vec<u8>> {
    serde_json::to_vec(envelope).map_err(|e| ChatError::Internal(format!("encode bus message: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryBackend;
    use roomcast_proto::MessagePayload;

    struct Recorder {
        log: Mutex<Vec<BusMessage>>,
    }

    #[async_trait]
    impl BusHandler for Recorder {
        async fn handle(&self, msg: BusMessage) -> ChatResult<()> {
            self.log.lock().push(msg);
            Ok(())
        }
    }

    fn room_message(id: u64) -> BusMessage {
        BusMessage::RoomMessage {
            room: "lobby".into(),
            message: DeliveredMessage {
                id: Some(id),
                author: "alice".into(),
                timestamp: 0,
                payload: MessagePayload::text("hi"),
            },
        }
    }

    #[tokio::test]
    async fn self_delivery_and_dedupe() {
        let backend: SharedBackend = Arc::new(MemoryBackend::new());
        let bus = Arc::new(ClusterBus::new(backend.clone(), "n1", Duration::from_millis(200)));
        let recorder = Arc::new(Recorder { log: Mutex::new(Vec::new()) });
        bus.start(recorder.clone()).await.unwrap();

        bus.publish(room_message(1)).await.unwrap();
        // Simulate at-least-once redelivery: same room + id, fresh envelope.
        bus.publish(room_message(1)).await.unwrap();
        bus.publish(room_message(2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let log = recorder.log.lock();
        let ids: Vec<u64> = log
            .iter()
            .filter_map(|m| match m {
                BusMessage::RoomMessage { message, .. } => message.id,
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn request_ack_round_trip_and_timeout() {
        let backend: SharedBackend = Arc::new(MemoryBackend::new());
        let n1 = Arc::new(ClusterBus::new(backend.clone(), "n1", Duration::from_millis(100)));
        let n2 = Arc::new(ClusterBus::new(backend.clone(), "n2", Duration::from_millis(100)));
        let sink = Arc::new(Recorder { log: Mutex::new(Vec::new()) });
        n1.start(sink.clone()).await.unwrap();
        n2.start(sink.clone()).await.unwrap();

        n1.request("n2", BusMessage::DisconnectSocket { socket_id: "s9".into() })
            .await
            .unwrap();

        let err = n1
            .request("ghost", BusMessage::DisconnectSocket { socket_id: "s9".into() })
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "timeout");
    }
}

//! Service lifecycle: wiring, socket connect/disconnect, bus delivery,
//! and shutdown.

use crate::bus::{BusHandler, BusMessage, ClusterBus};
use crate::commands::{CommandPipeline, Core};
use crate::config::{Config, StateKind};
use crate::error::{ChatError, ChatResult};
use crate::hooks::Hooks;
use crate::lock::{self, LockManager};
use crate::recovery::RecoveryManager;
use crate::saga::{self, undo};
use crate::state::kv::{KvStore, MemoryKv};
use crate::state::{MemoryBackend, SharedBackend, SocketRecord, StoreBackend};
use crate::transport::SharedTransport;
use async_trait::async_trait;
use roomcast_proto::Notification;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One running instance of the messaging service.
pub struct Service {
    core: Arc<Core>,
    pipeline: Arc<CommandPipeline>,
    shutdown: Arc<Notify>,
    bus_task: JoinHandle<()>,
    recovery_task: JoinHandle<()>,
}

impl Service {
    /// Start with the backend the config names. `state = "store"` runs
    /// against an in-process store; use [`Service::start_with_kv`] to share
    /// one store between instances.
    pub async fn start(
        config: Config,
        transport: SharedTransport,
        hooks: Hooks,
    ) -> ChatResult<Arc<Self>> {
        let backend: SharedBackend = match config.server.state {
            StateKind::Memory => Arc::new(MemoryBackend::new()),
            StateKind::Store => Arc::new(StoreBackend::new(Arc::new(MemoryKv::new()))),
        };
        Self::start_with_backend(config, transport, hooks, backend).await
    }

    /// Start against a caller-supplied shared KV store. Every instance
    /// handed the same store sees the same rooms, users, and locks.
    pub async fn start_with_kv(
        config: Config,
        transport: SharedTransport,
        hooks: Hooks,
        kv: Arc<dyn KvStore>,
    ) -> ChatResult<Arc<Self>> {
        Self::start_with_backend(config, transport, hooks, Arc::new(StoreBackend::new(kv))).await
    }

    async fn start_with_backend(
        config: Config,
        transport: SharedTransport,
        hooks: Hooks,
        backend: SharedBackend,
    ) -> ChatResult<Arc<Self>> {
        config
            .validate()
            .map_err(|e| ChatError::InvalidArguments(e.to_string()))?;

        let instance = config
            .server
            .instance_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let config = Arc::new(config);
        let locks = Arc::new(LockManager::new(
            backend.clone(),
            instance.clone(),
            config.timing.lock_ttl(),
        ));
        let bus = Arc::new(ClusterBus::new(
            backend.clone(),
            instance.clone(),
            config.timing.bus_ack_timeout(),
        ));
        let core = Arc::new(Core {
            instance: instance.clone(),
            config: config.clone(),
            backend: backend.clone(),
            transport,
            locks: locks.clone(),
            bus: bus.clone(),
            hooks,
        });

        core.hooks
            .run_lifecycle(
                &core.hooks.on_start,
                core.hook_ctx(),
                config.timing.hook_timeout(),
                "startup hook",
            )
            .await?;

        let deliverer = Arc::new(Deliverer { core: core.clone() });
        let bus_task = bus.start(deliverer).await?;

        let shutdown = Arc::new(Notify::new());
        let recovery = Arc::new(RecoveryManager::new(
            backend,
            locks,
            bus,
            config,
            instance.clone(),
        ));
        let recovery_task = tokio::spawn(recovery.run(shutdown.clone()));

        let pipeline = Arc::new(CommandPipeline::new(core.clone()));
        info!(instance = %instance, "service started");
        Ok(Arc::new(Self {
            core,
            pipeline,
            shutdown,
            bus_task,
            recovery_task,
        }))
    }

    pub fn instance(&self) -> &str {
        &self.core.instance
    }

    pub fn backend(&self) -> &SharedBackend {
        &self.core.backend
    }

    /// Register a connecting socket. The connect hook (or the handshake's
    /// `user` field) decides the identity; rejection sends `loginRejected`
    /// and drops the socket.
    pub async fn connect(&self, socket_id: &str, handshake: Value) -> ChatResult<String> {
        let core = &self.core;
        let hook_timeout = core.config.timing.hook_timeout();
        let login = core
            .hooks
            .run_connect(core.hook_ctx(), hook_timeout, socket_id, handshake)
            .await;
        let (user, auth_data) = match login {
            Ok(ok) => ok,
            Err(error) => {
                let reject = Notification::LoginRejected {
                    reason: error.to_wire(),
                    raw: core.config.server.use_raw_error_objects,
                };
                let _ = core.transport.send_to_socket(socket_id, &reject).await;
                let _ = core.transport.disconnect_socket(socket_id).await;
                return Err(error);
            }
        };

        let nconnected = saga::run("connect", async |saga| {
            let record = SocketRecord::new(socket_id, user.clone(), core.instance.clone());
            let nconnected = core.backend.add_socket(record).await?;
            saga.push(
                "add_socket",
                undo::remove_socket(core.backend.clone(), socket_id.to_string()),
            );

            core.transport
                .send_to_socket(
                    socket_id,
                    &Notification::LoginConfirmed { user: user.clone(), auth_data },
                )
                .await?;
            Ok(nconnected)
        })
        .await?;

        let echo = core
            .sockets_notification(
                &user,
                Some(socket_id),
                Notification::SocketConnectEcho {
                    socket: socket_id.to_string(),
                    nconnected,
                },
            )
            .await?;
        core.bus.publish(echo).await?;
        debug!(socket = socket_id, user = %user, "socket connected");
        Ok(user)
    }

    /// Run one command for a connected socket.
    pub async fn command(
        &self,
        socket_id: &str,
        name: &str,
        args: &[Value],
    ) -> ChatResult<Value> {
        self.pipeline.dispatch(socket_id, name, args).await
    }

    /// Encode an error for the wire, honoring `use_raw_error_objects`.
    pub fn encode_error(&self, error: &ChatError) -> Value {
        error.to_wire().encode(self.core.config.server.use_raw_error_objects)
    }

    /// Tear down a departed socket: leave its rooms with the usual echoes,
    /// drop its record, and tell the user's other sockets.
    pub async fn disconnect(&self, socket_id: &str) -> ChatResult<()> {
        let core = &self.core;
        // Teardown takes the socket's ordering gate, so it cannot interleave
        // with a command this socket still has in flight.
        let gate = self.pipeline.socket_gate(socket_id);
        let _order = gate.lock().await;
        let Some(socket) = core.backend.socket(socket_id).await? else {
            return Ok(());
        };

        for room in socket.rooms.iter() {
            let lock = core
                .locks
                .acquire_with_retry(&lock::room_key(room), 3, std::time::Duration::from_millis(50))
                .await?;
            let left = core.backend.leave_room(room, &socket.user, socket_id).await;
            if let Err(error) = core.locks.release(&lock).await {
                warn!(room = %room, %error, "lock release failed");
            }
            let njoined = left?;
            core.transport.leave_channel(socket_id, room).await?;

            let echo = core
                .sockets_notification(
                    &socket.user,
                    Some(socket_id),
                    Notification::RoomLeftEcho {
                        room: room.clone(),
                        socket: socket_id.to_string(),
                        njoined,
                    },
                )
                .await?;
            core.bus.publish(echo).await?;
            if njoined == 0 && core.config.features.enable_userlist_updates {
                core.bus
                    .publish(BusMessage::RoomNotification {
                        room: room.clone(),
                        exclude_socket: None,
                        notification: Notification::RoomUserLeft {
                            room: room.clone(),
                            user: socket.user.clone(),
                        },
                    })
                    .await?;
            }
        }

        if let Some((_, nconnected)) = core.backend.remove_socket(socket_id).await? {
            let echo = core
                .sockets_notification(
                    &socket.user,
                    Some(socket_id),
                    Notification::SocketDisconnectEcho {
                        socket: socket_id.to_string(),
                        nconnected,
                    },
                )
                .await?;
            core.bus.publish(echo).await?;
        }
        self.pipeline.forget_socket(socket_id);
        core.hooks
            .run_disconnect(
                core.hook_ctx(),
                core.config.timing.hook_timeout(),
                socket_id,
                &socket.user,
            )
            .await;
        debug!(socket = socket_id, user = %socket.user, "socket disconnected");
        Ok(())
    }

    /// Server-side kick: sever every socket of a user, wherever it lives.
    /// A local socket is dropped through the transport directly; a remote
    /// one is requested from its owning instance over the bus, and the ack
    /// is awaited. Record teardown then follows from the transport's close
    /// notification, as with any client-initiated disconnect.
    pub async fn disconnect_user_sockets(&self, user: &str) -> ChatResult<()> {
        let core = &self.core;
        for socket in core.backend.user_sockets(user).await? {
            if socket.instance == core.instance {
                core.transport.disconnect_socket(&socket.id).await?;
            } else {
                core.bus
                    .request(
                        &socket.instance,
                        BusMessage::DisconnectSocket { socket_id: socket.id.clone() },
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Graceful shutdown: stop the loops, give back this instance's locks
    /// and heartbeat, and close the transport within `close_timeout`.
    pub async fn close(&self) -> ChatResult<()> {
        self.core
            .hooks
            .run_lifecycle(
                &self.core.hooks.on_close,
                self.core.hook_ctx(),
                self.core.config.timing.hook_timeout(),
                "shutdown hook",
            )
            .await?;

        self.shutdown.notify_waiters();
        self.bus_task.abort();
        self.recovery_task.abort();

        self.core
            .backend
            .release_instance_locks(&self.core.instance)
            .await?;
        self.core.backend.remove_heartbeat(&self.core.instance).await?;
        self.core
            .transport
            .close(self.core.config.timing.close_timeout())
            .await?;
        info!(instance = %self.core.instance, "service closed");
        Ok(())
    }
}

/// Applies bus messages against this instance's transport. Each instance
/// acts only on its own sockets; channel sends address local members.
struct Deliverer {
    core: Arc<Core>,
}

impl Deliverer {
    async fn local_sockets(&self, user: &str) -> ChatResult<Vec<SocketRecord>> {
        Ok(self
            .core
            .backend
            .user_sockets(user)
            .await?
            .into_iter()
            .filter(|s| s.instance == self.core.instance)
            .collect())
    }
}

#[async_trait]
impl BusHandler for Deliverer {
    async fn handle(&self, msg: BusMessage) -> ChatResult<()> {
        let transport = &self.core.transport;
        match msg {
            BusMessage::RoomMessage { room, message } => {
                let notification = Notification::RoomMessage { room: room.clone(), message };
                transport.send_to_channel(&room, &notification, None).await
            }
            BusMessage::RoomNotification { room, exclude_socket, notification } => {
                transport
                    .send_to_channel(&room, &notification, exclude_socket.as_deref())
                    .await
            }
            BusMessage::UserNotification { user, notification } => {
                for socket in self.local_sockets(&user).await? {
                    transport.send_to_socket(&socket.id, &notification).await?;
                }
                Ok(())
            }
            BusMessage::SocketsNotification { targets, notification } => {
                for target in targets {
                    if target.instance == self.core.instance {
                        transport.send_to_socket(&target.socket_id, &notification).await?;
                    }
                }
                Ok(())
            }
            BusMessage::ChannelLeave { socket_id, room } => {
                let local = self
                    .core
                    .backend
                    .socket(&socket_id)
                    .await?
                    .is_some_and(|s| s.instance == self.core.instance);
                if local {
                    transport.leave_channel(&socket_id, &room).await?;
                }
                Ok(())
            }
            BusMessage::DisconnectSocket { socket_id } => {
                let local = self
                    .core
                    .backend
                    .socket(&socket_id)
                    .await?
                    .is_some_and(|s| s.instance == self.core.instance);
                if local {
                    transport.disconnect_socket(&socket_id).await?;
                }
                Ok(())
            }
        }
    }
}

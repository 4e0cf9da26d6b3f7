//! Command pipeline.
//!
//! Every client command passes through the same ordered stages: shape
//! validation, the before-hook, authorization, execution under a saga,
//! the after-hook, and finally cluster propagation. Commands from one
//! socket are strictly serialized; commands from different sockets run
//! concurrently.

mod common;
mod direct;
mod room_history;
mod room_join;
mod room_leave;
mod room_lists;
mod room_manage;
mod room_message;
mod sockets;

use crate::bus::{BusMessage, ClusterBus, SocketTarget};
use crate::config::Config;
use crate::error::{ChatError, ChatResult};
use crate::hooks::{HookContext, HookOutcome, Hooks};
use crate::lock::LockManager;
use crate::state::SharedBackend;
use crate::transport::SharedTransport;
use dashmap::DashMap;
use roomcast_proto::{valid_name, Command, Notification};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

/// Everything a command handler may touch. One per service instance,
/// shared with the bus deliverer and the recovery manager.
pub struct Core {
    pub instance: String,
    pub config: Arc<Config>,
    pub backend: SharedBackend,
    pub transport: SharedTransport,
    pub locks: Arc<LockManager>,
    pub bus: Arc<ClusterBus>,
    pub hooks: Hooks,
}

impl Core {
    pub fn hook_ctx(&self) -> HookContext<'_> {
        HookContext {
            instance: &self.instance,
            config: &self.config,
            backend: &self.backend,
        }
    }

    /// Build an echo for the user's other sockets. The socket set is
    /// captured here, so a socket connecting before the bus delivers never
    /// receives an echo addressed to a set it was not part of.
    pub async fn sockets_notification(
        &self,
        user: &str,
        exclude_socket: Option<&str>,
        notification: Notification,
    ) -> ChatResult<BusMessage> {
        let targets = self
            .backend
            .user_sockets(user)
            .await?
            .into_iter()
            .filter(|s| exclude_socket != Some(s.id.as_str()))
            .map(|s| SocketTarget { socket_id: s.id, instance: s.instance })
            .collect();
        Ok(BusMessage::SocketsNotification { targets, notification })
    }
}

/// Identity of the socket issuing a command, resolved before execution.
pub struct CommandContext {
    pub socket_id: String,
    pub user: String,
}

/// What a successful execution produced: the reply for the issuing socket
/// and the bus messages to propagate once the command is final.
pub struct CommandOutput {
    pub reply: Value,
    pub effects: Vec<BusMessage>,
}

impl CommandOutput {
    pub fn new(reply: Value) -> Self {
        Self { reply, effects: Vec::new() }
    }

    pub fn with_effects(reply: Value, effects: Vec<BusMessage>) -> Self {
        Self { reply, effects }
    }
}

pub struct CommandPipeline {
    core: Arc<Core>,
    /// Per-socket ordering gates. A socket's next command starts only
    /// after its previous one has fully settled.
    socket_order: DashMap<String, Arc<Mutex<()>>>,
}

impl CommandPipeline {
    pub fn new(core: Arc<Core>) -> Self {
        Self { core, socket_order: DashMap::new() }
    }

    pub fn core(&self) -> &Arc<Core> {
        &self.core
    }

    /// Run one command through the full pipeline and return the reply
    /// for the issuing socket.
    #[instrument(level = "debug", skip(self, args), fields(instance = %self.core.instance))]
    pub async fn dispatch(
        &self,
        socket_id: &str,
        name: &str,
        args: &[Value],
    ) -> ChatResult<Value> {
        let cmd = Command::parse(name, args)?;
        validate_names(&cmd)?;

        let gate = self.socket_gate(socket_id);
        let _order = gate.lock().await;

        let socket = self
            .core
            .backend
            .socket(socket_id)
            .await?
            .ok_or_else(|| ChatError::no_socket(socket_id))?;
        let ctx = CommandContext {
            socket_id: socket_id.to_string(),
            user: socket.user,
        };

        let hook_timeout = self.core.config.timing.hook_timeout();
        match self
            .core
            .hooks
            .run_before(self.core.hook_ctx(), hook_timeout, socket_id, &cmd)
            .await?
        {
            HookOutcome::Proceed => {}
            HookOutcome::Replace(reply) => {
                debug!(command = name, "before hook replaced the command");
                return Ok(reply);
            }
            HookOutcome::Reject(reason) => return Err(ChatError::HookRejected(reason)),
        }

        let executed = self.execute(&ctx, &cmd).await;
        let (result, effects) = match executed {
            Ok(output) => (Ok(output.reply), output.effects),
            Err(e) => (Err(e), Vec::new()),
        };

        let reply = self
            .core
            .hooks
            .run_after(self.core.hook_ctx(), hook_timeout, socket_id, &cmd, result)
            .await;

        // Effects exist only when the mutation committed, so they propagate
        // even if the after-hook overrides the reply with an error. The
        // override changes what the issuing socket hears, not what happened.
        for effect in effects {
            if let Err(error) = self.core.bus.publish(effect).await {
                warn!(command = name, %error, "effect propagation failed");
            }
        }
        reply
    }

    /// The socket's ordering gate. Teardown takes it too, so a disconnect
    /// cannot interleave with a command the socket still has in flight.
    pub fn socket_gate(&self, socket_id: &str) -> Arc<Mutex<()>> {
        self.socket_order
            .entry(socket_id.to_string())
            .or_default()
            .clone()
    }

    /// Drop the ordering gate of a disconnected socket.
    pub fn forget_socket(&self, socket_id: &str) {
        self.socket_order.remove(socket_id);
    }

    async fn execute(&self, ctx: &CommandContext, cmd: &Command) -> ChatResult<CommandOutput> {
        let core = &self.core;
        match cmd {
            Command::RoomJoin { room } => room_join::run(core, ctx, room).await,
            Command::RoomLeave { room } => room_leave::run(core, ctx, room).await,
            Command::RoomMessage { room, message } => {
                room_message::run(core, ctx, room, message.clone()).await
            }
            Command::RoomHistoryGet { room, after_id, limit } => {
                room_history::get(core, ctx, room, *after_id, *limit).await
            }
            Command::RoomRecentHistory { room } => room_history::recent(core, ctx, room).await,
            Command::RoomCreate { room, whitelist_only } => {
                room_manage::create(core, ctx, room, *whitelist_only).await
            }
            Command::RoomDelete { room } => room_manage::delete(core, ctx, room).await,
            Command::RoomAddToList { room, list, users } => {
                room_lists::add(core, ctx, room, *list, users).await
            }
            Command::RoomRemoveFromList { room, list, users } => {
                room_lists::remove(core, ctx, room, *list, users).await
            }
            Command::RoomGetAccessList { room, list } => {
                room_lists::get(core, ctx, room, *list).await
            }
            Command::RoomSetWhitelistMode { room, mode } => {
                room_lists::set_mode(core, ctx, room, *mode).await
            }
            Command::DirectMessage { to, message } => {
                direct::message(core, ctx, to, message.clone()).await
            }
            Command::DirectAddToList { list, users } => {
                direct::add(core, ctx, *list, users).await
            }
            Command::DirectRemoveFromList { list, users } => {
                direct::remove(core, ctx, *list, users).await
            }
            Command::DirectGetAccessList { list } => direct::get(core, ctx, *list).await,
            Command::DirectSetWhitelistMode { mode } => {
                direct::set_mode(core, ctx, *mode).await
            }
            Command::ListOwnSockets => sockets::list_own(core, ctx).await,
            Command::SelfBroadcast { message } => {
                sockets::self_broadcast(core, ctx, message.clone()).await
            }
        }
    }
}

/// Reject malformed room and user names before any state is touched.
fn validate_names(cmd: &Command) -> ChatResult<()> {
    let mut names: Vec<&str> = Vec::new();
    match cmd {
        Command::RoomJoin { room }
        | Command::RoomLeave { room }
        | Command::RoomMessage { room, .. }
        | Command::RoomHistoryGet { room, .. }
        | Command::RoomRecentHistory { room }
        | Command::RoomCreate { room, .. }
        | Command::RoomDelete { room }
        | Command::RoomGetAccessList { room, .. }
        | Command::RoomSetWhitelistMode { room, .. } => names.push(room),
        Command::RoomAddToList { room, users, .. }
        | Command::RoomRemoveFromList { room, users, .. } => {
            names.push(room);
            names.extend(users.iter().map(String::as_str));
        }
        Command::DirectMessage { to, .. } => names.push(to),
        Command::DirectAddToList { users, .. } | Command::DirectRemoveFromList { users, .. } => {
            names.extend(users.iter().map(String::as_str));
        }
        Command::DirectGetAccessList { .. }
        | Command::DirectSetWhitelistMode { .. }
        | Command::ListOwnSockets
        | Command::SelfBroadcast { .. } => {}
    }
    for name in names {
        if !valid_name(name) {
            return Err(ChatError::InvalidArguments(format!("bad name {name:?}")));
        }
    }
    Ok(())
}

use super::{CommandContext, CommandOutput, Core};
use crate::error::ChatResult;
use crate::state::now_ms;
use roomcast_proto::{DeliveredMessage, MessagePayload, Notification};
use serde_json::{json, Map, Value};

/// Map of the user's sockets to the rooms each has joined.
pub(super) async fn list_own(core: &Core, ctx: &CommandContext) -> ChatResult<CommandOutput> {
    let mut reply = Map::new();
    for socket in core.backend.user_sockets(&ctx.user).await? {
        let mut rooms: Vec<&String> = socket.rooms.iter().collect();
        rooms.sort();
        reply.insert(socket.id.clone(), json!(rooms));
    }
    Ok(CommandOutput::new(Value::Object(reply)))
}

/// Broadcast to the user's *other* sockets. Used to synchronize state
/// across a user's own devices; nothing is persisted.
pub(super) async fn self_broadcast(
    core: &Core,
    ctx: &CommandContext,
    payload: MessagePayload,
) -> ChatResult<CommandOutput> {
    core.hooks
        .run_message_checker(core.hook_ctx(), core.config.timing.hook_timeout(), &payload)
        .await?;

    let message = DeliveredMessage {
        id: None,
        author: ctx.user.clone(),
        timestamp: now_ms(),
        payload,
    };
    let echo = core
        .sockets_notification(
            &ctx.user,
            Some(&ctx.socket_id),
            Notification::SelfBroadcast { message },
        )
        .await?;
    Ok(CommandOutput::with_effects(Value::Null, vec![echo]))
}

use super::{common, CommandContext, CommandOutput, Core};
use crate::bus::BusMessage;
use crate::error::ChatResult;
use crate::state::now_ms;
use roomcast_proto::{DeliveredMessage, MessagePayload, Notification};
use serde_json::json;

/// Append a message to a room's history and fan it out. The reply is the
/// assigned message id; ids are gap-free per room.
pub(super) async fn run(
    core: &Core,
    ctx: &CommandContext,
    room_name: &str,
    payload: MessagePayload,
) -> ChatResult<CommandOutput> {
    let room = common::room_or_not_found(core, room_name).await?;
    common::require_member(&room, &ctx.user)?;
    core.hooks
        .run_message_checker(core.hook_ctx(), core.config.timing.hook_timeout(), &payload)
        .await?;

    // Ids are assigned under the room lock so concurrent writers across
    // instances serialize instead of racing the counter.
    let lock = common::lock_room(core, room_name).await?;
    let timestamp = now_ms();
    let appended = core
        .backend
        .append_history(
            room_name,
            &ctx.user,
            timestamp,
            payload.clone(),
            core.config.limits.history_max_size,
        )
        .await;
    common::unlock(core, lock).await;
    let id = appended?;

    let message = DeliveredMessage {
        id: Some(id),
        author: ctx.user.clone(),
        timestamp,
        payload,
    };
    let effects = vec![BusMessage::RoomMessage {
        room: room_name.to_string(),
        message,
    }];
    Ok(CommandOutput::with_effects(json!(id), effects))
}

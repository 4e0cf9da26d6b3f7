use super::{common, CommandContext, CommandOutput, Core};
use crate::bus::BusMessage;
use crate::error::{ChatError, ChatResult};
use crate::saga::{self, undo};
use roomcast_proto::Notification;
use serde_json::json;

/// Detach the issuing socket from a room. The reply carries how many of
/// the user's sockets remain in the room.
pub(super) async fn run(
    core: &Core,
    ctx: &CommandContext,
    room_name: &str,
) -> ChatResult<CommandOutput> {
    common::room_or_not_found(core, room_name).await?;
    let socket = core
        .backend
        .socket(&ctx.socket_id)
        .await?
        .ok_or_else(|| ChatError::no_socket(&ctx.socket_id))?;
    if !socket.rooms.contains(room_name) {
        return Err(ChatError::NotAllowed(format!(
            "socket has not joined {room_name}"
        )));
    }

    let lock = common::lock_room(core, room_name).await?;
    let result = saga::run("roomLeave", async |saga| {
        let njoined = core
            .backend
            .leave_room(room_name, &ctx.user, &ctx.socket_id)
            .await?;
        saga.push(
            "leave_room",
            undo::rejoin_room(
                core.backend.clone(),
                room_name.to_string(),
                ctx.user.clone(),
                ctx.socket_id.clone(),
            ),
        );

        core.transport.leave_channel(&ctx.socket_id, room_name).await?;
        saga.push(
            "leave_channel",
            undo::rejoin_channel(
                core.transport.clone(),
                ctx.socket_id.clone(),
                room_name.to_string(),
            ),
        );

        common::require_still_held(core, &lock).await?;
        Ok(njoined)
    })
    .await;
    common::unlock(core, lock).await;
    let njoined = result?;

    let echo = core
        .sockets_notification(
            &ctx.user,
            Some(&ctx.socket_id),
            Notification::RoomLeftEcho {
                room: room_name.to_string(),
                socket: ctx.socket_id.clone(),
                njoined,
            },
        )
        .await?;
    let mut effects = vec![echo];
    if njoined == 0 && core.config.features.enable_userlist_updates {
        effects.push(BusMessage::RoomNotification {
            room: room_name.to_string(),
            exclude_socket: Some(ctx.socket_id.clone()),
            notification: Notification::RoomUserLeft {
                room: room_name.to_string(),
                user: ctx.user.clone(),
            },
        });
    }
    Ok(CommandOutput::with_effects(json!(njoined), effects))
}

use super::{common, CommandContext, CommandOutput, Core};
use crate::bus::BusMessage;
use crate::error::ChatResult;
use crate::saga::{self, undo};
use roomcast_proto::Notification;
use serde_json::json;

/// Join the issuing socket to a room. On success the reply carries the
/// number of the user's sockets now in the room.
pub(super) async fn run(
    core: &Core,
    ctx: &CommandContext,
    room_name: &str,
) -> ChatResult<CommandOutput> {
    common::room_or_not_found(core, room_name).await?;

    let lock = common::lock_room(core, room_name).await?;
    let result = saga::run("roomJoin", async |saga| {
        // Admission rides on the state as it is under the lock, so a
        // blacklist add racing this join cannot be outrun.
        let room = common::room_or_not_found(core, room_name).await?;
        if !room.may_join(&ctx.user) {
            return Err(crate::error::ChatError::NotAllowed(format!(
                "{} may not join {room_name}",
                ctx.user
            )));
        }
        let njoined = core
            .backend
            .join_room(room_name, &ctx.user, &ctx.socket_id)
            .await?;
        saga.push(
            "join_room",
            undo::leave_room(
                core.backend.clone(),
                room_name.to_string(),
                ctx.user.clone(),
                ctx.socket_id.clone(),
            ),
        );

        core.transport.join_channel(&ctx.socket_id, room_name).await?;
        saga.push(
            "join_channel",
            undo::leave_channel(
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
            Notification::RoomJoinedEcho {
                room: room_name.to_string(),
                socket: ctx.socket_id.clone(),
                njoined,
            },
        )
        .await?;
    let mut effects = vec![echo];
    // Only the user's first socket in the room announces them.
    if njoined == 1 && core.config.features.enable_userlist_updates {
        effects.push(BusMessage::RoomNotification {
            room: room_name.to_string(),
            exclude_socket: Some(ctx.socket_id.clone()),
            notification: Notification::RoomUserJoined {
                room: room_name.to_string(),
                user: ctx.user.clone(),
            },
        });
    }
    Ok(CommandOutput::with_effects(json!(njoined), effects))
}

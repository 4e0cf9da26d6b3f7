use super::{common, CommandContext, CommandOutput, Core};
use crate::error::{ChatError, ChatResult};
use crate::saga::{self, undo};
use crate::state::RoomRecord;
use serde_json::{json, Value};

/// Create a room owned by the issuing user. The owner is seeded into the
/// adminlist.
pub(super) async fn create(
    core: &Core,
    ctx: &CommandContext,
    room_name: &str,
    whitelist_only: bool,
) -> ChatResult<CommandOutput> {
    common::require_feature(
        core.config.features.enable_rooms_management,
        "rooms management",
    )?;

    let room = RoomRecord::new(room_name, Some(ctx.user.clone()), whitelist_only);
    if !core.backend.create_room(room).await? {
        return Err(ChatError::NotAllowed(format!(
            "room {room_name} already exists"
        )));
    }
    Ok(CommandOutput::new(Value::Null))
}

/// Delete a room: every joined user is ejected first, then the record goes.
pub(super) async fn delete(
    core: &Core,
    ctx: &CommandContext,
    room_name: &str,
) -> ChatResult<CommandOutput> {
    common::require_feature(
        core.config.features.enable_rooms_management,
        "rooms management",
    )?;
    let room = common::room_or_not_found(core, room_name).await?;
    common::require_admin(&room, &ctx.user)?;

    let lock = common::lock_room(core, room_name).await?;
    let mut effects = Vec::new();
    let result = saga::run("roomDelete", async |saga| {
        let joined: Vec<String> = room.joined.iter().cloned().collect();
        for user in joined {
            common::eject_user(core, saga, room_name, &user, &mut effects).await?;
        }

        // Capture the post-ejection record so rollback restores exactly
        // what was removed.
        let snapshot = core
            .backend
            .room(room_name)
            .await?
            .ok_or_else(|| ChatError::no_room(room_name))?;
        core.backend.remove_room(room_name).await?;
        saga.push(
            "remove_room",
            undo::restore_room(core.backend.clone(), snapshot),
        );

        common::require_still_held(core, &lock).await?;
        Ok(())
    })
    .await;
    common::unlock(core, lock).await;
    result?;

    Ok(CommandOutput::with_effects(json!(null), effects))
}

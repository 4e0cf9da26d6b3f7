use super::{common, CommandContext, CommandOutput, Core};
use crate::bus::BusMessage;
use crate::error::{ChatError, ChatResult};
use crate::saga::{self, undo};
use roomcast_proto::{ListName, Notification};
use serde_json::{json, Value};

/// Add users to a room access list. Adding to the blacklist ejects any of
/// them currently joined.
pub(super) async fn add(
    core: &Core,
    ctx: &CommandContext,
    room_name: &str,
    list: ListName,
    users: &[String],
) -> ChatResult<CommandOutput> {
    require_mutable(list)?;
    let room = common::room_or_not_found(core, room_name).await?;
    common::require_admin(&room, &ctx.user)?;

    let lock = common::lock_room(core, room_name).await?;
    let mut effects = Vec::new();
    let result = saga::run("roomAddToList", async |saga| {
        for user in users {
            let added = core
                .backend
                .add_list_member(room_name, list, user, core.config.limits.room_list_size_limit)
                .await?;
            if added {
                saga.push(
                    "add_list_member",
                    undo::remove_list_member(
                        core.backend.clone(),
                        room_name.to_string(),
                        list,
                        user.clone(),
                    ),
                );
            }
            if list == ListName::Blacklist {
                common::eject_user(core, saga, room_name, user, &mut effects).await?;
            }
        }
        common::require_still_held(core, &lock).await?;
        Ok(())
    })
    .await;
    common::unlock(core, lock).await;
    result?;

    if core.config.features.enable_access_lists_updates {
        effects.push(BusMessage::RoomNotification {
            room: room_name.to_string(),
            exclude_socket: None,
            notification: Notification::RoomAccessListAdded {
                room: room_name.to_string(),
                list,
                users: users.to_vec(),
            },
        });
    }
    Ok(CommandOutput::with_effects(Value::Null, effects))
}

/// Remove users from a room access list. Removing from the whitelist of a
/// whitelist-only room ejects them unless they are admins.
pub(super) async fn remove(
    core: &Core,
    ctx: &CommandContext,
    room_name: &str,
    list: ListName,
    users: &[String],
) -> ChatResult<CommandOutput> {
    require_mutable(list)?;
    let room = common::room_or_not_found(core, room_name).await?;
    common::require_admin(&room, &ctx.user)?;

    let lock = common::lock_room(core, room_name).await?;
    let mut effects = Vec::new();
    let result = saga::run("roomRemoveFromList", async |saga| {
        // Eviction decisions ride on the state as it is under the lock,
        // not the pre-lock snapshot.
        let room = common::room_or_not_found(core, room_name).await?;
        for user in users {
            let removed = core.backend.remove_list_member(room_name, list, user).await?;
            if removed {
                saga.push(
                    "remove_list_member",
                    undo::add_list_member(
                        core.backend.clone(),
                        room_name.to_string(),
                        list,
                        user.clone(),
                    ),
                );
            }
            if list == ListName::Whitelist && room.whitelist_only && !room.is_admin(user) {
                common::eject_user(core, saga, room_name, user, &mut effects).await?;
            }
        }
        common::require_still_held(core, &lock).await?;
        Ok(())
    })
    .await;
    common::unlock(core, lock).await;
    result?;

    if core.config.features.enable_access_lists_updates {
        effects.push(BusMessage::RoomNotification {
            room: room_name.to_string(),
            exclude_socket: None,
            notification: Notification::RoomAccessListRemoved {
                room: room_name.to_string(),
                list,
                users: users.to_vec(),
            },
        });
    }
    Ok(CommandOutput::with_effects(Value::Null, effects))
}

/// Read an access list. The userlist is visible to joined members and to
/// admins; the permission lists require admin.
pub(super) async fn get(
    core: &Core,
    ctx: &CommandContext,
    room_name: &str,
    list: ListName,
) -> ChatResult<CommandOutput> {
    let room = common::room_or_not_found(core, room_name).await?;
    if list == ListName::Userlist {
        if !room.is_admin(&ctx.user) {
            common::require_member(&room, &ctx.user)?;
        }
    } else {
        common::require_admin(&room, &ctx.user)?;
    }

    let members: Vec<&String> = room.list(list).iter().collect();
    Ok(CommandOutput::new(json!(members)))
}

/// Flip whitelist-only mode. Enabling it ejects joined users who are
/// neither whitelisted nor admins.
pub(super) async fn set_mode(
    core: &Core,
    ctx: &CommandContext,
    room_name: &str,
    mode: bool,
) -> ChatResult<CommandOutput> {
    let room = common::room_or_not_found(core, room_name).await?;
    common::require_admin(&room, &ctx.user)?;

    let lock = common::lock_room(core, room_name).await?;
    let mut effects = Vec::new();
    let result = saga::run("roomSetWhitelistMode", async |saga| {
        // Eviction decisions ride on the state as it is under the lock,
        // not the pre-lock snapshot.
        let room = common::room_or_not_found(core, room_name).await?;
        let previous = room.whitelist_only;
        core.backend.set_whitelist_mode(room_name, mode).await?;
        saga.push(
            "set_whitelist_mode",
            undo::set_room_mode(core.backend.clone(), room_name.to_string(), previous),
        );

        if mode {
            let evicted: Vec<String> = room
                .joined
                .iter()
                .filter(|u| !room.whitelist.contains(*u) && !room.is_admin(u))
                .cloned()
                .collect();
            for user in evicted {
                common::eject_user(core, saga, room_name, &user, &mut effects).await?;
            }
        }
        common::require_still_held(core, &lock).await?;
        Ok(())
    })
    .await;
    common::unlock(core, lock).await;
    result?;

    if core.config.features.enable_access_lists_updates {
        effects.push(BusMessage::RoomNotification {
            room: room_name.to_string(),
            exclude_socket: None,
            notification: Notification::RoomModeChanged {
                room: room_name.to_string(),
                mode,
            },
        });
    }
    Ok(CommandOutput::with_effects(Value::Null, effects))
}

fn require_mutable(list: ListName) -> ChatResult<()> {
    if list == ListName::Userlist {
        Err(ChatError::NotAllowed(
            "the userlist reflects joins and cannot be edited".to_string(),
        ))
    } else {
        Ok(())
    }
}

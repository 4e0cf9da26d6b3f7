use super::{common, CommandContext, CommandOutput, Core};
use crate::bus::BusMessage;
use crate::error::{ChatError, ChatResult};
use crate::saga::{self, undo};
use crate::state::now_ms;
use roomcast_proto::{DeliveredMessage, ListName, MessagePayload, Notification};
use serde_json::{json, Value};

/// Send a message directly to a user. Permission is decided by the
/// *recipient's* lists. The reply echoes the delivered message.
pub(super) async fn message(
    core: &Core,
    ctx: &CommandContext,
    to: &str,
    payload: MessagePayload,
) -> ChatResult<CommandOutput> {
    common::require_feature(core.config.features.enable_direct_messages, "direct messaging")?;
    let recipient = core
        .backend
        .user(to)
        .await?
        .ok_or_else(|| ChatError::no_user(to))?;
    if !recipient.direct.allows(&ctx.user) {
        return Err(ChatError::NotAllowed(format!(
            "{to} does not accept messages from {}",
            ctx.user
        )));
    }
    core.hooks
        .run_message_checker(core.hook_ctx(), core.config.timing.hook_timeout(), &payload)
        .await?;

    // Direct messages have no history, so no id is assigned.
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
            Notification::DirectMessageEcho {
                to: to.to_string(),
                message: message.clone(),
            },
        )
        .await?;
    let effects = vec![
        BusMessage::UserNotification {
            user: to.to_string(),
            notification: Notification::DirectMessage { message: message.clone() },
        },
        echo,
    ];
    Ok(CommandOutput::with_effects(json!(message), effects))
}

/// Add users to the issuing user's own direct list.
pub(super) async fn add(
    core: &Core,
    ctx: &CommandContext,
    list: ListName,
    users: &[String],
) -> ChatResult<CommandOutput> {
    require_direct_list(list)?;
    let lock = common::lock_user(core, &ctx.user).await?;
    let result = saga::run("directAddToList", async |saga| {
        for user in users {
            let added = core
                .backend
                .add_direct_member(
                    &ctx.user,
                    list,
                    user,
                    core.config.limits.direct_list_size_limit,
                )
                .await?;
            if added {
                saga.push(
                    "add_direct_member",
                    undo::remove_direct_member(
                        core.backend.clone(),
                        ctx.user.clone(),
                        list,
                        user.clone(),
                    ),
                );
            }
        }
        Ok(())
    })
    .await;
    common::unlock(core, lock).await;
    result?;
    Ok(CommandOutput::new(Value::Null))
}

/// Remove users from the issuing user's own direct list.
pub(super) async fn remove(
    core: &Core,
    ctx: &CommandContext,
    list: ListName,
    users: &[String],
) -> ChatResult<CommandOutput> {
    require_direct_list(list)?;
    let lock = common::lock_user(core, &ctx.user).await?;
    let result = saga::run("directRemoveFromList", async |saga| {
        for user in users {
            let removed = core.backend.remove_direct_member(&ctx.user, list, user).await?;
            if removed {
                saga.push(
                    "remove_direct_member",
                    undo::add_direct_member(
                        core.backend.clone(),
                        ctx.user.clone(),
                        list,
                        user.clone(),
                    ),
                );
            }
        }
        Ok(())
    })
    .await;
    common::unlock(core, lock).await;
    result?;
    Ok(CommandOutput::new(Value::Null))
}

pub(super) async fn get(
    core: &Core,
    ctx: &CommandContext,
    list: ListName,
) -> ChatResult<CommandOutput> {
    require_direct_list(list)?;
    let user = core
        .backend
        .user(&ctx.user)
        .await?
        .ok_or_else(|| ChatError::no_user(&ctx.user))?;
    let members: Vec<&String> = user
        .direct
        .list(list)
        .map(|set| set.iter().collect())
        .unwrap_or_default();
    Ok(CommandOutput::new(json!(members)))
}

pub(super) async fn set_mode(
    core: &Core,
    ctx: &CommandContext,
    mode: bool,
) -> ChatResult<CommandOutput> {
    let previous = core
        .backend
        .user(&ctx.user)
        .await?
        .ok_or_else(|| ChatError::no_user(&ctx.user))?
        .direct
        .whitelist_only;
    let lock = common::lock_user(core, &ctx.user).await?;
    let result = saga::run("directSetWhitelistMode", async |saga| {
        core.backend.set_direct_whitelist_mode(&ctx.user, mode).await?;
        saga.push(
            "set_direct_whitelist_mode",
            undo::set_direct_mode(core.backend.clone(), ctx.user.clone(), previous),
        );
        Ok(())
    })
    .await;
    common::unlock(core, lock).await;
    result?;
    Ok(CommandOutput::new(Value::Null))
}

fn require_direct_list(list: ListName) -> ChatResult<()> {
    match list {
        ListName::Whitelist | ListName::Blacklist => Ok(()),
        ListName::Adminlist | ListName::Userlist => Err(ChatError::InvalidArguments(format!(
            "direct lists have no {list}"
        ))),
    }
}

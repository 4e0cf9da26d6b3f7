use super::{common, CommandContext, CommandOutput, Core};
use crate::error::ChatResult;
use serde_json::json;

/// History entries after `after_id`, oldest first, capped at the smaller of
/// the caller's limit and `history_max_get_messages`.
pub(super) async fn get(
    core: &Core,
    ctx: &CommandContext,
    room_name: &str,
    after_id: u64,
    limit: usize,
) -> ChatResult<CommandOutput> {
    let room = common::room_or_not_found(core, room_name).await?;
    common::require_member(&room, &ctx.user)?;

    let limit = limit.min(core.config.limits.history_max_get_messages);
    let messages: Vec<_> = room
        .history_after(after_id, limit)
        .iter()
        .map(|e| e.to_delivered())
        .collect();
    Ok(CommandOutput::new(json!(messages)))
}

/// The whole retained ring, oldest first.
pub(super) async fn recent(
    core: &Core,
    ctx: &CommandContext,
    room_name: &str,
) -> ChatResult<CommandOutput> {
    let room = common::room_or_not_found(core, room_name).await?;
    common::require_member(&room, &ctx.user)?;

    let messages: Vec<_> = room.history.iter().map(|e| e.to_delivered()).collect();
    Ok(CommandOutput::new(json!(messages)))
}

//! Checks and steps shared by the command handlers.

use super::Core;
use crate::bus::BusMessage;
use crate::error::{ChatError, ChatResult};
use crate::lock::LockToken;
use crate::saga::{undo, Saga};
use crate::state::RoomRecord;
use roomcast_proto::Notification;
use std::time::Duration;
use tracing::warn;

/// How long a command waits on a contended lock before giving up with
/// `Busy`.
const LOCK_ATTEMPTS: usize = 5;
const LOCK_BACKOFF: Duration = Duration::from_millis(20);

pub(super) async fn lock_room(core: &Core, room: &str) -> ChatResult<LockToken> {
    core.locks
        .acquire_with_retry(&crate::lock::room_key(room), LOCK_ATTEMPTS, LOCK_BACKOFF)
        .await
}

pub(super) async fn lock_user(core: &Core, user: &str) -> ChatResult<LockToken> {
    core.locks
        .acquire_with_retry(&crate::lock::user_key(user), LOCK_ATTEMPTS, LOCK_BACKOFF)
        .await
}

/// Fetch a room or fail with `NotFound`.
pub(super) async fn room_or_not_found(core: &Core, name: &str) -> ChatResult<RoomRecord> {
    core.backend
        .room(name)
        .await?
        .ok_or_else(|| ChatError::no_room(name))
}

pub(super) fn require_feature(enabled: bool, what: &str) -> ChatResult<()> {
    if enabled {
        Ok(())
    } else {
        Err(ChatError::NotAllowed(format!("{what} is disabled")))
    }
}

pub(super) fn require_admin(room: &RoomRecord, user: &str) -> ChatResult<()> {
    if room.is_admin(user) {
        Ok(())
    } else {
        Err(ChatError::NotAllowed(format!(
            "{user} is not an admin of {}",
            room.name
        )))
    }
}

pub(super) fn require_member(room: &RoomRecord, user: &str) -> ChatResult<()> {
    if room.joined.contains(user) {
        Ok(())
    } else {
        Err(ChatError::NotAllowed(format!(
            "{user} has not joined {}",
            room.name
        )))
    }
}

/// Release a lock, tolerating expiry. The operation it guarded has already
/// settled one way or the other.
pub(super) async fn unlock(core: &Core, token: LockToken) {
    if let Err(error) = core.locks.release(&token).await {
        warn!(key = %token.key, %error, "lock release failed");
    }
}

/// Confirm the lock is still live after a multi-step mutation. A lost lock
/// means another holder may have interleaved, so the caller must roll back.
pub(super) async fn require_still_held(core: &Core, token: &LockToken) -> ChatResult<()> {
    if core.locks.renew(token).await? {
        Ok(())
    } else {
        Err(ChatError::Busy(format!("lock {} lost mid-operation", token.key)))
    }
}

/// Remove every socket of `user` from `room`, with compensations, and queue
/// the ejection notifications. Used when a list or mode change revokes
/// access, and by room deletion.
pub(super) async fn eject_user(
    core: &Core,
    saga: &mut Saga,
    room: &str,
    user: &str,
    effects: &mut Vec<BusMessage>,
) -> ChatResult<()> {
    let mut ejected = false;
    for socket in core.backend.user_sockets(user).await? {
        if !socket.rooms.contains(room) {
            continue;
        }
        core.backend.leave_room(room, user, &socket.id).await?;
        saga.push(
            "eject_user",
            undo::rejoin_room(
                core.backend.clone(),
                room.to_string(),
                user.to_string(),
                socket.id.clone(),
            ),
        );
        // The owning instance detaches the transport channel.
        effects.push(BusMessage::ChannelLeave {
            socket_id: socket.id,
            room: room.to_string(),
        });
        ejected = true;
    }
    if ejected {
        effects.push(BusMessage::UserNotification {
            user: user.to_string(),
            notification: Notification::RoomAccessRemoved { room: room.to_string() },
        });
        if core.config.features.enable_userlist_updates {
            effects.push(BusMessage::RoomNotification {
                room: room.to_string(),
                exclude_socket: None,
                notification: Notification::RoomUserLeft {
                    room: room.to_string(),
                    user: user.to_string(),
                },
            });
        }
    }
    Ok(())
}

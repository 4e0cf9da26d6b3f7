//! Feature toggles.
//!
//! Everything defaults to off; a deployment switches on what it serves.

use serde::Deserialize;

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct FeaturesConfig {
    /// Allow user-to-user messages.
    #[serde(default)]
    pub enable_direct_messages: bool,
    /// Allow clients to create and delete rooms.
    #[serde(default)]
    pub enable_rooms_management: bool,
    /// Broadcast `roomUserJoined`/`roomUserLeft` to room members.
    #[serde(default)]
    pub enable_userlist_updates: bool,
    /// Broadcast access-list and mode changes to room members.
    #[serde(default)]
    pub enable_access_lists_updates: bool,
}

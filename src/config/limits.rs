//! Size limits for history and access lists.

use serde::Deserialize;

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct LimitsConfig {
    /// Cap on entries returned by a single `roomHistoryGet`.
    #[serde(default = "default_history_max_get")]
    pub history_max_get_messages: usize,
    /// Ring capacity per room; oldest entries are evicted first.
    #[serde(default = "default_history_max_size")]
    pub history_max_size: usize,
    /// Cap on each per-user direct-messaging list.
    #[serde(default = "default_direct_list_size")]
    pub direct_list_size_limit: usize,
    /// Cap on each room access list.
    #[serde(default = "default_room_list_size")]
    pub room_list_size_limit: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            history_max_get_messages: default_history_max_get(),
            history_max_size: default_history_max_size(),
            direct_list_size_limit: default_direct_list_size(),
            room_list_size_limit: default_room_list_size(),
        }
    }
}

fn default_history_max_get() -> usize {
    100
}

fn default_history_max_size() -> usize {
    10_000
}

fn default_direct_list_size() -> usize {
    1_000
}

fn default_room_list_size() -> usize {
    10_000
}

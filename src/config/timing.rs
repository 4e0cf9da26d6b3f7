//! Timeouts and periods.
//!
//! All bounds the engine observes come from here; nothing is hard-coded.

use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TimingConfig {
    /// Graceful-shutdown bound; remaining connections are dropped after it.
    #[serde(default = "default_close_timeout")]
    pub close_timeout_ms: u64,
    /// Period between an instance's own heartbeat writes and liveness scans.
    #[serde(default = "default_heartbeat_rate")]
    pub heartbeat_rate_ms: u64,
    /// Silence beyond this marks an instance dead.
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_ms: u64,
    /// Bound on a cluster-bus request/ack round trip.
    #[serde(default = "default_bus_ack_timeout")]
    pub bus_ack_timeout_ms: u64,
    /// Default TTL on distributed locks.
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_ms: u64,
    /// Bound on any single hook invocation.
    #[serde(default = "default_hook_timeout")]
    pub hook_timeout_ms: u64,
}

impl TimingConfig {
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn heartbeat_rate(&self) -> Duration {
        Duration::from_millis(self.heartbeat_rate_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn bus_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.bus_ack_timeout_ms)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    pub fn hook_timeout(&self) -> Duration {
        Duration::from_millis(self.hook_timeout_ms)
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            close_timeout_ms: default_close_timeout(),
            heartbeat_rate_ms: default_heartbeat_rate(),
            heartbeat_timeout_ms: default_heartbeat_timeout(),
            bus_ack_timeout_ms: default_bus_ack_timeout(),
            lock_ttl_ms: default_lock_ttl(),
            hook_timeout_ms: default_hook_timeout(),
        }
    }
}

fn default_close_timeout() -> u64 {
    15_000
}

fn default_heartbeat_rate() -> u64 {
    2_000
}

fn default_heartbeat_timeout() -> u64 {
    10_000
}

fn default_bus_ack_timeout() -> u64 {
    5_000
}

fn default_lock_ttl() -> u64 {
    10_000
}

fn default_hook_timeout() -> u64 {
    5_000
}

//! Startup sanity checks.
//!
//! A misconfigured service refuses to start; these checks run synchronously
//! from `Config::load` and again from `Service::start` for configs built in
//! code.

use super::types::{Config, ConfigError};
use roomcast_proto::valid_name;

impl Config {
    /// Reject configurations that cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(id) = &self.server.instance_id {
            if !valid_name(id) {
                return Err(ConfigError::Invalid(format!(
                    "instance_id {id:?} contains disallowed characters"
                )));
            }
        }
        if self.limits.history_max_size == 0 {
            return Err(ConfigError::Invalid("history_max_size must be positive".into()));
        }
        if self.limits.history_max_get_messages == 0 {
            return Err(ConfigError::Invalid(
                "history_max_get_messages must be positive".into(),
            ));
        }
        if self.timing.heartbeat_rate_ms == 0 {
            return Err(ConfigError::Invalid("heartbeat_rate_ms must be positive".into()));
        }
        if self.timing.heartbeat_timeout_ms <= self.timing.heartbeat_rate_ms {
            return Err(ConfigError::Invalid(
                "heartbeat_timeout_ms must exceed heartbeat_rate_ms".into(),
            ));
        }
        if self.timing.lock_ttl_ms == 0 {
            return Err(ConfigError::Invalid("lock_ttl_ms must be positive".into()));
        }
        if self.timing.bus_ack_timeout_ms == 0 {
            return Err(ConfigError::Invalid("bus_ack_timeout_ms must be positive".into()));
        }
        Ok(())
    }
}

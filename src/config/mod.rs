//! Configuration loading and management.
//!
//! Split into logical submodules:
//! - [`types`]: core config structs ([`Config`], [`ServerConfig`]) and loading
//! - [`features`]: feature toggles (direct messages, rooms management, updates)
//! - [`limits`]: size limits (history, access lists)
//! - [`timing`]: timeouts and periods (locks, heartbeats, bus acks, shutdown)
//! - [`validation`]: startup sanity checks

mod features;
mod limits;
mod timing;
mod types;
mod validation;

pub use features::FeaturesConfig;
pub use limits::LimitsConfig;
pub use timing::TimingConfig;
pub use types::{Config, ConfigError, ServerConfig, StateKind};

//! Clustered room-based messaging backend.
//!
//! A [`service::Service`] instance owns a transport, a state backend, a
//! TTL lock manager, a cluster bus, and a recovery loop. Client commands
//! run through [`commands::CommandPipeline`], which validates, consults
//! hooks, executes under a saga, and propagates the results cluster-wide.

pub mod bus;
pub mod commands;
pub mod config;
pub mod error;
pub mod hooks;
pub mod lock;
pub mod recovery;
pub mod saga;
pub mod service;
pub mod state;
pub mod telemetry;
pub mod transport;

pub use config::Config;
pub use error::{ChatError, ChatResult};
pub use service::Service;

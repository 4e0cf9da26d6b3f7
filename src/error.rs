//! Unified error handling for roomcast.
//!
//! One canonical error type flows through the whole engine; the wire
//! encoding (short name string vs. `{name, args}` object) happens only at
//! the protocol boundary via [`ChatError::to_wire`] and
//! [`roomcast_proto::WireError::encode`].

use roomcast_proto::{ParseError, WireError};
use serde_json::json;
use thiserror::Error;

/// Errors surfaced by command execution and the state engine.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChatError {
    /// Argument shape validation failed.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// Authorization failed: blacklist, whitelist mode, missing privilege,
    /// a disabled feature, or a violated limit.
    #[error("not allowed: {0}")]
    NotAllowed(String),

    /// The referenced room, user, or socket does not exist.
    #[error("no such {kind}: {name}")]
    NotFound { kind: &'static str, name: String },

    /// Lock contention or a transient backend conflict; safe to retry.
    #[error("resource busy: {0}")]
    Busy(String),

    /// A bus ack or backend call exceeded its bound.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Unexpected backend or transport failure.
    #[error("internal error: {0}")]
    Internal(String),

    /// A before/after hook vetoed the operation.
    #[error("rejected by hook: {}", .0.name)]
    HookRejected(WireError),
}

impl ChatError {
    /// Static code for log labeling.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidArguments(_) => "invalid_arguments",
            Self::NotAllowed(_) => "not_allowed",
            Self::NotFound { .. } => "not_found",
            Self::Busy(_) => "busy",
            Self::Timeout(_) => "timeout",
            Self::Internal(_) => "internal",
            Self::HookRejected(_) => "hook_rejected",
        }
    }

    /// Convert to the boundary representation.
    pub fn to_wire(&self) -> WireError {
        match self {
            Self::InvalidArguments(detail) => WireError::new("invalidArguments", vec![json!(detail)]),
            Self::NotAllowed(reason) => WireError::new("notAllowed", vec![json!(reason)]),
            Self::NotFound { kind, name } => WireError::new("notFound", vec![json!(kind), json!(name)]),
            Self::Busy(key) => WireError::new("busy", vec![json!(key)]),
            Self::Timeout(what) => WireError::new("timeout", vec![json!(what)]),
            Self::Internal(detail) => WireError::new("internal", vec![json!(detail)]),
            Self::HookRejected(inner) => inner.clone(),
        }
    }

    pub fn no_room(name: &str) -> Self {
        Self::NotFound { kind: "room", name: name.to_string() }
    }

    pub fn no_user(name: &str) -> Self {
        Self::NotFound { kind: "user", name: name.to_string() }
    }

    pub fn no_socket(id: &str) -> Self {
        Self::NotFound { kind: "socket", name: id.to_string() }
    }
}

impl From<ParseError> for ChatError {
    fn from(e: ParseError) -> Self {
        Self::InvalidArguments(e.to_string())
    }
}

/// Result type threaded through the engine.
pub type ChatResult<T> = Result<T, ChatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes() {
        assert_eq!(ChatError::NotAllowed("x".into()).error_code(), "not_allowed");
        assert_eq!(ChatError::no_room("lobby").error_code(), "not_found");
        assert_eq!(ChatError::Busy("room:lobby".into()).error_code(), "busy");
    }

    #[test]
    fn hook_rejection_keeps_custom_wire_error() {
        let custom = WireError::new("quotaExceeded", vec![json!(3)]);
        let err = ChatError::HookRejected(custom.clone());
        assert_eq!(err.to_wire(), custom);
    }

    #[test]
    fn parse_error_maps_to_invalid_arguments() {
        let parse = roomcast_proto::Command::parse("roomJoin", &[]).unwrap_err();
        let err: ChatError = parse.into();
        assert_eq!(err.error_code(), "invalid_arguments");
    }
}

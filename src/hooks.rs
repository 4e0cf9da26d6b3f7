//! Externally supplied lifecycle and command hooks.
//!
//! Hooks are an ordered set of optional stage handlers, invoked by explicit
//! call with the service context passed in. Every invocation is bounded by
//! the configured hook timeout; an error or a timeout counts as a rejection.

use crate::config::Config;
use crate::error::{ChatError, ChatResult};
use crate::state::SharedBackend;
use async_trait::async_trait;
use roomcast_proto::{Command, WireError};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Context handed to every hook invocation. Hooks never reach for global
/// state; everything they may touch comes through here.
pub struct HookContext<'a> {
    pub instance: &'a str,
    pub config: &'a Config,
    pub backend: &'a SharedBackend,
}

/// Outcome of a before-hook.
pub enum HookOutcome {
    /// Continue the pipeline.
    Proceed,
    /// Short-circuit with this result; the command does not execute.
    Replace(Value),
    /// Veto the command.
    Reject(WireError),
}

/// Authenticates a connecting socket from its handshake data.
/// Returns the user name and auth data echoed in `loginConfirmed`.
#[async_trait]
pub trait ConnectHook: Send + Sync {
    async fn call(
        &self,
        ctx: HookContext<'_>,
        socket_id: &str,
        handshake: Value,
    ) -> Result<(String, Value), WireError>;
}

/// Observes a socket teardown.
#[async_trait]
pub trait DisconnectHook: Send + Sync {
    async fn call(&self, ctx: HookContext<'_>, socket_id: &str, user: &str);
}

/// Runs before a command executes.
#[async_trait]
pub trait BeforeHook: Send + Sync {
    async fn call(&self, ctx: HookContext<'_>, socket_id: &str, cmd: &Command) -> HookOutcome;
}

/// Runs after a command executes; may override the result.
#[async_trait]
pub trait AfterHook: Send + Sync {
    async fn call(
        &self,
        ctx: HookContext<'_>,
        socket_id: &str,
        cmd: &Command,
        result: &ChatResult<Value>,
    ) -> Option<ChatResult<Value>>;
}

/// Runs at service start/close.
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    async fn call(&self, ctx: HookContext<'_>) -> Result<(), WireError>;
}

/// Validates a message payload before delivery (room and direct messages).
#[async_trait]
pub trait MessageChecker: Send + Sync {
    async fn call(
        &self,
        ctx: HookContext<'_>,
        payload: &roomcast_proto::MessagePayload,
    ) -> Result<(), WireError>;
}

/// The full optional hook set.
#[derive(Default, Clone)]
pub struct Hooks {
    pub connect: Option<Arc<dyn ConnectHook>>,
    pub disconnect: Option<Arc<dyn DisconnectHook>>,
    pub before: Option<Arc<dyn BeforeHook>>,
    pub after: Option<Arc<dyn AfterHook>>,
    pub on_start: Option<Arc<dyn LifecycleHook>>,
    pub on_close: Option<Arc<dyn LifecycleHook>>,
    pub message_checker: Option<Arc<dyn MessageChecker>>,
}

impl Hooks {
    /// Run the connect hook. Without one, the user name comes from the
    /// handshake's `user` field.
    pub async fn run_connect(
        &self,
        ctx: HookContext<'_>,
        timeout: Duration,
        socket_id: &str,
        handshake: Value,
    ) -> ChatResult<(String, Value)> {
        match &self.connect {
            Some(hook) => {
                bound(timeout, "connect hook", hook.call(ctx, socket_id, handshake))
                    .await?
                    .map_err(ChatError::HookRejected)
            }
            None => {
                let user = handshake
                    .get("user")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        ChatError::HookRejected(WireError::new("noLogin", vec![]))
                    })?
                    .to_string();
                Ok((user, Value::Null))
            }
        }
    }

    pub async fn run_disconnect(
        &self,
        ctx: HookContext<'_>,
        timeout: Duration,
        socket_id: &str,
        user: &str,
    ) {
        if let Some(hook) = &self.disconnect {
            let _ = bound(timeout, "disconnect hook", hook.call(ctx, socket_id, user)).await;
        }
    }

    pub async fn run_before(
        &self,
        ctx: HookContext<'_>,
        timeout: Duration,
        socket_id: &str,
        cmd: &Command,
    ) -> ChatResult<HookOutcome> {
        match &self.before {
            Some(hook) => bound(timeout, "before hook", hook.call(ctx, socket_id, cmd)).await,
            None => Ok(HookOutcome::Proceed),
        }
    }

    pub async fn run_after(
        &self,
        ctx: HookContext<'_>,
        timeout: Duration,
        socket_id: &str,
        cmd: &Command,
        result: ChatResult<Value>,
    ) -> ChatResult<Value> {
        match &self.after {
            Some(hook) => {
                match bound(timeout, "after hook", hook.call(ctx, socket_id, cmd, &result)).await {
                    Ok(Some(overridden)) => overridden,
                    Ok(None) => result,
                    Err(e) => Err(e),
                }
            }
            None => result,
        }
    }

    pub async fn run_lifecycle(
        &self,
        hook: &Option<Arc<dyn LifecycleHook>>,
        ctx: HookContext<'_>,
        timeout: Duration,
        stage: &'static str,
    ) -> ChatResult<()> {
        match hook {
            Some(hook) => bound(timeout, stage, hook.call(ctx))
                .await?
                .map_err(ChatError::HookRejected),
            None => Ok(()),
        }
    }

    pub async fn run_message_checker(
        &self,
        ctx: HookContext<'_>,
        timeout: Duration,
        payload: &roomcast_proto::MessagePayload,
    ) -> ChatResult<()> {
        match &self.message_checker {
            Some(hook) => bound(timeout, "message checker", hook.call(ctx, payload))
                .await?
                .map_err(ChatError::HookRejected),
            None => Ok(()),
        }
    }
}

/// Bound a hook future; elapsing counts as a rejection.
async fn bound<T>(
    timeout: Duration,
    what: &'static str,
    fut: impl std::future::Future<Output = T>,
) -> ChatResult<T> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| ChatError::HookRejected(WireError::new("hookTimeout", vec![what.into()])))
}

//! Compensating-operation runner.
//!
//! A multi-step mutation registers a compensating inverse after every
//! applied sub-step. On failure the accumulated compensations unwind in
//! reverse order, restoring externally observable state even though the
//! backend has no multi-key transactions. Recovery reuses the same
//! compensations (the [`undo`] builders) to reclaim state a dead instance
//! left behind, so rollback and recovery share one code path.

use crate::error::{ChatError, ChatResult};
use futures_util::future::BoxFuture;
use tracing::{debug, warn};

/// Accumulates compensations for one multi-step operation.
pub struct Saga {
    label: &'static str,
    compensations: Vec<(&'static str, BoxFuture<'static, ChatResult<()>>)>,
}

impl Saga {
    pub fn new(label: &'static str) -> Self {
        Self { label, compensations: Vec::new() }
    }

    /// Register the inverse of a sub-step that just applied.
    pub fn push<F>(&mut self, name: &'static str, compensation: F)
    where
        F: std::future::Future<Output = ChatResult<()>> + Send + 'static,
    {
        self.compensations.push((name, Box::pin(compensation)));
    }

    /// The operation succeeded; the compensations are dropped unrun.
    pub fn commit(mut self) {
        self.compensations.clear();
    }

    /// Undo every applied sub-step, most recent first. A failing
    /// compensation is logged and skipped; the rest still run.
    pub async fn unwind(mut self) {
        while let Some((name, compensation)) = self.compensations.pop() {
            debug!(saga = self.label, step = name, "compensating");
            if let Err(e) = compensation.await {
                warn!(saga = self.label, step = name, error = %e, "compensation failed");
            }
        }
    }
}

/// Run a saga-wrapped operation: commit on success, unwind on failure.
pub async fn run<T, F>(label: &'static str, f: F) -> ChatResult<T>
where
    F: for<'a> AsyncFnOnce(&'a mut Saga) -> ChatResult<T>,
{
    let mut saga = Saga::new(label);
    match f(&mut saga).await {
        Ok(value) => {
            saga.commit();
            Ok(value)
        }
        Err(e) => {
            saga.unwind().await;
            Err(e)
        }
    }
}

/// Reusable compensations over the state backend and transport. The command
/// pipeline pushes these after each applied sub-step; the recovery manager
/// runs them directly against a dead instance's leftovers.
pub mod undo {
    use super::*;
    use crate::state::{SharedBackend, SocketRecord};
    use crate::transport::SharedTransport;

    /// Inverse of a room join: drop the state association.
    pub fn leave_room(
        backend: SharedBackend,
        room: String,
        user: String,
        socket_id: String,
    ) -> BoxFuture<'static, ChatResult<()>> {
        Box::pin(async move {
            backend.leave_room(&room, &user, &socket_id).await?;
            Ok(())
        })
    }

    /// Inverse of a transport channel join.
    pub fn leave_channel(
        transport: SharedTransport,
        socket_id: String,
        room: String,
    ) -> BoxFuture<'static, ChatResult<()>> {
        Box::pin(async move { transport.leave_channel(&socket_id, &room).await })
    }

    /// Inverse of a transport channel leave.
    pub fn rejoin_channel(
        transport: SharedTransport,
        socket_id: String,
        room: String,
    ) -> BoxFuture<'static, ChatResult<()>> {
        Box::pin(async move { transport.join_channel(&socket_id, &room).await })
    }

    /// Inverse of a room leave: restore the state association.
    pub fn rejoin_room(
        backend: SharedBackend,
        room: String,
        user: String,
        socket_id: String,
    ) -> BoxFuture<'static, ChatResult<()>> {
        Box::pin(async move {
            backend.join_room(&room, &user, &socket_id).await?;
            Ok(())
        })
    }

    /// Inverse of a socket registration.
    pub fn remove_socket(
        backend: SharedBackend,
        socket_id: String,
    ) -> BoxFuture<'static, ChatResult<()>> {
        Box::pin(async move {
            backend.remove_socket(&socket_id).await?;
            Ok(())
        })
    }

    /// Inverse of a socket removal.
    pub fn restore_socket(
        backend: SharedBackend,
        socket: SocketRecord,
    ) -> BoxFuture<'static, ChatResult<()>> {
        Box::pin(async move {
            backend.add_socket(socket).await?;
            Ok(())
        })
    }

    /// Inverse of a list add.
    pub fn remove_list_member(
        backend: SharedBackend,
        room: String,
        list: roomcast_proto::ListName,
        member: String,
    ) -> BoxFuture<'static, ChatResult<()>> {
        Box::pin(async move {
            backend.remove_list_member(&room, list, &member).await?;
            Ok(())
        })
    }

    /// Inverse of a direct-list add.
    pub fn remove_direct_member(
        backend: SharedBackend,
        user: String,
        list: roomcast_proto::ListName,
        member: String,
    ) -> BoxFuture<'static, ChatResult<()>> {
        Box::pin(async move {
            backend.remove_direct_member(&user, list, &member).await?;
            Ok(())
        })
    }

    /// Inverse of a direct-list remove.
    pub fn add_direct_member(
        backend: SharedBackend,
        user: String,
        list: roomcast_proto::ListName,
        member: String,
    ) -> BoxFuture<'static, ChatResult<()>> {
        Box::pin(async move {
            backend
                .add_direct_member(&user, list, &member, usize::MAX)
                .await?;
            Ok(())
        })
    }

    /// Inverse of a direct whitelist-mode flip.
    pub fn set_direct_mode(
        backend: SharedBackend,
        user: String,
        mode: bool,
    ) -> BoxFuture<'static, ChatResult<()>> {
        Box::pin(async move { backend.set_direct_whitelist_mode(&user, mode).await })
    }

    /// Inverse of a room whitelist-mode flip.
    pub fn set_room_mode(
        backend: SharedBackend,
        room: String,
        mode: bool,
    ) -> BoxFuture<'static, ChatResult<()>> {
        Box::pin(async move { backend.set_whitelist_mode(&room, mode).await })
    }

    /// Inverse of a room delete: put the captured record back.
    pub fn restore_room(
        backend: SharedBackend,
        room: crate::state::RoomRecord,
    ) -> BoxFuture<'static, ChatResult<()>> {
        Box::pin(async move {
            backend.create_room(room).await?;
            Ok(())
        })
    }

    /// Inverse of a list remove. `limit` is `usize::MAX`: restoring what was
    /// present cannot violate the limit.
    pub fn add_list_member(
        backend: SharedBackend,
        room: String,
        list: roomcast_proto::ListName,
        member: String,
    ) -> BoxFuture<'static, ChatResult<()>> {
        Box::pin(async move {
            backend.add_list_member(&room, list, &member, usize::MAX).await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[tokio::test]
    async fn unwind_runs_in_reverse_order() {
        let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let mut saga = Saga::new("test");
        for name in ["first", "second", "third"] {
            let log = log.clone();
            saga.push(name, async move {
                log.lock().push(name);
                Ok(())
            });
        }
        saga.unwind().await;
        assert_eq!(*log.lock(), vec!["third", "second", "first"]);
    }

    #[tokio::test]
    async fn commit_drops_compensations() {
        let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let mut saga = Saga::new("test");
        let inner = log.clone();
        saga.push("only", async move {
            inner.lock().push("only");
            Ok(())
        });
        saga.commit();
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn failed_compensation_does_not_stop_the_unwind() {
        let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let mut saga = Saga::new("test");
        let first = log.clone();
        saga.push("first", async move {
            first.lock().push("first");
            Ok(())
        });
        saga.push("failing", async { Err(ChatError::Internal("boom".into())) });
        saga.unwind().await;
        assert_eq!(*log.lock(), vec!["first"]);
    }

    #[tokio::test]
    async fn run_unwinds_on_error_and_commits_on_success() {
        let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        let inner = log.clone();
        let result: ChatResult<()> = run("failing-op", async move |saga| {
            let entry = inner.clone();
            saga.push("undo-step", async move {
                entry.lock().push("undone");
                Ok(())
            });
            Err(ChatError::Internal("step 2 failed".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(*log.lock(), vec!["undone"]);

        log.lock().clear();
        let inner = log.clone();
        let result: ChatResult<u32> = run("ok-op", async move |saga| {
            let entry = inner.clone();
            saga.push("undo-step", async move {
                entry.lock().push("undone");
                Ok(())
            });
            Ok(7)
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert!(log.lock().is_empty());
    }
}

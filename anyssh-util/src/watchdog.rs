//! Two-step cancellation: ask the task to stop, then force it.

use std::future::Future;
use std::time::Duration;

use log::{debug, warn};
use tokio_util::sync::CancellationToken;

use crate::runtime::AbortHandle;

/// How a [`cancel_then_abort`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    /// The task had already finished before cancellation was requested.
    AlreadyFinished,
    /// The task observed the token and finished within the grace period.
    Cooperative,
    /// The grace period ran out and the task was aborted.
    Aborted,
}

/// Cancel `token`, give the task `grace` to wind down (`finished` resolves
/// when it has), then abort it.
pub async fn cancel_then_abort<F>(
    token: &CancellationToken,
    task: &AbortHandle,
    grace: Duration,
    finished: F,
) -> Escalation
where
    F: Future<Output = ()>,
{
    if task.is_finished() {
        return Escalation::AlreadyFinished;
    }
    token.cancel();
    match tokio::time::timeout(grace, finished).await {
        Ok(()) => {
            debug!("task stopped after cancellation");
            Escalation::Cooperative
        }
        Err(_) => {
            warn!("task ignored cancellation for {grace:?}, aborting");
            task.abort();
            Escalation::Aborted
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::runtime::spawn;

    #[tokio::test]
    async fn cooperative_task_is_not_aborted() {
        let token = CancellationToken::new();
        let child = token.clone();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = spawn(async move {
            child.cancelled().await;
            let _ = tx.send(());
        });
        let escalation = cancel_then_abort(
            &token,
            &handle.abort_handle(),
            Duration::from_secs(5),
            async {
                let _ = rx.await;
            },
        )
        .await;
        assert_eq!(escalation, Escalation::Cooperative);
    }

    #[tokio::test]
    async fn stubborn_task_is_aborted() {
        let token = CancellationToken::new();
        let handle = spawn(std::future::pending::<()>());
        let escalation = cancel_then_abort(
            &token,
            &handle.abort_handle(),
            Duration::from_millis(20),
            std::future::pending::<()>(),
        )
        .await;
        assert_eq!(escalation, Escalation::Aborted);
        assert!(handle.await.unwrap_err().is_aborted());
    }
}

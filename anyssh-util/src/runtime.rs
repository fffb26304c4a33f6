use std::future::Future;
use std::ops::Deref;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Error returned when a spawned task did not run to completion.
#[derive(Debug)]
pub struct JoinError {
    aborted: bool,
    inner: Box<dyn std::error::Error + Send + Sync>,
}

impl JoinError {
    /// Whether the task was aborted rather than having panicked.
    pub fn is_aborted(&self) -> bool {
        self.aborted
    }
}

impl Deref for JoinError {
    type Target = dyn std::error::Error + Send + Sync;

    fn deref(&self) -> &Self::Target {
        &*self.inner
    }
}

impl std::fmt::Display for JoinError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}

impl std::error::Error for JoinError {}

impl From<tokio::task::JoinError> for JoinError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self {
            aborted: e.is_cancelled(),
            inner: Box::new(e),
        }
    }
}

/// Handle to a task started with [`spawn`].
///
/// Unlike dropping a future, dropping this handle does not stop the
/// task; use [`JoinHandle::abort`] for that.
#[derive(Debug)]
pub struct JoinHandle<T> {
    handle: tokio::task::JoinHandle<T>,
}

impl<T> JoinHandle<T> {
    /// Forcefully stop the task at its next suspension point.
    pub fn abort(&self) {
        self.handle.abort()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// A handle that can abort the task without owning its output.
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle(self.handle.abort_handle())
    }
}

/// Owned, cloneable permission to abort one task.
#[derive(Debug, Clone)]
pub struct AbortHandle(tokio::task::AbortHandle);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.abort()
    }

    pub fn is_finished(&self) -> bool {
        self.0.is_finished()
    }
}

pub fn spawn<F, T>(future: F) -> JoinHandle<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    JoinHandle {
        handle: tokio::spawn(future),
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.handle).poll(cx) {
            Poll::Ready(Ok(val)) => Poll::Ready(Ok(val)),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e.into())),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[tokio::test]
    async fn spawned_value_is_returned() {
        let handle = spawn(async { 21 * 2 });
        assert_eq!(handle.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn aborted_task_reports_abort() {
        let handle = spawn(std::future::pending::<()>());
        handle.abort();
        let err = handle.await.unwrap_err();
        assert!(err.is_aborted());
    }
}

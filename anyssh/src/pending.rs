//! Non-blocking facade.
//!
//! [`AsyncSession`] and [`AsyncChannel`] start each operation on its own
//! task and hand back a [`PendingOperation`] right away. The task runs
//! the same code as the corresponding [`Session`] or [`Channel`] method;
//! the handle adds bounded waits and cancellation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyssh_util::runtime::{spawn, JoinHandle};
use anyssh_util::watchdog::{cancel_then_abort, Escalation};
use bytes::Bytes;
use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{oneshot, Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use crate::session::race;
use crate::{
    AuthOutcome, Authenticator, Channel, ChannelKind, ChannelWriter, Error, Session, SessionState,
    StateHandle, Target,
};

/// What a [`PendingOperation`] is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Connect,
    Authenticate,
    OpenChannel,
    Close,
    ChannelOpen,
    ChannelClose,
    Write,
    Shutdown,
    Read,
    WaitExitStatus,
}

impl OperationKind {
    pub fn name(&self) -> &'static str {
        match self {
            OperationKind::Connect => "connect",
            OperationKind::Authenticate => "authenticate",
            OperationKind::OpenChannel => "open_channel",
            OperationKind::Close => "close",
            OperationKind::ChannelOpen => "channel open",
            OperationKind::ChannelClose => "channel close",
            OperationKind::Write => "write",
            OperationKind::Shutdown => "shutdown",
            OperationKind::Read => "read",
            OperationKind::WaitExitStatus => "wait_exit_status",
        }
    }
}

enum Completion<T> {
    Running(JoinHandle<Result<T, Error>>),
    Ready(Result<T, Error>),
    Taken,
}

/// An operation running in the background.
///
/// Dropping the handle does not stop the operation; use
/// [`PendingOperation::cancel`].
#[must_use]
pub struct PendingOperation<T> {
    kind: OperationKind,
    token: CancellationToken,
    completion: Completion<T>,
}

impl<T> std::fmt::Debug for PendingOperation<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingOperation")
            .field("kind", &self.kind)
            .field("done", &self.is_done())
            .finish()
    }
}

impl<T> PendingOperation<T> {
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn is_done(&self) -> bool {
        match &self.completion {
            Completion::Running(task) => task.is_finished(),
            Completion::Ready(_) | Completion::Taken => true,
        }
    }

    /// Ask the operation to stop. Prompts and backend calls it is blocked
    /// on return promptly with a cancellation error.
    pub fn cancel(&self) {
        self.token.cancel()
    }
}

impl<T: Send + 'static> PendingOperation<T> {
    fn start<F, Fut>(kind: OperationKind, op: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
    {
        let token = CancellationToken::new();
        let task = spawn(op(token.clone()));
        PendingOperation {
            kind,
            token,
            completion: Completion::Running(task),
        }
    }

    fn failed(kind: OperationKind, error: Error) -> Self {
        PendingOperation {
            kind,
            token: CancellationToken::new(),
            completion: Completion::Ready(Err(error)),
        }
    }

    /// Wait up to `timeout` for the result.
    ///
    /// On timeout, [`Error::TimeoutExceeded`] is returned and the
    /// operation keeps running: the handle can be waited on again.
    pub async fn wait(&mut self, timeout: Duration) -> Result<T, Error> {
        let waited = tokio::time::timeout(timeout, self.wait_forever()).await;
        match waited {
            Ok(result) => result,
            Err(_) => {
                debug!("{} still running after {timeout:?}", self.kind.name());
                Err(Error::TimeoutExceeded)
            }
        }
    }

    /// Wait for the result. It can be taken once.
    pub async fn wait_forever(&mut self) -> Result<T, Error> {
        if let Completion::Running(task) = &mut self.completion {
            let joined = task.await;
            self.completion = Completion::Ready(joined.unwrap_or_else(|e| Err(e.into())));
        }
        match std::mem::replace(&mut self.completion, Completion::Taken) {
            Completion::Ready(result) => result,
            Completion::Running(_) | Completion::Taken => Err(Error::IllegalState {
                operation: self.kind.name(),
                state: "result already taken".to_string(),
            }),
        }
    }

    /// Cancel, wait up to `grace` for the operation to wind down, then
    /// abort its task.
    pub async fn cancel_with_watchdog(&mut self, grace: Duration) -> Escalation {
        let Completion::Running(task) = &mut self.completion else {
            return Escalation::AlreadyFinished;
        };
        let abort = task.abort_handle();
        let mut joined = None;
        let escalation = cancel_then_abort(&self.token, &abort, grace, async {
            joined = Some(task.await);
        })
        .await;
        if let Some(joined) = joined {
            self.completion = Completion::Ready(joined.unwrap_or_else(|e| Err(e.into())));
        }
        escalation
    }
}

/// A [`Session`] shared between tasks, one operation at a time.
///
/// Starting an operation while another is pending yields an operation
/// already failed with [`Error::IllegalState`]: operations are never
/// queued.
#[derive(Clone)]
pub struct AsyncSession {
    session: Arc<Mutex<Session>>,
    state: StateHandle,
}

impl std::fmt::Debug for AsyncSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncSession")
            .field("state", &self.state.get())
            .finish()
    }
}

impl From<Session> for AsyncSession {
    fn from(session: Session) -> Self {
        AsyncSession::new(session)
    }
}

impl AsyncSession {
    pub fn new(session: Session) -> Self {
        AsyncSession {
            state: session.state_handle(),
            session: Arc::new(Mutex::new(session)),
        }
    }

    /// The session state, readable while an operation is running.
    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    /// Direct access to the session, if no operation is pending.
    pub fn try_session(&self) -> Result<OwnedMutexGuard<Session>, Error> {
        self.session
            .clone()
            .try_lock_owned()
            .map_err(|_| self.busy("try_session"))
    }

    fn busy(&self, operation: &'static str) -> Error {
        Error::IllegalState {
            operation,
            state: format!("{:?}, with an operation pending", self.state.get()),
        }
    }

    fn start<T, F, Fut>(&self, kind: OperationKind, op: F) -> PendingOperation<T>
    where
        T: Send + 'static,
        F: FnOnce(OwnedMutexGuard<Session>, CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
    {
        match self.session.clone().try_lock_owned() {
            Ok(session) => PendingOperation::start(kind, |token| op(session, token)),
            Err(_) => PendingOperation::failed(kind, self.busy(kind.name())),
        }
    }

    pub fn connect(&self, host: &str, port: u16, username: &str) -> PendingOperation<()> {
        let target = Target::new(host, port, username);
        self.start(OperationKind::Connect, |mut session, token| async move {
            session.connect_with_cancel(target, &token).await
        })
    }

    /// Resolves to `true` once authenticated, see [`Session::authenticate`].
    pub fn authenticate(&self, authenticators: Vec<Authenticator>) -> PendingOperation<bool> {
        self.start(OperationKind::Authenticate, |mut session, token| async move {
            let outcome = session
                .authenticate_with_cancel(&authenticators, &token)
                .await?;
            Ok(outcome == AuthOutcome::Success)
        })
    }

    pub fn authenticate_outcome(
        &self,
        authenticators: Vec<Authenticator>,
    ) -> PendingOperation<AuthOutcome> {
        self.start(OperationKind::Authenticate, |mut session, token| async move {
            session
                .authenticate_with_cancel(&authenticators, &token)
                .await
        })
    }

    pub fn open_channel(&self, kind: ChannelKind) -> PendingOperation<AsyncChannel> {
        self.start(OperationKind::OpenChannel, |mut session, token| async move {
            race(&token, Error::Cancelled, async {
                let channel = session.channel(kind).await?;
                drop(session);
                channel.open().await?;
                Ok(AsyncChannel::new(channel))
            })
            .await
        })
    }

    pub fn exec<S: Into<String>>(&self, command: S) -> PendingOperation<AsyncChannel> {
        self.open_channel(ChannelKind::Command {
            command: command.into(),
        })
    }

    pub fn close(&self) -> PendingOperation<()> {
        self.start(OperationKind::Close, |mut session, _| async move {
            session.close().await
        })
    }
}

/// A [`Channel`] whose operations run in the background.
#[derive(Clone, Debug)]
pub struct AsyncChannel {
    channel: Channel,
    stdin: Arc<Mutex<Option<ChannelWriter>>>,
    /// Completion of the last stdin operation started.
    last_write: Arc<parking_lot::Mutex<Option<oneshot::Receiver<()>>>>,
}

impl From<Channel> for AsyncChannel {
    fn from(channel: Channel) -> Self {
        AsyncChannel::new(channel)
    }
}

impl AsyncChannel {
    pub fn new(channel: Channel) -> Self {
        AsyncChannel {
            channel,
            stdin: Arc::new(Mutex::new(None)),
            last_write: Arc::new(parking_lot::Mutex::new(None)),
        }
    }

    /// Take a place in the stdin queue: the receiver resolves when the
    /// previous operation is done, and dropping the sender lets the next
    /// one run.
    fn enqueue(&self) -> (Option<oneshot::Receiver<()>>, oneshot::Sender<()>) {
        let (done, next) = oneshot::channel();
        let previous = self.last_write.lock().replace(next);
        (previous, done)
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    fn start<T, F, Fut>(&self, kind: OperationKind, op: F) -> PendingOperation<T>
    where
        T: Send + 'static,
        F: FnOnce(Channel) -> Fut,
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
    {
        let fut = op(self.channel.clone());
        PendingOperation::start(kind, |token| async move {
            race(&token, Error::Cancelled, fut).await
        })
    }

    pub fn open(&self) -> PendingOperation<()> {
        self.start(OperationKind::ChannelOpen, |channel| async move {
            channel.open().await
        })
    }

    pub fn close(&self) -> PendingOperation<()> {
        self.start(OperationKind::ChannelClose, |channel| async move {
            channel.close().await
        })
    }

    /// Write all of `data` to stdin. Writes are applied in the order
    /// they were started.
    pub fn write_all<B: Into<Bytes>>(&self, data: B) -> PendingOperation<()> {
        let data = data.into();
        let stdin = self.stdin.clone();
        let (previous, done) = self.enqueue();
        self.start(OperationKind::Write, |channel| async move {
            let _done = done;
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            let mut stdin = stdin.lock_owned().await;
            if stdin.is_none() {
                *stdin = Some(channel.take_stdin()?);
            }
            let writer = stdin.as_mut().ok_or(Error::ChannelClosed)?;
            writer.write_all(&data).await?;
            writer.flush().await?;
            Ok(())
        })
    }

    /// Send EOF on stdin, after the writes already started.
    pub fn shutdown(&self) -> PendingOperation<()> {
        let stdin = self.stdin.clone();
        let (previous, done) = self.enqueue();
        self.start(OperationKind::Shutdown, |channel| async move {
            let _done = done;
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            let mut stdin = stdin.lock_owned().await;
            match stdin.as_mut() {
                Some(writer) => Ok(writer.shutdown().await?),
                None => channel.eof().await,
            }
        })
    }

    /// Read stdout until the peer ends it.
    pub fn read_to_end(&self) -> PendingOperation<Vec<u8>> {
        self.start(OperationKind::Read, |channel| async move {
            let mut stdout = channel.take_stdout()?;
            let mut buf = Vec::new();
            stdout.read_to_end(&mut buf).await?;
            Ok(buf)
        })
    }

    pub fn wait_exit_status(&self) -> PendingOperation<Option<u32>> {
        self.start(OperationKind::WaitExitStatus, |channel| async move {
            Ok(channel.wait_exit_status().await)
        })
    }
}

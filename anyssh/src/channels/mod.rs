//! Channels: one logical stream set within an authenticated session.
//!
//! A [`Channel`] is built on a [`BackendChannel`], i.e. a pair of
//! [`ChannelMsg`] queues. Once open, one pump task reads the backend
//! queue and fans the payload out into per-stream queues, from which
//! [`ChannelReader`]s read. Exit status and lifecycle are tracked here,
//! and every step is reported to the registered [`ChannelListener`]s.

use std::collections::{HashMap, VecDeque};
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, trace, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, Sender, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::backend::{BackendChannel, ChannelOpen};
use crate::Error;

mod events;
mod extended;
mod io;
mod join;

pub use events::{ChannelEvent, ChannelListener, ListenerId, StreamKind};
pub use extended::ExtendedDataHandler;
pub use io::{ChannelReader, ChannelWriter};

/// How long an orderly close waits for the peer's own close message.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
/// The identifier of a channel.
pub struct ChannelId(pub(crate) u32);

impl From<u32> for ChannelId {
    fn from(c: u32) -> ChannelId {
        ChannelId(c)
    }
}

impl From<ChannelId> for u32 {
    fn from(c: ChannelId) -> u32 {
        c.0
    }
}

impl Display for ChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The type of signals that can be sent to a remote process. If you
/// plan to use custom signals, read [the
/// RFC](https://tools.ietf.org/html/rfc4254#section-6.10) to
/// understand the encoding.
#[allow(missing_docs)]
// This should be relatively self-explanatory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sig {
    ABRT,
    ALRM,
    FPE,
    HUP,
    ILL,
    INT,
    KILL,
    PIPE,
    QUIT,
    SEGV,
    TERM,
    USR1,
    Custom(String),
}

impl Sig {
    pub fn name(&self) -> &str {
        match *self {
            Sig::ABRT => "ABRT",
            Sig::ALRM => "ALRM",
            Sig::FPE => "FPE",
            Sig::HUP => "HUP",
            Sig::ILL => "ILL",
            Sig::INT => "INT",
            Sig::KILL => "KILL",
            Sig::PIPE => "PIPE",
            Sig::QUIT => "QUIT",
            Sig::SEGV => "SEGV",
            Sig::TERM => "TERM",
            Sig::USR1 => "USR1",
            Sig::Custom(ref c) => c,
        }
    }

    pub fn from_name(name: &str) -> Sig {
        match name {
            "ABRT" => Sig::ABRT,
            "ALRM" => Sig::ALRM,
            "FPE" => Sig::FPE,
            "HUP" => Sig::HUP,
            "ILL" => Sig::ILL,
            "INT" => Sig::INT,
            "KILL" => Sig::KILL,
            "PIPE" => Sig::PIPE,
            "QUIT" => Sig::QUIT,
            "SEGV" => Sig::SEGV,
            "TERM" => Sig::TERM,
            "USR1" => Sig::USR1,
            x => Sig::Custom(x.to_string()),
        }
    }
}

/// Pseudo-terminal requested before a shell or command starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    pub term: String,
    pub col_width: u32,
    pub row_height: u32,
    pub pix_width: u32,
    pub pix_height: u32,
}

impl Default for PtyRequest {
    fn default() -> Self {
        PtyRequest {
            term: "xterm".to_string(),
            col_width: 80,
            row_height: 24,
            pix_width: 0,
            pix_height: 0,
        }
    }
}

/// How the remote process was terminated by a signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitSignal {
    pub signal_name: Sig,
    pub core_dumped: bool,
    pub error_message: String,
    pub lang_tag: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
/// Messages exchanged with the backend for one channel.
pub enum ChannelMsg {
    Data {
        data: Bytes,
    },
    ExtendedData {
        data: Bytes,
        ext: u32,
    },
    Eof,
    Close,
    /// (client only)
    RequestPty {
        want_reply: bool,
        term: String,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    },
    /// (client only)
    RequestShell {
        want_reply: bool,
    },
    /// (client only)
    Exec {
        want_reply: bool,
        command: Vec<u8>,
    },
    /// (client only)
    Signal {
        signal: Sig,
    },
    /// (client only)
    RequestSubsystem {
        want_reply: bool,
        name: String,
    },
    /// (client only)
    SetEnv {
        want_reply: bool,
        variable_name: String,
        variable_value: String,
    },
    /// (client only)
    WindowChange {
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    },
    /// (server only)
    ExitStatus {
        exit_status: u32,
    },
    /// (server only)
    ExitSignal {
        signal_name: Sig,
        core_dumped: bool,
        error_message: String,
        lang_tag: String,
    },
    /// (server only)
    Success,
    /// (server only)
    Failure,
}

/// What a channel is for. Determines the requests sent by
/// [`Channel::open`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelKind {
    /// Interactive shell, optionally on a pseudo-terminal.
    Shell { pty: Option<PtyRequest> },
    /// Remote command (`exec` request).
    Command { command: String },
    /// The `sftp` subsystem. File operations are left to an SFTP client
    /// running over the channel streams.
    Sftp,
    /// An `scp -t`/`scp -f` command.
    Scp { command: String },
    /// A `direct-tcpip` tunnel.
    Forwarding {
        host: String,
        port: u32,
        originator_address: String,
        originator_port: u32,
    },
    /// Any other subsystem.
    Custom { subsystem: String },
}

impl ChannelKind {
    pub fn name(&self) -> &'static str {
        match self {
            ChannelKind::Shell { .. } => "shell",
            ChannelKind::Command { .. } => "command",
            ChannelKind::Sftp => "sftp",
            ChannelKind::Scp { .. } => "scp",
            ChannelKind::Forwarding { .. } => "forwarding",
            ChannelKind::Custom { .. } => "custom",
        }
    }

    /// Whether the channel carries an extended (stderr) stream.
    pub fn has_extended(&self) -> bool {
        !matches!(self, ChannelKind::Forwarding { .. })
    }

    pub(crate) fn open_request(&self) -> ChannelOpen {
        match self {
            ChannelKind::Forwarding {
                host,
                port,
                originator_address,
                originator_port,
            } => ChannelOpen::DirectTcpip {
                host_to_connect: host.clone(),
                port_to_connect: *port,
                originator_address: originator_address.clone(),
                originator_port: *originator_port,
            },
            _ => ChannelOpen::Session,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Created,
    Opening,
    Open,
    Closing,
    Closed,
    Failed,
}

#[derive(Debug, Clone, Default)]
struct ExitState {
    status: Option<u32>,
    signal: Option<ExitSignal>,
    /// The channel is gone; no status will come anymore.
    closed: bool,
}

struct StreamSenders {
    stdout: Option<UnboundedSender<Bytes>>,
    stderr: Option<UnboundedSender<Bytes>>,
}

/// Open channels of one session, for enumeration and close.
pub(crate) type ChannelTable = Arc<Mutex<HashMap<ChannelId, Weak<ChannelShared>>>>;

pub(crate) struct ChannelShared {
    id: ChannelId,
    kind: ChannelKind,
    state: Mutex<ChannelState>,
    /// Held while a lifecycle transition is made and its event fired, so
    /// that `Opened`, `Closing` and `Closed` are seen in state order.
    lifecycle: Mutex<()>,
    /// Set by the first `close` call, or by a failed open.
    closing: AtomicBool,
    closed: watch::Sender<bool>,
    peer_closed: watch::Sender<bool>,
    local_eof: AtomicBool,
    remote_eof: AtomicBool,
    outgoing: Sender<ChannelMsg>,
    incoming: Mutex<Option<UnboundedReceiver<ChannelMsg>>>,
    setup: Mutex<Vec<ChannelMsg>>,
    senders: Mutex<Option<StreamSenders>>,
    stdout: Mutex<Option<UnboundedReceiver<Bytes>>>,
    stderr: Mutex<Option<UnboundedReceiver<Bytes>>>,
    stdin_taken: AtomicBool,
    exit: watch::Sender<ExitState>,
    listeners: events::Listeners,
    token: CancellationToken,
    extended: Mutex<Option<extended::ExtendedPump>>,
    table: Weak<Mutex<HashMap<ChannelId, Weak<ChannelShared>>>>,
}

impl ChannelShared {
    pub(crate) fn fire(&self, event: ChannelEvent) {
        trace!("channel {}: {:?}", self.id, event);
        self.listeners.fire(self.id, event)
    }

    pub(crate) fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    pub(crate) fn remote_eof(&self) -> bool {
        self.remote_eof.load(Ordering::Acquire)
    }

    pub(crate) fn local_eof(&self) -> bool {
        self.local_eof.load(Ordering::Acquire)
    }

    pub(crate) fn is_writable(&self) -> bool {
        self.state() == ChannelState::Open && !self.local_eof()
    }

    /// Record that EOF went out on stdin. Closes the channel if the peer
    /// is done too.
    pub(crate) fn sent_eof(self: &Arc<Self>) {
        if self.local_eof.swap(true, Ordering::AcqRel) {
            return;
        }
        self.fire(ChannelEvent::EndOfStream {
            stream: StreamKind::Stdin,
        });
        if self.remote_eof() {
            debug!("channel {}: both directions ended", self.id);
            Channel::from(self.clone()).close_in_background();
        }
    }

    fn record_exit(&self, status: Option<u32>, signal: Option<ExitSignal>) {
        self.exit.send_modify(|exit| {
            // First report wins.
            if let (Some(s), None) = (status, exit.status) {
                exit.status = Some(s);
            }
            if let (Some(s), None) = (signal, &exit.signal) {
                exit.signal = Some(s);
            }
        });
    }

    /// Terminal bookkeeping, shared by close and failed opens.
    fn finish(&self, state: ChannelState) {
        *self.state.lock() = state;
        self.token.cancel();
        drop(self.senders.lock().take());
        self.exit.send_modify(|exit| exit.closed = true);
        if let Some(table) = self.table.upgrade() {
            table.lock().remove(&self.id);
        }
    }
}

async fn wait_true(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// A channel within a session.
///
/// Cloning gives another handle to the same channel.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<ChannelShared>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.shared.id)
            .field("kind", &self.shared.kind.name())
            .field("state", &self.shared.state())
            .finish()
    }
}

impl From<Arc<ChannelShared>> for Channel {
    fn from(shared: Arc<ChannelShared>) -> Self {
        Channel { shared }
    }
}

impl Channel {
    pub(crate) fn new(backend: BackendChannel, kind: ChannelKind, table: &ChannelTable) -> Self {
        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ChannelShared {
            id: backend.id,
            kind,
            state: Mutex::new(ChannelState::Created),
            lifecycle: Mutex::new(()),
            closing: AtomicBool::new(false),
            closed: watch::channel(false).0,
            peer_closed: watch::channel(false).0,
            local_eof: AtomicBool::new(false),
            remote_eof: AtomicBool::new(false),
            outgoing: backend.outgoing,
            incoming: Mutex::new(Some(backend.incoming)),
            setup: Mutex::new(Vec::new()),
            senders: Mutex::new(Some(StreamSenders {
                stdout: Some(stdout_tx),
                stderr: Some(stderr_tx),
            })),
            stdout: Mutex::new(Some(stdout_rx)),
            stderr: Mutex::new(Some(stderr_rx)),
            stdin_taken: AtomicBool::new(false),
            exit: watch::channel(ExitState::default()).0,
            listeners: Default::default(),
            token: CancellationToken::new(),
            extended: Mutex::new(None),
            table: Arc::downgrade(table),
        });
        table.lock().insert(shared.id, Arc::downgrade(&shared));
        Channel { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<ChannelShared> {
        &self.shared
    }

    pub fn id(&self) -> ChannelId {
        self.shared.id
    }

    pub fn kind(&self) -> &ChannelKind {
        &self.shared.kind
    }

    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state(), ChannelState::Closed | ChannelState::Failed)
    }

    pub fn has_extended(&self) -> bool {
        self.shared.kind.has_extended()
    }

    pub fn add_listener(&self, listener: Arc<dyn ChannelListener>) -> ListenerId {
        self.shared.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.shared.listeners.remove(id)
    }

    /// Queue an environment variable, sent before the shell or command
    /// starts. Only valid before [`Channel::open`].
    pub fn set_env<N: Into<String>, V: Into<String>>(&self, name: N, value: V) -> Result<(), Error> {
        let state = self.state();
        if state != ChannelState::Created {
            return Err(Error::illegal_state("set_env", state));
        }
        self.shared.setup.lock().push(ChannelMsg::SetEnv {
            want_reply: false,
            variable_name: name.into(),
            variable_value: value.into(),
        });
        Ok(())
    }

    /// Run the kind-specific setup (pty, shell, exec, subsystem) and
    /// start delivering data.
    pub async fn open(&self) -> Result<(), Error> {
        {
            let mut state = self.shared.state.lock();
            if *state != ChannelState::Created {
                return Err(Error::illegal_state("open", *state));
            }
            *state = ChannelState::Opening;
        }
        debug!(
            "opening channel {} ({})",
            self.shared.id,
            self.shared.kind.name()
        );
        let incoming = self.shared.incoming.lock().take();
        let Some(mut incoming) = incoming else {
            self.fail_open().await;
            return Err(Error::ChannelClosed);
        };

        let mut early = VecDeque::new();
        if let Err(e) = self.setup(&mut incoming, &mut early).await {
            if self.shared.closing.load(Ordering::Acquire) {
                debug!("channel {}: closed during setup", self.shared.id);
                return Err(Error::ChannelClosed);
            }
            warn!("channel {}: setup failed: {e}", self.shared.id);
            self.fail_open().await;
            return Err(e);
        }

        {
            let _lifecycle = self.shared.lifecycle.lock();
            {
                let mut state = self.shared.state.lock();
                if *state != ChannelState::Opening {
                    // Closed while the setup was running.
                    return Err(Error::ChannelClosed);
                }
                *state = ChannelState::Open;
            }
            self.shared.fire(ChannelEvent::Opened);
        }

        let senders = self.shared.senders.lock().take();
        if let Some(senders) = senders {
            let shared = self.shared.clone();
            anyssh_util::runtime::spawn(pump(shared, incoming, early, senders));
        }
        Ok(())
    }

    async fn fail_open(&self) {
        if self.shared.closing.swap(true, Ordering::AcqRel) {
            // A close already ran, and sent our close.
            return;
        }
        if self.shared.outgoing.send(ChannelMsg::Close).await.is_err() {
            debug!("channel {}: backend already gone", self.shared.id);
        }
        {
            let _lifecycle = self.shared.lifecycle.lock();
            self.shared.finish(ChannelState::Failed);
        }
        self.shared.closed.send_replace(true);
    }

    async fn setup(
        &self,
        incoming: &mut UnboundedReceiver<ChannelMsg>,
        early: &mut VecDeque<ChannelMsg>,
    ) -> Result<(), Error> {
        let queued = std::mem::take(&mut *self.shared.setup.lock());
        for msg in queued {
            self.shared.outgoing.send(msg).await?;
        }
        match &self.shared.kind {
            ChannelKind::Shell { pty } => {
                if let Some(pty) = pty {
                    self.request(
                        incoming,
                        early,
                        "pty-req",
                        ChannelMsg::RequestPty {
                            want_reply: true,
                            term: pty.term.clone(),
                            col_width: pty.col_width,
                            row_height: pty.row_height,
                            pix_width: pty.pix_width,
                            pix_height: pty.pix_height,
                        },
                    )
                    .await?;
                }
                self.request(
                    incoming,
                    early,
                    "shell",
                    ChannelMsg::RequestShell { want_reply: true },
                )
                .await
            }
            ChannelKind::Command { command } | ChannelKind::Scp { command } => {
                self.request(
                    incoming,
                    early,
                    "exec",
                    ChannelMsg::Exec {
                        want_reply: true,
                        command: command.as_bytes().to_vec(),
                    },
                )
                .await
            }
            ChannelKind::Sftp => {
                self.request(
                    incoming,
                    early,
                    "subsystem",
                    ChannelMsg::RequestSubsystem {
                        want_reply: true,
                        name: "sftp".to_string(),
                    },
                )
                .await
            }
            ChannelKind::Custom { subsystem } => {
                self.request(
                    incoming,
                    early,
                    "subsystem",
                    ChannelMsg::RequestSubsystem {
                        want_reply: true,
                        name: subsystem.clone(),
                    },
                )
                .await
            }
            ChannelKind::Forwarding { .. } => Ok(()),
        }
    }

    /// Send a request and wait for its reply. Anything else arriving
    /// meanwhile is kept for the pump.
    async fn request(
        &self,
        incoming: &mut UnboundedReceiver<ChannelMsg>,
        early: &mut VecDeque<ChannelMsg>,
        name: &'static str,
        msg: ChannelMsg,
    ) -> Result<(), Error> {
        self.shared.outgoing.send(msg).await?;
        loop {
            let received = tokio::select! {
                msg = incoming.recv() => msg,
                _ = self.shared.token.cancelled() => return Err(Error::ChannelClosed),
            };
            match received {
                Some(ChannelMsg::Success) => return Ok(()),
                Some(ChannelMsg::Failure) => return Err(Error::ChannelRequestFailed(name)),
                Some(ChannelMsg::Close) | None => return Err(Error::ChannelClosed),
                Some(msg) => early.push_back(msg),
            }
        }
    }

    fn expect_open(&self, operation: &'static str) -> Result<(), Error> {
        match self.state() {
            ChannelState::Open => Ok(()),
            ChannelState::Closing | ChannelState::Closed | ChannelState::Failed => {
                Err(Error::ChannelClosed)
            }
            state => Err(Error::illegal_state(operation, state)),
        }
    }

    /// The channel's stdout. Can be taken once.
    pub fn take_stdout(&self) -> Result<ChannelReader, Error> {
        let rx = self.shared.stdout.lock().take();
        rx.map(|rx| ChannelReader::new(self.shared.clone(), StreamKind::Stdout, rx))
            .ok_or_else(|| Error::IllegalState {
                operation: "take_stdout",
                state: "stdout already taken".to_string(),
            })
    }

    /// The channel's extended (stderr) stream. Can be taken once, and
    /// not while an extended data handler is set.
    pub fn take_stderr(&self) -> Result<ChannelReader, Error> {
        let rx = self.shared.stderr.lock().take();
        rx.map(|rx| ChannelReader::new(self.shared.clone(), StreamKind::Stderr, rx))
            .ok_or_else(|| Error::IllegalState {
                operation: "take_stderr",
                state: "stderr already taken or handled".to_string(),
            })
    }

    /// The channel's stdin. Can be taken once.
    pub fn take_stdin(&self) -> Result<ChannelWriter, Error> {
        if self.shared.stdin_taken.swap(true, Ordering::AcqRel) {
            return Err(Error::IllegalState {
                operation: "take_stdin",
                state: "stdin already taken".to_string(),
            });
        }
        Ok(ChannelWriter::new(
            self.shared.clone(),
            self.shared.outgoing.clone(),
        ))
    }

    /// Send EOF on stdin without going through a [`ChannelWriter`].
    pub async fn eof(&self) -> Result<(), Error> {
        self.expect_open("eof")?;
        if self.shared.local_eof() {
            return Ok(());
        }
        self.shared.outgoing.send(ChannelMsg::Eof).await?;
        self.shared.sent_eof();
        Ok(())
    }

    pub async fn signal(&self, signal: Sig) -> Result<(), Error> {
        self.expect_open("signal")?;
        self.shared
            .outgoing
            .send(ChannelMsg::Signal { signal })
            .await?;
        Ok(())
    }

    /// Tell the peer the terminal was resized.
    pub async fn window_change(
        &self,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    ) -> Result<(), Error> {
        self.expect_open("window_change")?;
        self.shared
            .outgoing
            .send(ChannelMsg::WindowChange {
                col_width,
                row_height,
                pix_width,
                pix_height,
            })
            .await?;
        Ok(())
    }

    /// The exit status, if the peer has reported it. Never blocks.
    pub fn exit_status(&self) -> Option<u32> {
        self.shared.exit.borrow().status
    }

    pub fn exit_signal(&self) -> Option<ExitSignal> {
        self.shared.exit.borrow().signal.clone()
    }

    /// Wait for the exit status. `None` if the channel closed without one.
    pub async fn wait_exit_status(&self) -> Option<u32> {
        let mut rx = self.shared.exit.subscribe();
        loop {
            {
                let exit = rx.borrow_and_update();
                if exit.status.is_some() || exit.closed {
                    return exit.status;
                }
            }
            if rx.changed().await.is_err() {
                return self.exit_status();
            }
        }
    }

    /// Close the channel.
    ///
    /// Sends EOF if still open, then close, waits briefly for the peer
    /// to close its side, and stops the pumps. `Closing` and `Closed` are
    /// fired once; later or concurrent calls wait for the first one and
    /// return `Ok`. Every step runs even if an earlier one failed: the
    /// first error is returned, the others are logged.
    pub async fn close(&self) -> Result<(), Error> {
        let shared = &self.shared;
        if shared.closing.swap(true, Ordering::AcqRel) {
            wait_true(shared.closed.subscribe()).await;
            return Ok(());
        }
        let previous = {
            let _lifecycle = shared.lifecycle.lock();
            let previous = std::mem::replace(&mut *shared.state.lock(), ChannelState::Closing);
            shared.fire(ChannelEvent::Closing);
            previous
        };
        debug!("closing channel {} (was {:?})", shared.id, previous);

        let mut first_error = None;
        let mut note = |step: &str, e: Error| {
            if first_error.is_none() {
                debug!("channel {}: {step} failed: {e}", shared.id);
                first_error = Some(e);
            } else {
                warn!("channel {}: {step} failed: {e}", shared.id);
            }
        };
        let peer_closed = *shared.peer_closed.borrow();

        if previous == ChannelState::Open
            && !peer_closed
            && !shared.local_eof.swap(true, Ordering::AcqRel)
        {
            if let Err(e) = shared.outgoing.send(ChannelMsg::Eof).await {
                note("eof", e.into());
            }
        }
        if let Err(e) = shared.outgoing.send(ChannelMsg::Close).await {
            if !peer_closed {
                note("close", e.into());
            }
        }
        if previous == ChannelState::Open && !peer_closed {
            let waited =
                tokio::time::timeout(CLOSE_GRACE, wait_true(shared.peer_closed.subscribe())).await;
            if waited.is_err() {
                debug!("channel {}: peer did not confirm close", shared.id);
            }
        }

        {
            let _lifecycle = shared.lifecycle.lock();
            shared.finish(ChannelState::Closed);
            shared.fire(ChannelEvent::Closed);
        }
        shared.closed.send_replace(true);
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub(crate) fn close_in_background(self) {
        anyssh_util::runtime::spawn(async move {
            if let Err(e) = self.close().await {
                debug!("channel {}: implicit close: {e}", self.shared.id);
            }
        });
    }
}

/// Move messages from the backend queue into the stream queues, until
/// the peer closes or the channel is closed locally.
async fn pump(
    shared: Arc<ChannelShared>,
    mut incoming: UnboundedReceiver<ChannelMsg>,
    mut early: VecDeque<ChannelMsg>,
    mut senders: StreamSenders,
) {
    let id = shared.id;
    loop {
        let msg = match early.pop_front() {
            Some(msg) => Some(msg),
            None => tokio::select! {
                biased;
                _ = shared.token.cancelled() => break,
                msg = incoming.recv() => msg,
            },
        };
        match msg {
            Some(ChannelMsg::Data { data }) => {
                if let Some(tx) = senders.stdout.as_ref().filter(|_| !data.is_empty()) {
                    let _ = tx.send(data);
                }
            }
            Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                if let Some(tx) = senders.stderr.as_ref().filter(|_| !data.is_empty()) {
                    let _ = tx.send(data);
                }
            }
            Some(ChannelMsg::ExtendedData { ext, .. }) => {
                debug!("channel {id}: dropping extended data of type {ext}");
            }
            Some(ChannelMsg::Eof) => {
                shared.remote_eof.store(true, Ordering::Release);
                senders.stdout = None;
                senders.stderr = None;
                shared.fire(ChannelEvent::EndOfStream {
                    stream: StreamKind::Stdout,
                });
                if shared.kind.has_extended() {
                    shared.fire(ChannelEvent::EndOfStream {
                        stream: StreamKind::Stderr,
                    });
                }
                if shared.local_eof() {
                    debug!("channel {id}: both directions ended");
                    Channel::from(shared.clone()).close_in_background();
                }
            }
            Some(ChannelMsg::ExitStatus { exit_status }) => {
                debug!("channel {id}: exit status {exit_status}");
                shared.record_exit(Some(exit_status), None);
            }
            Some(ChannelMsg::ExitSignal {
                signal_name,
                core_dumped,
                error_message,
                lang_tag,
            }) => {
                debug!("channel {id}: killed by {signal_name:?}");
                shared.record_exit(
                    None,
                    Some(ExitSignal {
                        signal_name,
                        core_dumped,
                        error_message,
                        lang_tag,
                    }),
                );
            }
            Some(ChannelMsg::Close) | None => {
                debug!("channel {id}: closed by peer");
                shared.remote_eof.store(true, Ordering::Release);
                shared.peer_closed.send_replace(true);
                if !shared.closing.load(Ordering::Acquire) {
                    Channel::from(shared.clone()).close_in_background();
                }
                break;
            }
            Some(msg) => trace!("channel {id}: ignoring {msg:?}"),
        }
    }
    trace!("channel {id}: pump stopped");
}

#[cfg(test)]
mod tests;

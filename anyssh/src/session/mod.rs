// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! The session state machine.
//!
//! ```text
//! Disconnected -> Connecting -> Connected <-> Authenticating -> Authenticated
//!                                   \______________________________/
//!                                                 |
//!                                       Closing -> Closed
//! ```
//!
//! `Failed` is terminal and reachable from every non-terminal state when
//! the connection is lost or the host key is refused.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use ssh_key::PublicKey;
use tokio_util::sync::CancellationToken;

use crate::auth::{AuthOutcome, Authenticator};
use crate::backend::{Backend, Transport};
use crate::channels::{Channel, ChannelKind, ChannelTable, PtyRequest};
use crate::verify::{BannerLog, BannerSink, HostKeyStatus, HostKeyVerifier, KnownKeys};
use crate::{Error, SessionConfig, Target};

mod negotiate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticating,
    Authenticated,
    Closing,
    Closed,
    Failed,
}

/// Read access to a session's state, usable while an operation holds
/// the session.
#[derive(Debug, Clone)]
pub struct StateHandle(Arc<Mutex<SessionState>>);

impl StateHandle {
    fn new() -> Self {
        StateHandle(Arc::new(Mutex::new(SessionState::Disconnected)))
    }

    pub fn get(&self) -> SessionState {
        *self.0.lock()
    }

    fn set(&self, state: SessionState) {
        let previous = std::mem::replace(&mut *self.0.lock(), state);
        if previous != state {
            debug!("session state {previous:?} -> {state:?}");
        }
    }
}

/// A state change in progress. Unless committed, dropping it (e.g. when
/// the operation's future is cancelled) restores the previous state.
struct Transition {
    cell: StateHandle,
    rollback: Option<SessionState>,
}

impl Transition {
    fn begin(cell: &StateHandle, transient: SessionState, rollback: SessionState) -> Self {
        cell.set(transient);
        Transition {
            cell: cell.clone(),
            rollback: Some(rollback),
        }
    }

    fn commit(mut self, state: SessionState) {
        self.rollback = None;
        self.cell.set(state);
    }
}

impl Drop for Transition {
    fn drop(&mut self) {
        if let Some(state) = self.rollback.take() {
            debug!("operation interrupted, rolling back to {state:?}");
            self.cell.set(state);
        }
    }
}

/// Run `fut`, unless `cancel` fires first, in which case `cancelled` is
/// returned.
pub(crate) async fn race<T, F>(cancel: &CancellationToken, cancelled: Error, fut: F) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(cancelled),
        r = fut => r,
    }
}

/// Run `fut` until `deadline`, if there is one.
async fn within<T, F>(deadline: Option<tokio::time::Instant>, fut: F) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>>,
{
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut)
            .await
            .map_err(|_| Error::TimeoutExceeded)?,
        None => fut.await,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BannerState {
    Pending,
    Delivered,
    Unsupported,
}

/// Delivers the server banner to the sink, at most once per session.
pub(crate) struct BannerDelivery {
    sink: Arc<dyn BannerSink>,
    state: BannerState,
}

impl BannerDelivery {
    pub(crate) async fn poll(&mut self, transport: &mut dyn Transport) {
        if self.state != BannerState::Pending {
            return;
        }
        match transport.banner().await {
            Ok(Some(banner)) => {
                debug!("delivering server banner ({} bytes)", banner.len());
                self.state = BannerState::Delivered;
                self.sink.deliver(&banner);
            }
            Ok(None) => {}
            Err(Error::UnsupportedFeature(_)) => {
                debug!("backend does not report banners");
                self.state = BannerState::Unsupported;
            }
            Err(e) => debug!("could not get the banner: {e}"),
        }
    }
}

/// One SSH connection, from connect to close.
///
/// Operations take `&mut self`, so at most one runs at a time. See
/// [`crate::pending::AsyncSession`] for a shareable, non-blocking
/// wrapper.
pub struct Session {
    backend: Arc<dyn Backend>,
    config: Arc<SessionConfig>,
    state: StateHandle,
    transport: Option<Box<dyn Transport>>,
    target: Option<Target>,
    remote_id: Option<String>,
    protocol_version: Option<String>,
    channels: ChannelTable,
    verifier: Arc<dyn HostKeyVerifier>,
    banner: BannerDelivery,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("backend", &self.backend.name())
            .field("state", &self.state())
            .field("target", &self.target)
            .field("remote_id", &self.remote_id)
            .finish()
    }
}

impl Session {
    /// A disconnected session on `backend`.
    ///
    /// Host keys are checked against an empty [`KnownKeys`] table, which
    /// refuses everything: set a real verifier with
    /// [`Session::with_verifier`]. The banner is logged unless another
    /// sink is set.
    pub fn new(backend: Arc<dyn Backend>, config: SessionConfig) -> Self {
        Session {
            backend,
            config: Arc::new(config),
            state: StateHandle::new(),
            transport: None,
            target: None,
            remote_id: None,
            protocol_version: None,
            channels: Arc::new(Mutex::new(HashMap::new())),
            verifier: Arc::new(KnownKeys::new()),
            banner: BannerDelivery {
                sink: Arc::new(BannerLog),
                state: BannerState::Pending,
            },
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn HostKeyVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn with_banner_sink(mut self, sink: Arc<dyn BannerSink>) -> Self {
        self.banner.sink = sink;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn state_handle(&self) -> StateHandle {
        self.state.clone()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn username(&self) -> Option<&str> {
        self.target.as_ref().map(|t| t.user.as_str())
    }

    /// The server's identification string, if the backend reports it.
    pub fn remote_id(&self) -> Option<&str> {
        self.remote_id.as_deref()
    }

    pub fn protocol_version(&self) -> Option<&str> {
        self.protocol_version.as_deref()
    }

    pub fn host_key(&self) -> Option<&PublicKey> {
        self.transport.as_ref().map(|t| t.host_key())
    }

    /// Number of channels created on this session and not closed yet.
    pub fn channel_count(&self) -> usize {
        self.channels
            .lock()
            .values()
            .filter(|c| c.strong_count() > 0)
            .count()
    }

    fn expect_state(&self, operation: &'static str, valid: &[SessionState]) -> Result<(), Error> {
        let state = self.state();
        if valid.contains(&state) {
            Ok(())
        } else {
            Err(Error::illegal_state(operation, state))
        }
    }

    pub async fn connect(&mut self, host: &str, port: u16, username: &str) -> Result<(), Error> {
        self.connect_with_cancel(Target::new(host, port, username), &CancellationToken::new())
            .await
    }

    /// Connect and verify the host key, unless `cancel` fires first.
    ///
    /// A refused host key leaves the session `Failed`. Timeouts,
    /// cancellation and connection errors leave it `Disconnected`, so
    /// that it can be retried.
    pub async fn connect_with_cancel(
        &mut self,
        target: Target,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        self.expect_state("connect", &[SessionState::Disconnected])?;
        let transition = Transition::begin(
            &self.state,
            SessionState::Connecting,
            SessionState::Disconnected,
        );
        info!(
            "connecting to {}:{} as {} ({})",
            target.host,
            target.port,
            target.user,
            self.backend.name()
        );

        // One budget for the transport and the host key check.
        let deadline = self
            .config
            .connection_timeout
            .map(|limit| tokio::time::Instant::now() + limit);
        let connecting = self.backend.connect(&target, &self.config);
        let connected = race(cancel, Error::Cancelled, within(deadline, connecting)).await;
        let mut transport = match connected {
            Ok(transport) => transport,
            Err(e) => {
                warn!("could not connect to {}:{}: {e}", target.host, target.port);
                return Err(e);
            }
        };

        let key = transport.host_key().clone();
        let verifier = self.verifier.clone();
        let verifying = async { Ok(verifier.verify(&target.host, target.port, &key).await) };
        let verdict = race(cancel, Error::Cancelled, within(deadline, verifying)).await;
        let status = match verdict {
            Ok(status) => status,
            Err(e) => {
                warn!("host key of {}:{} not checked: {e}", target.host, target.port);
                if let Err(e) = transport.close().await {
                    debug!("closing transport: {e}");
                }
                return Err(e);
            }
        };
        if status != HostKeyStatus::Valid {
            warn!(
                "host key of {}:{} not accepted ({status:?})",
                target.host, target.port
            );
            if let Err(e) = transport.close().await {
                debug!("closing transport: {e}");
            }
            transition.commit(SessionState::Failed);
            return Err(Error::HostKeyRejected { status });
        }

        self.remote_id = match transport.server_id() {
            Ok(id) => Some(id),
            Err(Error::UnsupportedFeature(_)) => None,
            Err(e) => {
                debug!("server id unavailable: {e}");
                None
            }
        };
        self.protocol_version = match transport.protocol_version() {
            Ok(v) => Some(v),
            Err(Error::UnsupportedFeature(_)) => None,
            Err(e) => {
                debug!("protocol version unavailable: {e}");
                None
            }
        };
        self.transport = Some(transport);
        self.target = Some(target);
        transition.commit(SessionState::Connected);
        info!(
            "connected, server is {}",
            self.remote_id.as_deref().unwrap_or("unknown")
        );
        Ok(())
    }

    /// Authenticate with the given authenticators. `Ok(true)` once the
    /// server accepts the user. `Ok(false)` on failure or partial
    /// success: the session stays `Connected`, and can be authenticated
    /// again, e.g. with a second factor.
    pub async fn authenticate(&mut self, authenticators: &[Authenticator]) -> Result<bool, Error> {
        Ok(self.authenticate_outcome(authenticators).await? == AuthOutcome::Success)
    }

    /// Like [`Session::authenticate`], with the full outcome. Partial
    /// success carries the methods the server wants next.
    pub async fn authenticate_outcome(
        &mut self,
        authenticators: &[Authenticator],
    ) -> Result<AuthOutcome, Error> {
        self.authenticate_with_cancel(authenticators, &CancellationToken::new())
            .await
    }

    /// Authenticate, unless `cancel` fires first. Every prompt and every
    /// server round-trip is interrupted by `cancel`, with
    /// [`Error::AuthenticationCancelled`].
    pub async fn authenticate_with_cancel(
        &mut self,
        authenticators: &[Authenticator],
        cancel: &CancellationToken,
    ) -> Result<AuthOutcome, Error> {
        self.expect_state(
            "authenticate",
            &[SessionState::Connected, SessionState::Authenticating],
        )?;
        let (Some(transport), Some(target)) = (self.transport.as_mut(), self.target.as_ref())
        else {
            return Err(Error::illegal_state("authenticate", self.state.get()));
        };
        let transition = Transition::begin(
            &self.state,
            SessionState::Authenticating,
            SessionState::Connected,
        );

        let result = negotiate::Negotiation {
            transport: transport.as_mut(),
            user: &target.user,
            config: &self.config,
            cancel,
            banner: &mut self.banner,
        }
        .run(authenticators)
        .await;

        match result {
            Ok(AuthOutcome::Success) => {
                self.banner.poll(transport.as_mut()).await;
                transition.commit(SessionState::Authenticated);
                info!("authenticated as {}", target.user);
                Ok(AuthOutcome::Success)
            }
            Ok(outcome) => {
                debug!("authentication not complete: {outcome:?}");
                transition.commit(SessionState::Connected);
                Ok(outcome)
            }
            Err(e) => {
                if e.is_fatal() || transport.is_closed() {
                    error!("connection lost during authentication: {e}");
                    self.release_transport().await;
                    transition.commit(SessionState::Failed);
                } else {
                    debug!("authentication aborted: {e}");
                    transition.commit(SessionState::Connected);
                }
                Err(e)
            }
        }
    }

    /// A new channel of the given kind, not opened yet. Listeners and
    /// environment variables can be set before [`Channel::open`].
    pub async fn channel(&mut self, kind: ChannelKind) -> Result<Channel, Error> {
        self.expect_state("channel", &[SessionState::Authenticated])?;
        let Some(transport) = self.transport.as_mut() else {
            return Err(Error::illegal_state("channel", self.state.get()));
        };
        match transport.open_channel(kind.open_request()).await {
            Ok(backend) => {
                debug!("channel {} created ({})", backend.id, kind.name());
                Ok(Channel::new(backend, kind, &self.channels))
            }
            Err(e) => {
                if e.is_fatal() || transport.is_closed() {
                    error!("connection lost while opening a channel: {e}");
                    self.release_transport().await;
                    self.state.set(SessionState::Failed);
                }
                Err(e)
            }
        }
    }

    /// A channel of the given kind, opened.
    pub async fn open_channel(&mut self, kind: ChannelKind) -> Result<Channel, Error> {
        let channel = self.channel(kind).await?;
        channel.open().await?;
        Ok(channel)
    }

    pub async fn open_shell(&mut self, pty: Option<PtyRequest>) -> Result<Channel, Error> {
        self.open_channel(ChannelKind::Shell { pty }).await
    }

    pub async fn exec<S: Into<String>>(&mut self, command: S) -> Result<Channel, Error> {
        self.open_channel(ChannelKind::Command {
            command: command.into(),
        })
        .await
    }

    pub async fn open_sftp(&mut self) -> Result<Channel, Error> {
        self.open_channel(ChannelKind::Sftp).await
    }

    /// A channel running `command`, e.g. `scp -t /tmp`.
    pub async fn open_scp<S: Into<String>>(&mut self, command: S) -> Result<Channel, Error> {
        self.open_channel(ChannelKind::Scp {
            command: command.into(),
        })
        .await
    }

    /// A `direct-tcpip` tunnel to `host:port`, as seen from the server.
    pub async fn open_forwarding<A: Into<String>, B: Into<String>>(
        &mut self,
        host: A,
        port: u32,
        originator_address: B,
        originator_port: u32,
    ) -> Result<Channel, Error> {
        self.open_channel(ChannelKind::Forwarding {
            host: host.into(),
            port,
            originator_address: originator_address.into(),
            originator_port,
        })
        .await
    }

    pub async fn open_custom<S: Into<String>>(&mut self, subsystem: S) -> Result<Channel, Error> {
        self.open_channel(ChannelKind::Custom {
            subsystem: subsystem.into(),
        })
        .await
    }

    /// Close every channel, then the connection. Channel errors are
    /// logged, not returned. Closing a closed or failed session does
    /// nothing.
    pub async fn close(&mut self) -> Result<(), Error> {
        let state = self.state();
        if matches!(state, SessionState::Closed | SessionState::Failed) {
            return Ok(());
        }
        let transition = Transition::begin(&self.state, SessionState::Closing, state);
        let channels: Vec<Channel> = self
            .channels
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .map(Channel::from)
            .collect();
        for channel in channels {
            if let Err(e) = channel.close().await {
                warn!("closing channel {}: {e}", channel.id());
            }
        }
        let result = match self.transport.take() {
            Some(mut transport) => transport.close().await,
            None => Ok(()),
        };
        transition.commit(SessionState::Closed);
        info!("session closed");
        result
    }

    async fn release_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                debug!("closing transport: {e}");
            }
        }
    }
}

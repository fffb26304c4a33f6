#![deny(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
#![allow(clippy::single_match, clippy::upper_case_acronyms)]
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

//! Provider-agnostic SSH client layer, based on tokio/futures.
//!
//! This crate does not speak the SSH wire protocol itself. Instead, it
//! defines one client contract (connect, authenticate, open channels)
//! and drives any engine implementing [`backend::Backend`] through it:
//!
//! * [`Session`] is the connection state machine. It verifies the host
//!   key, runs the authentication negotiation and hands out channels.
//! * [`Authenticator`]s describe *how* to answer each authentication
//!   method. The negotiation engine matches them against the methods
//!   the server keeps offering, so multi-factor setups (e.g. `publickey`
//!   then `password`) work without caller-side bookkeeping.
//! * [`Channel`] wraps one backend channel: a stdout/stdin/stderr
//!   triple usable as tokio `AsyncRead`/`AsyncWrite`, an exit status,
//!   and lifecycle events.
//! * [`pending::AsyncSession`] and [`pending::AsyncChannel`] spawn the
//!   same operations and return [`pending::PendingOperation`] handles
//!   with bounded waits and cancellation.
//!
//! Backends are looked up by name in an explicit
//! [`backend::BackendRegistry`]. The in-memory backend
//! ([`backend::memory`]) is a scriptable peer for tests; the `russh`
//! cargo feature enables a backend over the russh client engine.
//!
//! ```no_run
//! # async fn run() -> Result<(), anyssh::Error> {
//! use std::sync::Arc;
//! use anyssh::backend::memory::{MemoryBackend, MemoryServer};
//! use anyssh::{AcceptAll, Authenticator, Session, SessionConfig};
//!
//! let server = MemoryServer::builder().user("alice", "secret").build();
//! let mut session = Session::new(Arc::new(MemoryBackend::new(server)), SessionConfig::default())
//!     .with_verifier(Arc::new(AcceptAll));
//! session.connect("localhost", 22, "alice").await?;
//! assert!(session.authenticate(&[Authenticator::password("secret")]).await?);
//! let channel = session.exec("uname").await?;
//! let status = channel.wait_exit_status().await;
//! session.close().await?;
//! # let _ = status;
//! # Ok(())
//! # }
//! ```

use thiserror::Error;

pub mod auth;
pub mod backend;
pub mod channels;
mod config;
pub mod pending;
mod session;
mod verify;

pub use auth::{
    AgentClient, AuthOutcome, AuthResult, Authenticator, Challenge, ChallengeResponder,
    KeyMaterial, KeyProvider, KeyboardInteractiveAuthResponse, LocalAgent, MethodKind, MethodSet,
    PasswordPrompt, Prompt,
};
pub use channels::{
    Channel, ChannelEvent, ChannelId, ChannelKind, ChannelListener, ChannelMsg, ChannelReader,
    ChannelState, ChannelWriter, ExitSignal, ExtendedDataHandler, ListenerId, PtyRequest, Sig,
    StreamKind,
};
pub use config::{Preferred, ProxySettings, SessionConfig, Target};
pub use session::{Session, SessionState, StateHandle};
pub use verify::{AcceptAll, BannerLog, BannerSink, HostKeyStatus, HostKeyVerifier, KnownKeys};

pub use ssh_key::{PrivateKey, PublicKey};

/// Reason for not being able to open a channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ChannelOpenFailure {
    AdministrativelyProhibited = 1,
    ConnectFailed = 2,
    UnknownChannelType = 3,
    ResourceShortage = 4,
    Unknown = 0,
}

impl ChannelOpenFailure {
    pub fn from_u32(x: u32) -> ChannelOpenFailure {
        match x {
            1 => ChannelOpenFailure::AdministrativelyProhibited,
            2 => ChannelOpenFailure::ConnectFailed,
            3 => ChannelOpenFailure::UnknownChannelType,
            4 => ChannelOpenFailure::ResourceShortage,
            _ => ChannelOpenFailure::Unknown,
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// The operation is not valid in the current session or channel state.
    #[error("{operation} is not allowed in state {state}")]
    IllegalState {
        operation: &'static str,
        state: String,
    },

    /// The host key verifier did not accept the server's key.
    #[error("Host key not accepted ({status:?})")]
    HostKeyRejected { status: HostKeyStatus },

    /// A prompt callback declined to answer.
    #[error("Authentication cancelled")]
    AuthenticationCancelled,

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Too many wrong passphrases for an encrypted private key.
    #[error("Authentication aborted after {attempts} failed attempts")]
    AuthenticationAttemptsExceeded { attempts: u32 },

    /// An operation other than authentication was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// Error reported by the backend engine.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    IO(#[from] std::io::Error),

    /// Message sent or received on a closed channel.
    #[error("Channel closed")]
    ChannelClosed,

    /// Server refused to open a channel.
    #[error("Failed to open channel ({0:?})")]
    ChannelOpenFailure(ChannelOpenFailure),

    /// A channel request (pty, exec, shell, subsystem...) was refused.
    #[error("Channel request {0} was rejected by the other party")]
    ChannelRequestFailed(&'static str),

    #[error("Timeout exceeded")]
    TimeoutExceeded,

    /// The backend does not implement this part of the contract.
    #[error("Unsupported by this backend: {0}")]
    UnsupportedFeature(&'static str),

    #[error("No backend registered under {0:?}")]
    NoSuchBackend(String),

    #[error("SshKey: {0}")]
    SshKey(#[from] ssh_key::Error),

    #[error("Signature: {0}")]
    Signature(#[from] signature::Error),

    #[error(transparent)]
    Config(#[from] anyssh_config::Error),

    #[error(transparent)]
    Join(#[from] anyssh_util::runtime::JoinError),

    #[error("Channel send error")]
    SendError,
}

impl Error {
    /// Whether the error means the connection itself is gone, so that the
    /// session cannot continue.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::IO(_) | Error::SendError | Error::HostKeyRejected { .. }
        )
    }

    pub(crate) fn illegal_state(operation: &'static str, state: impl std::fmt::Debug) -> Self {
        Error::IllegalState {
            operation,
            state: format!("{state:?}"),
        }
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::SendError
    }
}

/// Wrap a crate error into an `std::io::Error`, for the `AsyncRead` and
/// `AsyncWrite` implementations.
pub(crate) fn io_error(kind: std::io::ErrorKind, e: Error) -> std::io::Error {
    std::io::Error::new(kind, e)
}

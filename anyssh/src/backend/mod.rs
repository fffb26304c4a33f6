//! The contract between sessions and SSH engines.
//!
//! A [`Backend`] knows how to establish connections; each connection is
//! a [`Transport`] owned by exactly one [`crate::Session`]. Everything
//! the session needs from the engine goes through these two traits, and
//! channels are bridged as a pair of [`ChannelMsg`] queues
//! ([`BackendChannel`]).

use std::sync::Arc;

use async_trait::async_trait;
use ssh_key::{PrivateKey, PublicKey};
use tokio::sync::mpsc::{Sender, UnboundedReceiver};

use crate::auth::{AgentClient, AuthResult, KeyboardInteractiveAuthResponse, MethodSet};
use crate::{ChannelId, ChannelMsg, Error, SessionConfig, Target};

pub mod memory;
mod registry;
#[cfg(feature = "russh")]
pub mod russh;

pub use registry::BackendRegistry;

/// What kind of channel to open at the transport level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOpen {
    /// A `session` channel; shell, exec and subsystems are set up on it
    /// afterwards through [`ChannelMsg`] requests.
    Session,
    DirectTcpip {
        host_to_connect: String,
        port_to_connect: u32,
        originator_address: String,
        originator_port: u32,
    },
}

/// The engine side of one channel.
///
/// `incoming` carries everything the peer sends (data, EOF, exit status,
/// request replies, close). Messages pushed into `outgoing` are sent to
/// the peer.
#[derive(Debug)]
pub struct BackendChannel {
    pub id: ChannelId,
    pub incoming: UnboundedReceiver<ChannelMsg>,
    pub outgoing: Sender<ChannelMsg>,
}

/// An SSH engine.
#[async_trait]
pub trait Backend: Send + Sync {
    /// The name the backend is registered under.
    fn name(&self) -> &str;

    /// Establish the transport: TCP (or proxy) connection, version
    /// exchange and key exchange. Host key verification is left to the
    /// caller, through [`Transport::host_key`].
    async fn connect(
        &self,
        target: &Target,
        config: &SessionConfig,
    ) -> Result<Box<dyn Transport>, Error>;
}

/// One established connection.
#[async_trait]
pub trait Transport: Send {
    /// The key the server proved possession of during key exchange.
    fn host_key(&self) -> &PublicKey;

    /// The server's identification string (`SSH-2.0-...`).
    fn server_id(&self) -> Result<String, Error> {
        Err(Error::UnsupportedFeature("server identification"))
    }

    /// The negotiated protocol version.
    fn protocol_version(&self) -> Result<String, Error> {
        Err(Error::UnsupportedFeature("protocol version"))
    }

    /// Methods the server currently accepts for `user`. Must reflect the
    /// latest server reply: partial successes change this set.
    async fn auth_methods(&mut self, user: &str) -> Result<MethodSet, Error>;

    /// True once the server has accepted the user.
    fn is_authenticated(&self) -> bool;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<AuthResult, Error>;

    /// Authenticate with a private key. Probing the server before
    /// signing is up to the backend.
    async fn auth_publickey(
        &mut self,
        user: &str,
        key: Arc<PrivateKey>,
    ) -> Result<AuthResult, Error>;

    /// Authenticate with `key`, letting `agent` produce the signature.
    async fn auth_agent(
        &mut self,
        user: &str,
        key: &PublicKey,
        agent: Arc<dyn AgentClient>,
    ) -> Result<AuthResult, Error>;

    async fn auth_keyboard_interactive_start(
        &mut self,
        user: &str,
        submethods: &[String],
    ) -> Result<KeyboardInteractiveAuthResponse, Error>;

    async fn auth_keyboard_interactive_respond(
        &mut self,
        responses: Vec<String>,
    ) -> Result<KeyboardInteractiveAuthResponse, Error>;

    /// The pre-authentication banner, if the server has sent one yet.
    async fn banner(&mut self) -> Result<Option<String>, Error> {
        Err(Error::UnsupportedFeature("banner"))
    }

    async fn open_channel(&mut self, open: ChannelOpen) -> Result<BackendChannel, Error>;

    /// True once the connection is gone, e.g. after the peer disconnected.
    fn is_closed(&self) -> bool;

    async fn close(&mut self) -> Result<(), Error>;
}

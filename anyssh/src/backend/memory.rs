//! An in-process SSH peer.
//!
//! [`MemoryServer`] is scripted with a builder: users and their
//! credentials, multi-factor requirements, what commands print, which
//! subsystems exist, and a few ways to misbehave. [`MemoryBackend`]
//! connects sessions to it without any I/O, which makes it the backend
//! of choice for tests of code written against [`crate::Session`].
//!
//! Signatures are real: `publickey` and agent attempts are signed and
//! verified with the offered key.
//!
//! ```
//! use anyssh::backend::memory::{MemoryServer, Reply};
//!
//! let server = MemoryServer::builder()
//!     .user("alice", "secret")
//!     .command(|cmd| match cmd {
//!         "whoami" => Reply::stdout("alice\n", 0),
//!         _ => Reply::output("", "command not found\n", 127),
//!     })
//!     .build();
//! # let _ = server;
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, trace};
use parking_lot::Mutex;
use rand_core::{OsRng, RngCore};
use ssh_key::private::Ed25519PrivateKey;
use ssh_key::public::{Ed25519PublicKey, KeyData};
use ssh_key::{PrivateKey, PublicKey};
use tokio::sync::mpsc::{self, Receiver, UnboundedSender};

use super::{Backend, BackendChannel, ChannelOpen, Transport};
use crate::auth::{
    AgentClient, AuthResult, KeyboardInteractiveAuthResponse, MethodKind, MethodSet, Prompt,
};
use crate::{ChannelId, ChannelMsg, ChannelOpenFailure, Error, SessionConfig, Sig, Target};

/// What the server does with a command, subsystem or tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Print, then exit. No exit status is sent if `exit_status` is `None`.
    Output {
        stdout: Bytes,
        stderr: Bytes,
        exit_status: Option<u32>,
    },
    /// Send stdin back on stdout; exit with `exit_status` at EOF.
    Echo { exit_status: u32 },
    /// Accept and stay silent until the client closes or sends a signal.
    Hang,
    /// Refuse the request.
    Refuse,
}

impl Reply {
    pub fn stdout<S: Into<Bytes>>(stdout: S, exit_status: u32) -> Self {
        Reply::Output {
            stdout: stdout.into(),
            stderr: Bytes::new(),
            exit_status: Some(exit_status),
        }
    }

    pub fn output<A: Into<Bytes>, B: Into<Bytes>>(stdout: A, stderr: B, exit_status: u32) -> Self {
        Reply::Output {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_status: Some(exit_status),
        }
    }
}

/// One round of keyboard-interactive questions, with the expected answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Round {
    pub name: String,
    pub instructions: String,
    pub questions: Vec<(Prompt, String)>,
}

impl Round {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Round {
            name: name.into(),
            instructions: String::new(),
            questions: Vec::new(),
        }
    }

    pub fn question<P: Into<String>, A: Into<String>>(mut self, prompt: P, echo: bool, answer: A) -> Self {
        self.questions.push((
            Prompt {
                prompt: prompt.into(),
                echo,
            },
            answer.into(),
        ));
        self
    }

    fn prompts(&self) -> Vec<Prompt> {
        self.questions.iter().map(|(p, _)| p.clone()).collect()
    }
}

/// Everything the server saw, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Connected { user: String },
    Auth {
        user: String,
        method: MethodKind,
        accepted: bool,
    },
    ChannelOpened { channel: ChannelId },
    Pty { channel: ChannelId, term: String },
    Env {
        channel: ChannelId,
        name: String,
        value: String,
    },
    Shell { channel: ChannelId },
    Exec { channel: ChannelId, command: String },
    Subsystem { channel: ChannelId, name: String },
    Stdin { channel: ChannelId, data: Bytes },
    Eof { channel: ChannelId },
    Signal { channel: ChannelId, signal: Sig },
    WindowChange {
        channel: ChannelId,
        cols: u32,
        rows: u32,
    },
    ChannelClosed { channel: ChannelId },
    Disconnected,
}

type CommandHandler = Arc<dyn Fn(&str) -> Reply + Send + Sync>;
type ForwardHandler = Arc<dyn Fn(&str, u32) -> Reply + Send + Sync>;

#[derive(Debug, Clone, Default)]
struct UserEntry {
    password: Option<String>,
    keys: Vec<PublicKey>,
    rounds: Vec<Round>,
}

impl UserEntry {
    fn has_credentials(&self) -> bool {
        self.password.is_some() || !self.keys.is_empty() || !self.rounds.is_empty()
    }
}

/// The scripted peer. Shared by every connection made through a
/// [`MemoryBackend`].
pub struct MemoryServer {
    host_key: PublicKey,
    server_id: Option<String>,
    banner: Option<String>,
    banner_support: bool,
    users: HashMap<String, UserEntry>,
    required: Vec<MethodKind>,
    commands: Option<CommandHandler>,
    echo_shell: bool,
    subsystems: Option<CommandHandler>,
    forwards: Option<ForwardHandler>,
    reject_channels: bool,
    drop_on_auth: bool,
    refuse_connections: bool,
    connect_delay: Option<Duration>,
    events: Mutex<Vec<ServerEvent>>,
}

impl std::fmt::Debug for MemoryServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryServer")
            .field("server_id", &self.server_id)
            .field("users", &self.users.keys().collect::<Vec<_>>())
            .field("required", &self.required)
            .finish()
    }
}

impl MemoryServer {
    pub fn builder() -> MemoryServerBuilder {
        MemoryServerBuilder {
            server: MemoryServer {
                host_key: random_host_key(),
                server_id: Some("SSH-2.0-anyssh_memory".to_string()),
                banner: None,
                banner_support: true,
                users: HashMap::new(),
                required: Vec::new(),
                commands: None,
                echo_shell: false,
                subsystems: None,
                forwards: None,
                reject_channels: false,
                drop_on_auth: false,
                refuse_connections: false,
                connect_delay: None,
                events: Mutex::new(Vec::new()),
            },
        }
    }

    pub fn host_key(&self) -> &PublicKey {
        &self.host_key
    }

    /// A copy of the events recorded so far.
    pub fn events(&self) -> Vec<ServerEvent> {
        self.events.lock().clone()
    }

    fn record(&self, event: ServerEvent) {
        trace!("memory server: {event:?}");
        self.events.lock().push(event);
    }
}

fn random_host_key() -> PublicKey {
    let mut seed = [0; 32];
    OsRng.fill_bytes(&mut seed);
    let private = Ed25519PrivateKey::from_bytes(&seed);
    let public: Ed25519PublicKey = private.into();
    PublicKey::new(KeyData::Ed25519(public), "anyssh memory server")
}

#[must_use]
pub struct MemoryServerBuilder {
    server: MemoryServer,
}

impl MemoryServerBuilder {
    fn entry(&mut self, user: &str) -> &mut UserEntry {
        self.server.users.entry(user.to_string()).or_default()
    }

    /// Accept `password` for `user`.
    pub fn user(mut self, user: &str, password: &str) -> Self {
        self.entry(user).password = Some(password.to_string());
        self
    }

    /// Accept `key` for `user`.
    pub fn authorized_key(mut self, user: &str, key: PublicKey) -> Self {
        self.entry(user).keys.push(key);
        self
    }

    /// Ask `user` these rounds of questions under `keyboard-interactive`.
    pub fn keyboard_interactive(mut self, user: &str, rounds: Vec<Round>) -> Self {
        self.entry(user).rounds = rounds;
        self
    }

    /// A user the `none` method lets in.
    pub fn anonymous_user(mut self, user: &str) -> Self {
        self.entry(user);
        self
    }

    /// Require every method of `chain`, in order, like OpenSSH's
    /// `AuthenticationMethods`.
    pub fn require(mut self, chain: &[MethodKind]) -> Self {
        self.server.required = chain.to_vec();
        self
    }

    pub fn host_key(mut self, key: PublicKey) -> Self {
        self.server.host_key = key;
        self
    }

    pub fn server_id<S: Into<String>>(mut self, id: S) -> Self {
        self.server.server_id = Some(id.into());
        self
    }

    /// Behave like a backend that cannot report the server's id.
    pub fn without_server_id(mut self) -> Self {
        self.server.server_id = None;
        self
    }

    /// Sent once the client starts authenticating.
    pub fn banner<S: Into<String>>(mut self, banner: S) -> Self {
        self.server.banner = Some(banner.into());
        self
    }

    /// Behave like a backend that cannot report banners.
    pub fn without_banner_support(mut self) -> Self {
        self.server.banner_support = false;
        self
    }

    /// Handle `exec` requests. Without a handler, they are refused.
    pub fn command<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str) -> Reply + Send + Sync + 'static,
    {
        self.server.commands = Some(Arc::new(handler));
        self
    }

    /// Accept shells, echoing their input.
    pub fn echo_shell(mut self) -> Self {
        self.server.echo_shell = true;
        self
    }

    pub fn subsystem<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str) -> Reply + Send + Sync + 'static,
    {
        self.server.subsystems = Some(Arc::new(handler));
        self
    }

    /// Handle `direct-tcpip` tunnels, given the destination host and port.
    pub fn forward<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, u32) -> Reply + Send + Sync + 'static,
    {
        self.server.forwards = Some(Arc::new(handler));
        self
    }

    /// Refuse every channel open.
    pub fn reject_channels(mut self) -> Self {
        self.server.reject_channels = true;
        self
    }

    /// Drop the connection on the first authentication request.
    pub fn drop_on_auth(mut self) -> Self {
        self.server.drop_on_auth = true;
        self
    }

    pub fn refuse_connections(mut self) -> Self {
        self.server.refuse_connections = true;
        self
    }

    /// Take this long to accept connections.
    pub fn connect_delay(mut self, delay: Duration) -> Self {
        self.server.connect_delay = Some(delay);
        self
    }

    pub fn build(self) -> Arc<MemoryServer> {
        Arc::new(self.server)
    }
}

/// Connects sessions to a [`MemoryServer`].
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    name: String,
    server: Arc<MemoryServer>,
}

impl MemoryBackend {
    /// A backend registered as `memory`.
    pub fn new(server: Arc<MemoryServer>) -> Self {
        Self::named("memory", server)
    }

    pub fn named<S: Into<String>>(name: S, server: Arc<MemoryServer>) -> Self {
        MemoryBackend {
            name: name.into(),
            server,
        }
    }

    pub fn server(&self) -> &Arc<MemoryServer> {
        &self.server
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(
        &self,
        target: &Target,
        config: &SessionConfig,
    ) -> Result<Box<dyn Transport>, Error> {
        if let Some(delay) = self.server.connect_delay {
            tokio::time::sleep(delay).await;
        }
        if self.server.refuse_connections {
            return Err(Error::IO(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "memory server refuses connections",
            )));
        }
        if config.proxy.is_some() {
            debug!("memory backend ignores proxy settings");
        }
        self.server.record(ServerEvent::Connected {
            user: target.user.clone(),
        });
        let mut session_id = [0; 32];
        OsRng.fill_bytes(&mut session_id);
        Ok(Box::new(MemoryTransport {
            server: self.server.clone(),
            session_id,
            buffer_size: config.channel_buffer_size.max(1),
            closed: Arc::new(AtomicBool::new(false)),
            authenticated: false,
            none_tried: false,
            auth_started: false,
            passed: Vec::new(),
            kbi: None,
            next_channel: 0,
            tasks: Vec::new(),
        }))
    }
}

struct KbiProgress {
    user: String,
    round: usize,
}

struct MemoryTransport {
    server: Arc<MemoryServer>,
    session_id: [u8; 32],
    buffer_size: usize,
    closed: Arc<AtomicBool>,
    authenticated: bool,
    none_tried: bool,
    auth_started: bool,
    /// Methods of the required chain already passed.
    passed: Vec<MethodKind>,
    kbi: Option<KbiProgress>,
    next_channel: u32,
    tasks: Vec<anyssh_util::runtime::AbortHandle>,
}

impl MemoryTransport {
    fn check_link(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Transport("connection closed".to_string()));
        }
        Ok(())
    }

    fn auth_request(&mut self) -> Result<(), Error> {
        self.check_link()?;
        self.auth_started = true;
        if self.server.drop_on_auth {
            info!("memory server dropping the connection");
            self.disconnect();
            return Err(Error::Transport("connection reset by peer".to_string()));
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.server.record(ServerEvent::Disconnected);
    }

    /// The methods that can make progress for `user` right now.
    fn methods(&self, user: &str) -> MethodSet {
        if !self.server.required.is_empty() {
            return self
                .server
                .required
                .iter()
                .copied()
                .find(|m| !self.passed.contains(m))
                .into_iter()
                .collect();
        }
        match self.server.users.get(user) {
            Some(entry) => {
                let mut methods = MethodSet::empty();
                if !entry.keys.is_empty() {
                    methods.push(MethodKind::PublicKey);
                }
                if !entry.rounds.is_empty() {
                    methods.push(MethodKind::KeyboardInteractive);
                }
                if entry.password.is_some() {
                    methods.push(MethodKind::Password);
                }
                methods
            }
            // Unknown users are offered the usual methods, which all fail.
            None => [
                MethodKind::PublicKey,
                MethodKind::KeyboardInteractive,
                MethodKind::Password,
            ]
            .into_iter()
            .collect(),
        }
    }

    fn allowed(&self, user: &str, method: MethodKind) -> bool {
        self.methods(user).contains(&method)
    }

    fn accept(&mut self, user: &str, method: MethodKind) -> AuthResult {
        self.server.record(ServerEvent::Auth {
            user: user.to_string(),
            method,
            accepted: true,
        });
        self.passed.push(method);
        let remaining = self.methods(user);
        if self.server.required.is_empty() || remaining.is_empty() {
            self.authenticated = true;
            AuthResult::Success
        } else {
            AuthResult::Failure {
                remaining_methods: remaining,
                partial_success: true,
            }
        }
    }

    fn reject(&mut self, user: &str, method: MethodKind) -> AuthResult {
        self.server.record(ServerEvent::Auth {
            user: user.to_string(),
            method,
            accepted: false,
        });
        AuthResult::Failure {
            remaining_methods: self.methods(user),
            partial_success: false,
        }
    }

    fn authorized(&self, user: &str, key: &PublicKey) -> bool {
        self.server
            .users
            .get(user)
            .is_some_and(|e| e.keys.iter().any(|k| k.key_data() == key.key_data()))
    }

    /// The data signed by `publickey` attempts on this connection.
    fn to_sign(&self, user: &str) -> Vec<u8> {
        let mut data = self.session_id.to_vec();
        data.extend_from_slice(user.as_bytes());
        data
    }

    fn round(&self, user: &str, index: usize) -> Option<&Round> {
        self.server.users.get(user)?.rounds.get(index)
    }

    fn info_request(round: &Round) -> KeyboardInteractiveAuthResponse {
        KeyboardInteractiveAuthResponse::InfoRequest {
            name: round.name.clone(),
            instructions: round.instructions.clone(),
            prompts: round.prompts(),
        }
    }
}

fn kbi_response(result: AuthResult) -> KeyboardInteractiveAuthResponse {
    match result {
        AuthResult::Success => KeyboardInteractiveAuthResponse::Success,
        AuthResult::Failure {
            remaining_methods,
            partial_success,
        } => KeyboardInteractiveAuthResponse::Failure {
            remaining_methods,
            partial_success,
        },
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn host_key(&self) -> &PublicKey {
        &self.server.host_key
    }

    fn server_id(&self) -> Result<String, Error> {
        self.server
            .server_id
            .clone()
            .ok_or(Error::UnsupportedFeature("server identification"))
    }

    fn protocol_version(&self) -> Result<String, Error> {
        match self.server.server_id {
            Some(_) => Ok("2.0".to_string()),
            None => Err(Error::UnsupportedFeature("protocol version")),
        }
    }

    async fn auth_methods(&mut self, user: &str) -> Result<MethodSet, Error> {
        self.auth_request()?;
        if !self.none_tried {
            self.none_tried = true;
            let open = self.server.required.is_empty()
                && self
                    .server
                    .users
                    .get(user)
                    .is_some_and(|e| !e.has_credentials());
            self.server.record(ServerEvent::Auth {
                user: user.to_string(),
                method: MethodKind::None,
                accepted: open,
            });
            if open {
                self.authenticated = true;
                return Ok(MethodSet::empty());
            }
        }
        Ok(self.methods(user))
    }

    fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<AuthResult, Error> {
        self.auth_request()?;
        let matches = self
            .server
            .users
            .get(user)
            .and_then(|e| e.password.as_deref())
            .is_some_and(|p| p == password);
        Ok(if matches && self.allowed(user, MethodKind::Password) {
            self.accept(user, MethodKind::Password)
        } else {
            self.reject(user, MethodKind::Password)
        })
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        key: Arc<PrivateKey>,
    ) -> Result<AuthResult, Error> {
        self.auth_request()?;
        if !self.allowed(user, MethodKind::PublicKey) || !self.authorized(user, key.public_key()) {
            return Ok(self.reject(user, MethodKind::PublicKey));
        }
        let data = self.to_sign(user);
        let signature = signature::Signer::try_sign(key.key_data(), &data)?;
        Ok(
            match signature::Verifier::verify(key.public_key(), &data, &signature) {
                Ok(()) => self.accept(user, MethodKind::PublicKey),
                Err(e) => {
                    debug!("bad signature: {e}");
                    self.reject(user, MethodKind::PublicKey)
                }
            },
        )
    }

    async fn auth_agent(
        &mut self,
        user: &str,
        key: &PublicKey,
        agent: Arc<dyn AgentClient>,
    ) -> Result<AuthResult, Error> {
        self.auth_request()?;
        if !self.allowed(user, MethodKind::PublicKey) || !self.authorized(user, key) {
            return Ok(self.reject(user, MethodKind::PublicKey));
        }
        let data = self.to_sign(user);
        let verified = match agent.sign(key, &data).await {
            Ok(signature) => signature::Verifier::verify(key, &data, &signature).is_ok(),
            Err(e) => {
                debug!("agent could not sign: {e}");
                false
            }
        };
        Ok(if verified {
            self.accept(user, MethodKind::PublicKey)
        } else {
            self.reject(user, MethodKind::PublicKey)
        })
    }

    async fn auth_keyboard_interactive_start(
        &mut self,
        user: &str,
        submethods: &[String],
    ) -> Result<KeyboardInteractiveAuthResponse, Error> {
        self.auth_request()?;
        trace!("keyboard-interactive for {user}, submethods {submethods:?}");
        if !self.allowed(user, MethodKind::KeyboardInteractive) {
            return Ok(kbi_response(self.reject(user, MethodKind::KeyboardInteractive)));
        }
        let Some(first) = self.round(user, 0).map(Self::info_request) else {
            return Ok(kbi_response(self.reject(user, MethodKind::KeyboardInteractive)));
        };
        self.kbi = Some(KbiProgress {
            user: user.to_string(),
            round: 0,
        });
        Ok(first)
    }

    async fn auth_keyboard_interactive_respond(
        &mut self,
        responses: Vec<String>,
    ) -> Result<KeyboardInteractiveAuthResponse, Error> {
        self.auth_request()?;
        let Some(progress) = self.kbi.take() else {
            return Err(Error::Transport(
                "keyboard-interactive response without a challenge".to_string(),
            ));
        };
        let user = progress.user;
        let correct = self.round(&user, progress.round).is_some_and(|round| {
            round.questions.len() == responses.len()
                && round
                    .questions
                    .iter()
                    .zip(responses.iter())
                    .all(|((_, expected), given)| expected == given)
        });
        if !correct {
            return Ok(kbi_response(self.reject(&user, MethodKind::KeyboardInteractive)));
        }
        let next = progress.round + 1;
        if let Some(request) = self.round(&user, next).map(Self::info_request) {
            self.kbi = Some(KbiProgress { user, round: next });
            return Ok(request);
        }
        Ok(kbi_response(self.accept(&user, MethodKind::KeyboardInteractive)))
    }

    async fn banner(&mut self) -> Result<Option<String>, Error> {
        if !self.server.banner_support {
            return Err(Error::UnsupportedFeature("banner"));
        }
        Ok(if self.auth_started {
            self.server.banner.clone()
        } else {
            None
        })
    }

    async fn open_channel(&mut self, open: ChannelOpen) -> Result<BackendChannel, Error> {
        self.check_link()?;
        if !self.authenticated {
            return Err(Error::ChannelOpenFailure(
                ChannelOpenFailure::AdministrativelyProhibited,
            ));
        }
        if self.server.reject_channels {
            return Err(Error::ChannelOpenFailure(
                ChannelOpenFailure::AdministrativelyProhibited,
            ));
        }
        let initial = match open {
            ChannelOpen::Session => None,
            ChannelOpen::DirectTcpip {
                host_to_connect,
                port_to_connect,
                ..
            } => match self
                .server
                .forwards
                .as_ref()
                .map(|f| f(&host_to_connect, port_to_connect))
            {
                Some(Reply::Refuse) | None => {
                    return Err(Error::ChannelOpenFailure(ChannelOpenFailure::ConnectFailed))
                }
                Some(reply) => Some(reply),
            },
        };

        let id = ChannelId(self.next_channel);
        self.next_channel += 1;
        let (outgoing, from_client) = mpsc::channel(self.buffer_size);
        let (to_client, incoming) = mpsc::unbounded_channel();
        self.server.record(ServerEvent::ChannelOpened { channel: id });
        let mut peer = PeerChannel {
            server: self.server.clone(),
            id,
            to_client,
            mode: Mode::Idle,
        };
        if let Some(reply) = initial {
            peer.start(reply);
        }
        let task = anyssh_util::runtime::spawn(peer.run(from_client));
        self.tasks.push(task.abort_handle());
        Ok(BackendChannel {
            id,
            incoming,
            outgoing,
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn close(&mut self) -> Result<(), Error> {
        self.disconnect();
        Ok(())
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.disconnect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Waiting for a shell, exec or subsystem request.
    Idle,
    Echo { exit_status: u32 },
    Hang,
    /// We sent close.
    Done,
}

/// The server side of one channel.
struct PeerChannel {
    server: Arc<MemoryServer>,
    id: ChannelId,
    to_client: UnboundedSender<ChannelMsg>,
    mode: Mode,
}

impl PeerChannel {
    fn send(&self, msg: ChannelMsg) {
        if self.to_client.send(msg).is_err() {
            trace!("channel {}: client is gone", self.id);
        }
    }

    fn reply(&self, want_reply: bool, ok: bool) {
        if want_reply {
            self.send(if ok {
                ChannelMsg::Success
            } else {
                ChannelMsg::Failure
            });
        }
    }

    fn start(&mut self, reply: Reply) {
        match reply {
            Reply::Output {
                stdout,
                stderr,
                exit_status,
            } => {
                if !stdout.is_empty() {
                    self.send(ChannelMsg::Data { data: stdout });
                }
                if !stderr.is_empty() {
                    self.send(ChannelMsg::ExtendedData {
                        data: stderr,
                        ext: 1,
                    });
                }
                self.send(ChannelMsg::Eof);
                if let Some(exit_status) = exit_status {
                    self.send(ChannelMsg::ExitStatus { exit_status });
                }
                self.send(ChannelMsg::Close);
                self.mode = Mode::Done;
            }
            Reply::Echo { exit_status } => self.mode = Mode::Echo { exit_status },
            Reply::Hang => self.mode = Mode::Hang,
            Reply::Refuse => {}
        }
    }

    /// Answer a request starting the channel's program.
    fn request(&mut self, want_reply: bool, reply: Option<Reply>) {
        if self.mode != Mode::Idle {
            self.reply(want_reply, false);
            return;
        }
        match reply {
            Some(Reply::Refuse) | None => self.reply(want_reply, false),
            Some(reply) => {
                self.reply(want_reply, true);
                self.start(reply);
            }
        }
    }

    async fn run(mut self, mut from_client: Receiver<ChannelMsg>) {
        let id = self.id;
        while let Some(msg) = from_client.recv().await {
            match msg {
                ChannelMsg::RequestPty {
                    want_reply, term, ..
                } => {
                    self.server.record(ServerEvent::Pty { channel: id, term });
                    self.reply(want_reply, true);
                }
                ChannelMsg::SetEnv {
                    want_reply,
                    variable_name,
                    variable_value,
                } => {
                    self.server.record(ServerEvent::Env {
                        channel: id,
                        name: variable_name,
                        value: variable_value,
                    });
                    self.reply(want_reply, true);
                }
                ChannelMsg::RequestShell { want_reply } => {
                    self.server.record(ServerEvent::Shell { channel: id });
                    let reply = self
                        .server
                        .echo_shell
                        .then_some(Reply::Echo { exit_status: 0 });
                    self.request(want_reply, reply);
                }
                ChannelMsg::Exec {
                    want_reply,
                    command,
                } => {
                    let command = String::from_utf8_lossy(&command).into_owned();
                    let reply = self.server.commands.as_ref().map(|f| f(&command));
                    self.server.record(ServerEvent::Exec {
                        channel: id,
                        command,
                    });
                    self.request(want_reply, reply);
                }
                ChannelMsg::RequestSubsystem { want_reply, name } => {
                    let reply = self.server.subsystems.as_ref().map(|f| f(&name));
                    self.server
                        .record(ServerEvent::Subsystem { channel: id, name });
                    self.request(want_reply, reply);
                }
                ChannelMsg::Data { data } => {
                    self.server.record(ServerEvent::Stdin {
                        channel: id,
                        data: data.clone(),
                    });
                    if let Mode::Echo { .. } = self.mode {
                        self.send(ChannelMsg::Data { data });
                    }
                }
                ChannelMsg::Eof => {
                    self.server.record(ServerEvent::Eof { channel: id });
                    if let Mode::Echo { exit_status } = self.mode {
                        self.send(ChannelMsg::Eof);
                        self.send(ChannelMsg::ExitStatus { exit_status });
                        self.send(ChannelMsg::Close);
                        self.mode = Mode::Done;
                    }
                }
                ChannelMsg::Signal { signal } => {
                    self.server.record(ServerEvent::Signal {
                        channel: id,
                        signal: signal.clone(),
                    });
                    if matches!(self.mode, Mode::Echo { .. } | Mode::Hang) {
                        self.send(ChannelMsg::ExitSignal {
                            signal_name: signal,
                            core_dumped: false,
                            error_message: String::new(),
                            lang_tag: String::new(),
                        });
                        self.send(ChannelMsg::Eof);
                        self.send(ChannelMsg::Close);
                        self.mode = Mode::Done;
                    }
                }
                ChannelMsg::WindowChange {
                    col_width,
                    row_height,
                    ..
                } => self.server.record(ServerEvent::WindowChange {
                    channel: id,
                    cols: col_width,
                    rows: row_height,
                }),
                ChannelMsg::Close => {
                    self.server
                        .record(ServerEvent::ChannelClosed { channel: id });
                    if self.mode != Mode::Done {
                        self.send(ChannelMsg::Close);
                    }
                    return;
                }
                msg => trace!("channel {id}: server ignores {msg:?}"),
            }
        }
    }
}

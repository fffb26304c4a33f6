//! [`Backend`] on the `russh` client engine.
//!
//! The handler accepts every host key and leaves the decision to the
//! session's verifier. Each channel is bridged by one task, moving
//! messages between the russh channel and the [`BackendChannel`] queues.

use std::borrow::Cow;
use std::future::Future;
use std::sync::Arc;

use anyssh_util::runtime::{spawn, AbortHandle};
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use russh::client::{self, Handle};
use russh::keys::PrivateKeyWithHashAlg;
use russh::CryptoVec;
use ssh_key::{HashAlg, PrivateKey, PublicKey};
use tokio::sync::mpsc::{self, Receiver, UnboundedSender};

use super::{Backend, BackendChannel, ChannelOpen, Transport};
use crate::auth::{
    AgentClient, AuthResult, KeyboardInteractiveAuthResponse, MethodKind, MethodSet, Prompt,
};
use crate::{
    ChannelId, ChannelMsg, ChannelOpenFailure, Error, Preferred, ProxySettings, SessionConfig,
    Sig, Target,
};

/// Connects with `russh::client`. Registered as `"russh"`.
#[derive(Debug, Clone)]
pub struct RusshBackend {
    name: String,
}

impl Default for RusshBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RusshBackend {
    pub fn new() -> Self {
        Self::named("russh")
    }

    pub fn named<S: Into<String>>(name: S) -> Self {
        RusshBackend { name: name.into() }
    }
}

fn from_russh(e: russh::Error) -> Error {
    match e {
        russh::Error::IO(e) => Error::IO(e),
        russh::Error::ChannelOpenFailure(reason) => {
            Error::ChannelOpenFailure(ChannelOpenFailure::from_u32(reason as u32))
        }
        e => Error::Transport(e.to_string()),
    }
}

/// Keep the engine's algorithms that are named in `wanted`, in the order
/// of `wanted`. Falls back to the engine's defaults if none is known.
fn pick<T: Clone>(engine: &[T], wanted: &[String], name: impl Fn(&T) -> &str) -> Cow<'static, [T]> {
    let kept: Vec<T> = wanted
        .iter()
        .filter_map(|w| engine.iter().find(|a| name(a) == w.as_str()))
        .cloned()
        .collect();
    if kept.is_empty() {
        warn!("none of {wanted:?} is supported, keeping the defaults");
        Cow::Owned(engine.to_vec())
    } else {
        Cow::Owned(kept)
    }
}

fn preferred(p: &Preferred) -> russh::Preferred {
    let engine = russh::Preferred::DEFAULT;
    russh::Preferred {
        kex: pick(&engine.kex, &p.kex, |n| n.as_ref()),
        key: pick(&engine.key, &p.key, |a| a.as_str()),
        cipher: pick(&engine.cipher, &p.cipher, |n| n.as_ref()),
        mac: pick(&engine.mac, &p.mac, |n| n.as_ref()),
        compression: pick(&engine.compression, &p.compression, |n| n.as_ref()),
    }
}

fn client_config(config: &SessionConfig) -> client::Config {
    client::Config {
        client_id: russh::SshId::Standard(config.client_id.clone()),
        preferred: preferred(&config.preferred),
        inactivity_timeout: None,
        ..Default::default()
    }
}

/// What the handler saw during the connection.
#[derive(Default)]
struct Observed {
    host_key: Option<PublicKey>,
    banner: Option<String>,
}

struct Client {
    observed: Arc<Mutex<Observed>>,
}

impl client::Handler for Client {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        debug!(
            "server presented {}",
            server_public_key.fingerprint(Default::default())
        );
        self.observed.lock().host_key = Some(server_public_key.clone());
        Ok(true)
    }

    async fn auth_banner(
        &mut self,
        banner: &str,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        self.observed.lock().banner = Some(banner.to_string());
        Ok(())
    }
}

#[async_trait]
impl Backend for RusshBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(
        &self,
        target: &Target,
        config: &SessionConfig,
    ) -> Result<Box<dyn Transport>, Error> {
        let observed = Arc::new(Mutex::new(Observed::default()));
        let handler = Client {
            observed: observed.clone(),
        };
        let russh_config = Arc::new(client_config(config));
        let handle = match &config.proxy {
            None => {
                client::connect(russh_config, (target.host.as_str(), target.port), handler)
                    .await
                    .map_err(from_russh)?
            }
            Some(ProxySettings::Command(command)) => {
                info!("connecting through {command:?}");
                let words: Vec<&str> = command.split_whitespace().collect();
                let Some((program, args)) = words.split_first() else {
                    return Err(Error::Transport("empty proxy command".to_string()));
                };
                let stream = anyssh_config::Stream::proxy_command(program, args).await?;
                client::connect_stream(russh_config, stream, handler)
                    .await
                    .map_err(from_russh)?
            }
            Some(ProxySettings::Jump(_)) => return Err(Error::UnsupportedFeature("proxy jump")),
        };

        let host_key = observed.lock().host_key.take();
        let Some(host_key) = host_key else {
            return Err(Error::Transport("no host key received".to_string()));
        };
        Ok(Box::new(RusshTransport {
            handle,
            host_key,
            observed,
            methods: None,
            authenticated: false,
            buffer_size: config.channel_buffer_size,
            bridges: Vec::new(),
        }))
    }
}

struct RusshTransport {
    handle: Handle<Client>,
    host_key: PublicKey,
    observed: Arc<Mutex<Observed>>,
    /// Methods from the latest failure reply; `None` until the `none`
    /// request was made.
    methods: Option<MethodSet>,
    authenticated: bool,
    buffer_size: usize,
    bridges: Vec<AbortHandle>,
}

fn method_set(methods: &russh::MethodSet) -> MethodSet {
    methods
        .iter()
        .filter_map(|m| <&str>::from(m).parse::<MethodKind>().ok())
        .collect()
}

impl RusshTransport {
    fn record(&mut self, result: russh::client::AuthResult) -> AuthResult {
        match result {
            russh::client::AuthResult::Success => {
                self.authenticated = true;
                self.methods = Some(MethodSet::empty());
                AuthResult::Success
            }
            russh::client::AuthResult::Failure {
                remaining_methods,
                partial_success,
            } => {
                let remaining_methods = method_set(&remaining_methods);
                self.methods = Some(remaining_methods.clone());
                AuthResult::Failure {
                    remaining_methods,
                    partial_success,
                }
            }
        }
    }

    fn keyboard_interactive(
        &mut self,
        response: client::KeyboardInteractiveAuthResponse,
    ) -> KeyboardInteractiveAuthResponse {
        match response {
            client::KeyboardInteractiveAuthResponse::Success => {
                self.record(russh::client::AuthResult::Success);
                KeyboardInteractiveAuthResponse::Success
            }
            client::KeyboardInteractiveAuthResponse::Failure {
                remaining_methods,
                partial_success,
            } => {
                let remaining_methods = method_set(&remaining_methods);
                self.methods = Some(remaining_methods.clone());
                KeyboardInteractiveAuthResponse::Failure {
                    remaining_methods,
                    partial_success,
                }
            }
            client::KeyboardInteractiveAuthResponse::InfoRequest {
                name,
                instructions,
                prompts,
            } => KeyboardInteractiveAuthResponse::InfoRequest {
                name,
                instructions,
                prompts: prompts
                    .into_iter()
                    .map(|p| Prompt {
                        prompt: p.prompt,
                        echo: p.echo,
                    })
                    .collect(),
            },
        }
    }
}

#[async_trait]
impl Transport for RusshTransport {
    fn host_key(&self) -> &PublicKey {
        &self.host_key
    }

    fn protocol_version(&self) -> Result<String, Error> {
        Ok("2.0".to_string())
    }

    async fn auth_methods(&mut self, user: &str) -> Result<MethodSet, Error> {
        if let Some(methods) = &self.methods {
            return Ok(methods.clone());
        }
        let result = self
            .handle
            .authenticate_none(user)
            .await
            .map_err(from_russh)?;
        Ok(match self.record(result) {
            AuthResult::Success => MethodSet::empty(),
            AuthResult::Failure {
                remaining_methods, ..
            } => remaining_methods,
        })
    }

    fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<AuthResult, Error> {
        let result = self
            .handle
            .authenticate_password(user, password)
            .await
            .map_err(from_russh)?;
        Ok(self.record(result))
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        key: Arc<PrivateKey>,
    ) -> Result<AuthResult, Error> {
        let hash = self
            .handle
            .best_supported_rsa_hash()
            .await
            .map_err(from_russh)?
            .flatten();
        let result = self
            .handle
            .authenticate_publickey(user, PrivateKeyWithHashAlg::new(key, hash))
            .await
            .map_err(from_russh)?;
        Ok(self.record(result))
    }

    async fn auth_agent(
        &mut self,
        user: &str,
        key: &PublicKey,
        agent: Arc<dyn AgentClient>,
    ) -> Result<AuthResult, Error> {
        let mut signer = AgentSigner { agent };
        let result = self
            .handle
            .authenticate_publickey_with(user, key.clone(), None, &mut signer)
            .await
            .map_err(|e| match e {
                SignError::Send(_) => Error::SendError,
                SignError::Agent(e) => e,
            })?;
        Ok(self.record(result))
    }

    async fn auth_keyboard_interactive_start(
        &mut self,
        user: &str,
        submethods: &[String],
    ) -> Result<KeyboardInteractiveAuthResponse, Error> {
        let submethods = (!submethods.is_empty()).then(|| submethods.join(","));
        let response = self
            .handle
            .authenticate_keyboard_interactive_start(user, submethods)
            .await
            .map_err(from_russh)?;
        Ok(self.keyboard_interactive(response))
    }

    async fn auth_keyboard_interactive_respond(
        &mut self,
        responses: Vec<String>,
    ) -> Result<KeyboardInteractiveAuthResponse, Error> {
        let response = self
            .handle
            .authenticate_keyboard_interactive_respond(responses)
            .await
            .map_err(from_russh)?;
        Ok(self.keyboard_interactive(response))
    }

    async fn banner(&mut self) -> Result<Option<String>, Error> {
        Ok(self.observed.lock().banner.clone())
    }

    async fn open_channel(&mut self, open: ChannelOpen) -> Result<BackendChannel, Error> {
        let channel = match open {
            ChannelOpen::Session => self.handle.channel_open_session().await,
            ChannelOpen::DirectTcpip {
                host_to_connect,
                port_to_connect,
                originator_address,
                originator_port,
            } => {
                self.handle
                    .channel_open_direct_tcpip(
                        host_to_connect,
                        port_to_connect,
                        originator_address,
                        originator_port,
                    )
                    .await
            }
        }
        .map_err(from_russh)?;

        let id = ChannelId::from(u32::from(channel.id()));
        let (to_session, incoming) = mpsc::unbounded_channel();
        let (outgoing, from_session) = mpsc::channel(self.buffer_size);
        let task = spawn(bridge(channel, to_session, from_session));
        self.bridges.retain(|t| !t.is_finished());
        self.bridges.push(task.abort_handle());
        Ok(BackendChannel {
            id,
            incoming,
            outgoing,
        })
    }

    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    async fn close(&mut self) -> Result<(), Error> {
        for bridge in self.bridges.drain(..) {
            bridge.abort();
        }
        if self.handle.is_closed() {
            return Ok(());
        }
        self.handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
            .map_err(from_russh)
    }
}

impl Drop for RusshTransport {
    fn drop(&mut self) {
        for bridge in self.bridges.drain(..) {
            bridge.abort();
        }
    }
}

/// Move messages between one russh channel and its session-side queues,
/// until the peer closes the channel.
async fn bridge(
    mut channel: russh::Channel<client::Msg>,
    to_session: UnboundedSender<ChannelMsg>,
    mut from_session: Receiver<ChannelMsg>,
) {
    let id = channel.id();
    let mut local_closed = false;
    loop {
        tokio::select! {
            msg = channel.wait() => {
                let Some(msg) = msg else {
                    let _ = to_session.send(ChannelMsg::Close);
                    break;
                };
                let Some(msg) = incoming(msg) else {
                    continue;
                };
                let close = msg == ChannelMsg::Close;
                if to_session.send(msg).is_err() || close {
                    break;
                }
            }
            msg = from_session.recv(), if !local_closed => {
                let Some(msg) = msg else {
                    // The session dropped the channel.
                    local_closed = true;
                    if let Err(e) = channel.close().await {
                        debug!("channel {id}: {e}");
                    }
                    continue;
                };
                local_closed = msg == ChannelMsg::Close;
                if let Err(e) = outgoing(&mut channel, msg).await {
                    warn!("channel {id}: {e}");
                }
            }
        }
    }
    trace!("channel {id}: bridge stopped");
}

fn incoming(msg: russh::ChannelMsg) -> Option<ChannelMsg> {
    Some(match msg {
        russh::ChannelMsg::Data { data } => ChannelMsg::Data {
            data: Bytes::copy_from_slice(&data),
        },
        russh::ChannelMsg::ExtendedData { data, ext } => ChannelMsg::ExtendedData {
            data: Bytes::copy_from_slice(&data),
            ext,
        },
        russh::ChannelMsg::Eof => ChannelMsg::Eof,
        russh::ChannelMsg::Close => ChannelMsg::Close,
        russh::ChannelMsg::ExitStatus { exit_status } => ChannelMsg::ExitStatus { exit_status },
        russh::ChannelMsg::ExitSignal {
            signal_name,
            core_dumped,
            error_message,
            lang_tag,
        } => ChannelMsg::ExitSignal {
            signal_name: from_russh_sig(signal_name),
            core_dumped,
            error_message,
            lang_tag,
        },
        russh::ChannelMsg::Success => ChannelMsg::Success,
        russh::ChannelMsg::Failure => ChannelMsg::Failure,
        msg => {
            trace!("ignoring {msg:?}");
            return None;
        }
    })
}

async fn outgoing(
    channel: &mut russh::Channel<client::Msg>,
    msg: ChannelMsg,
) -> Result<(), russh::Error> {
    match msg {
        ChannelMsg::Data { data } => channel.data(&data[..]).await,
        ChannelMsg::ExtendedData { data, ext } => channel.extended_data(ext, &data[..]).await,
        ChannelMsg::Eof => channel.eof().await,
        ChannelMsg::Close => channel.close().await,
        ChannelMsg::RequestPty {
            want_reply,
            term,
            col_width,
            row_height,
            pix_width,
            pix_height,
        } => {
            channel
                .request_pty(
                    want_reply,
                    &term,
                    col_width,
                    row_height,
                    pix_width,
                    pix_height,
                    &[],
                )
                .await
        }
        ChannelMsg::RequestShell { want_reply } => channel.request_shell(want_reply).await,
        ChannelMsg::Exec {
            want_reply,
            command,
        } => channel.exec(want_reply, command).await,
        ChannelMsg::Signal { signal } => channel.signal(to_russh_sig(&signal)).await,
        ChannelMsg::RequestSubsystem { want_reply, name } => {
            channel.request_subsystem(want_reply, name).await
        }
        ChannelMsg::SetEnv {
            want_reply,
            variable_name,
            variable_value,
        } => {
            channel
                .set_env(want_reply, variable_name, variable_value)
                .await
        }
        ChannelMsg::WindowChange {
            col_width,
            row_height,
            pix_width,
            pix_height,
        } => {
            channel
                .window_change(col_width, row_height, pix_width, pix_height)
                .await
        }
        msg => {
            trace!("not sending server-side {msg:?}");
            Ok(())
        }
    }
}

fn to_russh_sig(sig: &Sig) -> russh::Sig {
    match sig {
        Sig::ABRT => russh::Sig::ABRT,
        Sig::ALRM => russh::Sig::ALRM,
        Sig::FPE => russh::Sig::FPE,
        Sig::HUP => russh::Sig::HUP,
        Sig::ILL => russh::Sig::ILL,
        Sig::INT => russh::Sig::INT,
        Sig::KILL => russh::Sig::KILL,
        Sig::PIPE => russh::Sig::PIPE,
        Sig::QUIT => russh::Sig::QUIT,
        Sig::SEGV => russh::Sig::SEGV,
        Sig::TERM => russh::Sig::TERM,
        Sig::USR1 => russh::Sig::USR1,
        Sig::Custom(name) => russh::Sig::Custom(name.clone()),
    }
}

fn from_russh_sig(sig: russh::Sig) -> Sig {
    match sig {
        russh::Sig::ABRT => Sig::ABRT,
        russh::Sig::ALRM => Sig::ALRM,
        russh::Sig::FPE => Sig::FPE,
        russh::Sig::HUP => Sig::HUP,
        russh::Sig::ILL => Sig::ILL,
        russh::Sig::INT => Sig::INT,
        russh::Sig::KILL => Sig::KILL,
        russh::Sig::PIPE => Sig::PIPE,
        russh::Sig::QUIT => Sig::QUIT,
        russh::Sig::SEGV => Sig::SEGV,
        russh::Sig::TERM => Sig::TERM,
        russh::Sig::USR1 => Sig::USR1,
        russh::Sig::Custom(name) => Sig::from_name(&name),
    }
}

#[derive(Debug, thiserror::Error)]
enum SignError {
    #[error(transparent)]
    Send(#[from] russh::SendError),
    #[error(transparent)]
    Agent(#[from] Error),
}

/// Lets an [`AgentClient`] answer russh's signing requests.
struct AgentSigner {
    agent: Arc<dyn AgentClient>,
}

fn put_string(buf: &mut Vec<u8>, s: &[u8]) {
    buf.extend_from_slice(&(s.len() as u32).to_be_bytes());
    buf.extend_from_slice(s);
}

impl russh::Signer for AgentSigner {
    type Error = SignError;

    fn auth_publickey_sign(
        &mut self,
        key: &PublicKey,
        _hash_alg: Option<HashAlg>,
        to_sign: CryptoVec,
    ) -> impl Future<Output = Result<CryptoVec, Self::Error>> + Send {
        let agent = self.agent.clone();
        let key = key.clone();
        async move {
            let signature = agent.sign(&key, &to_sign).await?;
            let mut blob = Vec::new();
            put_string(&mut blob, signature.algorithm().as_str().as_bytes());
            put_string(&mut blob, signature.as_bytes());
            // The signed request is the data followed by the signature.
            let mut signed = to_sign;
            signed.extend(&(blob.len() as u32).to_be_bytes());
            signed.extend(&blob);
            Ok(signed)
        }
    }
}

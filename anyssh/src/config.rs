use std::path::PathBuf;
use std::time::Duration;

use log::debug;

/// Where to connect, and as whom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub user: String,
}

impl Target {
    pub fn new<H: Into<String>, U: Into<String>>(host: H, port: u16, user: U) -> Self {
        Target {
            host: host.into(),
            port,
            user: user.into(),
        }
    }

    /// Host name, port and user of an `ssh_config(5)` entry.
    pub fn from_ssh_config(config: &anyssh_config::Config) -> Self {
        Target {
            host: config.host().to_string(),
            port: config.port(),
            user: config.user(),
        }
    }
}

/// Algorithm names, in order of preference. Backends map them onto what
/// their engine supports and ignore the rest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preferred {
    pub kex: Vec<String>,
    pub key: Vec<String>,
    pub cipher: Vec<String>,
    pub mac: Vec<String>,
    pub compression: Vec<String>,
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl Default for Preferred {
    fn default() -> Self {
        Preferred {
            kex: names(&[
                "curve25519-sha256",
                "curve25519-sha256@libssh.org",
                "ecdh-sha2-nistp256",
                "ecdh-sha2-nistp384",
                "diffie-hellman-group16-sha512",
                "diffie-hellman-group14-sha256",
            ]),
            key: names(&[
                "ssh-ed25519",
                "ecdsa-sha2-nistp256",
                "ecdsa-sha2-nistp384",
                "rsa-sha2-512",
                "rsa-sha2-256",
            ]),
            cipher: names(&[
                "chacha20-poly1305@openssh.com",
                "aes256-gcm@openssh.com",
                "aes128-gcm@openssh.com",
                "aes256-ctr",
                "aes192-ctr",
                "aes128-ctr",
            ]),
            mac: names(&[
                "hmac-sha2-512-etm@openssh.com",
                "hmac-sha2-256-etm@openssh.com",
                "hmac-sha2-512",
                "hmac-sha2-256",
            ]),
            compression: names(&["none", "zlib@openssh.com", "zlib"]),
        }
    }
}

/// How to reach the server when it is not directly reachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxySettings {
    /// A command whose stdin/stdout carry the connection (`ProxyCommand`).
    Command(String),
    /// A jump host (`ProxyJump`), in `[user@]host[:port]` form.
    Jump(String),
}

/// The configuration of a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// The client ID string sent at the beginning of the protocol.
    pub client_id: String,
    /// The preferred algorithms.
    pub preferred: Preferred,
    /// Bound on `connect` as a whole: establishing the transport
    /// (connection and key exchange) and verifying the host key. A
    /// verifier asking a user must answer within it too. Authentication
    /// is not covered. `None` waits forever.
    pub connection_timeout: Option<Duration>,
    /// Wrong passphrases accepted for one encrypted key before the
    /// negotiation is aborted.
    pub max_passphrase_attempts: u32,
    /// Submethods sent with `keyboard-interactive` requests.
    pub keyboard_interactive_submethods: Vec<String>,
    pub proxy: Option<ProxySettings>,
    /// Identity files named by the configuration, for callers building
    /// their [`crate::Authenticator`] list.
    pub identity_files: Vec<PathBuf>,
    /// Capacity of the outgoing queue of each channel.
    pub channel_buffer_size: usize,
}

impl Default for SessionConfig {
    fn default() -> SessionConfig {
        SessionConfig {
            client_id: format!("SSH-2.0-anyssh_{}", env!("CARGO_PKG_VERSION")),
            preferred: Default::default(),
            connection_timeout: None,
            max_passphrase_attempts: 3,
            keyboard_interactive_submethods: Vec::new(),
            proxy: None,
            identity_files: Vec::new(),
            channel_buffer_size: 100,
        }
    }
}

impl SessionConfig {
    /// Settings from an `ssh_config(5)` host entry, on top of the defaults.
    pub fn from_ssh_config(config: &anyssh_config::Config) -> SessionConfig {
        let mut c = SessionConfig::default();
        if let Some(list) = config.kex_algorithms() {
            c.preferred.kex = list.apply(&c.preferred.kex);
        }
        if let Some(list) = config.host_key_algorithms() {
            c.preferred.key = list.apply(&c.preferred.key);
        }
        if let Some(list) = config.ciphers() {
            c.preferred.cipher = list.apply(&c.preferred.cipher);
        }
        if let Some(list) = config.macs() {
            c.preferred.mac = list.apply(&c.preferred.mac);
        }
        match config.compression() {
            Some(true) => c.preferred.compression = names(&["zlib@openssh.com", "zlib", "none"]),
            Some(false) => c.preferred.compression = names(&["none"]),
            None => {}
        }
        if let Some(t) = config.connect_timeout() {
            c.connection_timeout = Some(t);
        }
        if let Some(n) = config.number_of_password_prompts() {
            c.max_passphrase_attempts = n;
        }
        c.proxy = config
            .proxy_command()
            .map(ProxySettings::Command)
            .or_else(|| config.proxy_jump().map(|j| ProxySettings::Jump(j.to_string())));
        c.identity_files = config.identity_files().to_vec();
        debug!("session config for {}: {:?}", config.alias(), c);
        c
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn defaults() {
        let c = SessionConfig::default();
        assert_eq!(c.max_passphrase_attempts, 3);
        assert!(c.client_id.starts_with("SSH-2.0-anyssh_"));
        assert_eq!(c.connection_timeout, None);
        assert_eq!(c.preferred.key.first().map(String::as_str), Some("ssh-ed25519"));
    }

    #[test]
    fn from_ssh_config() {
        let file = r#"
Host build
    Hostname build.internal
    User ci
    Port 2200
    IdentityFile /keys/ci_ed25519
    ProxyJump bastion
    Ciphers -*-ctr
    MACs hmac-sha2-256
    Compression no
    ConnectTimeout 5
    NumberOfPasswordPrompts 1
"#;
        let entry = anyssh_config::parse(file, "build").unwrap();
        let target = Target::from_ssh_config(&entry);
        assert_eq!(target, Target::new("build.internal", 2200, "ci"));

        let c = SessionConfig::from_ssh_config(&entry);
        assert_eq!(
            c.preferred.cipher,
            names(&[
                "chacha20-poly1305@openssh.com",
                "aes256-gcm@openssh.com",
                "aes128-gcm@openssh.com"
            ])
        );
        assert_eq!(c.preferred.mac, names(&["hmac-sha2-256"]));
        assert_eq!(c.preferred.compression, names(&["none"]));
        assert_eq!(c.connection_timeout, Some(Duration::from_secs(5)));
        assert_eq!(c.max_passphrase_attempts, 1);
        assert_eq!(c.proxy, Some(ProxySettings::Jump("bastion".into())));
        assert_eq!(c.identity_files, vec![PathBuf::from("/keys/ci_ed25519")]);
    }
}

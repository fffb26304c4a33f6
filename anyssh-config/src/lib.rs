#![deny(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
//! Reader for OpenSSH client configuration files (`ssh_config(5)`).
//!
//! Only the options that influence how a session is established are
//! interpreted: where to connect, as whom, through which proxy, with
//! which identities, and which algorithms to prefer. Everything else is
//! skipped with a debug log line.
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use globset::Glob;
use log::debug;
use thiserror::*;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Host not found")]
    HostNotFound,
    #[error("No home directory")]
    NoHome,
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

mod proxy;
pub use proxy::*;

/// An algorithm list as written in `Ciphers`, `MACs`, `KexAlgorithms` or
/// `HostKeyAlgorithms`, including the `+`, `-` and `^` modifiers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AlgorithmList {
    Replace(Vec<String>),
    Append(Vec<String>),
    Remove(Vec<String>),
    Prepend(Vec<String>),
}

impl AlgorithmList {
    fn parse(value: &str) -> Self {
        let split = |s: &str| -> Vec<String> {
            s.split(',')
                .map(str::trim)
                .filter(|x| !x.is_empty())
                .map(ToString::to_string)
                .collect()
        };
        if let Some(rest) = value.strip_prefix('+') {
            AlgorithmList::Append(split(rest))
        } else if let Some(rest) = value.strip_prefix('-') {
            AlgorithmList::Remove(split(rest))
        } else if let Some(rest) = value.strip_prefix('^') {
            AlgorithmList::Prepend(split(rest))
        } else {
            AlgorithmList::Replace(split(value))
        }
    }

    /// Resolve the list against the caller's default preference order.
    pub fn apply(&self, defaults: &[String]) -> Vec<String> {
        match self {
            AlgorithmList::Replace(names) => names.clone(),
            AlgorithmList::Append(names) => {
                let mut out = defaults.to_vec();
                for n in names {
                    if !out.contains(n) {
                        out.push(n.clone())
                    }
                }
                out
            }
            AlgorithmList::Remove(names) => defaults
                .iter()
                .filter(|d| !names.iter().any(|n| check_host_against_glob_pattern(d, n)))
                .cloned()
                .collect(),
            AlgorithmList::Prepend(names) => {
                let mut out = names.clone();
                out.extend(defaults.iter().filter(|d| !names.contains(d)).cloned());
                out
            }
        }
    }
}

#[derive(Clone, Debug, Default)]
struct HostConfig {
    /// http://man.openbsd.org/OpenBSD-current/man5/ssh_config.5#User
    user: Option<String>,
    /// http://man.openbsd.org/OpenBSD-current/man5/ssh_config.5#Hostname
    hostname: Option<String>,
    /// http://man.openbsd.org/OpenBSD-current/man5/ssh_config.5#Port
    port: Option<u16>,
    /// http://man.openbsd.org/OpenBSD-current/man5/ssh_config.5#IdentityFile
    identity_file: Option<Vec<PathBuf>>,
    /// http://man.openbsd.org/OpenBSD-current/man5/ssh_config.5#ProxyCommand
    proxy_command: Option<String>,
    /// http://man.openbsd.org/OpenBSD-current/man5/ssh_config.5#ProxyJump
    proxy_jump: Option<String>,
    /// http://man.openbsd.org/OpenBSD-current/man5/ssh_config.5#UserKnownHostsFile
    user_known_hosts_file: Option<PathBuf>,
    /// http://man.openbsd.org/OpenBSD-current/man5/ssh_config.5#StrictHostKeyChecking
    strict_host_key_checking: Option<bool>,
    /// http://man.openbsd.org/OpenBSD-current/man5/ssh_config.5#Ciphers
    ciphers: Option<AlgorithmList>,
    /// http://man.openbsd.org/OpenBSD-current/man5/ssh_config.5#MACs
    macs: Option<AlgorithmList>,
    /// http://man.openbsd.org/OpenBSD-current/man5/ssh_config.5#KexAlgorithms
    kex_algorithms: Option<AlgorithmList>,
    /// http://man.openbsd.org/OpenBSD-current/man5/ssh_config.5#HostKeyAlgorithms
    host_key_algorithms: Option<AlgorithmList>,
    /// http://man.openbsd.org/OpenBSD-current/man5/ssh_config.5#Compression
    compression: Option<bool>,
    /// http://man.openbsd.org/OpenBSD-current/man5/ssh_config.5#ConnectTimeout
    connect_timeout: Option<Duration>,
    /// http://man.openbsd.org/OpenBSD-current/man5/ssh_config.5#NumberOfPasswordPrompts
    number_of_password_prompts: Option<u32>,
    /// http://man.openbsd.org/OpenBSD-current/man5/ssh_config.5#PreferredAuthentications
    preferred_authentications: Option<Vec<String>>,
}

impl HostConfig {
    fn merge(mut left: Self, right: &Self) -> Self {
        macro_rules! clone_if_none {
            ($left:ident, $right:ident, $($field:ident),+) => {
                $(if $left.$field.is_none() {
                    $left.$field = $right.$field.clone();
                })+
            };
        }

        clone_if_none!(
            left,
            right,
            user,
            hostname,
            port,
            proxy_command,
            proxy_jump,
            user_known_hosts_file,
            strict_host_key_checking,
            ciphers,
            macs,
            kex_algorithms,
            host_key_algorithms,
            compression,
            connect_timeout,
            number_of_password_prompts,
            preferred_authentications
        );

        // IdentityFile accumulates across matching entries.
        if let Some(right_identity_files) = right.identity_file.as_deref() {
            if let Some(identity_files) = left.identity_file.as_mut() {
                identity_files.extend(right_identity_files.iter().cloned())
            } else {
                left.identity_file = Some(Vec::from_iter(right_identity_files.iter().cloned()))
            }
        }
        left
    }
}

/// https://man.openbsd.org/OpenBSD-current/man5/ssh_config.5#PATTERNS
#[derive(Clone, Debug)]
struct HostPattern {
    pattern: String,
    negated: bool,
}

#[derive(Clone, Debug, Default)]
struct HostEntry {
    host_patterns: Vec<HostPattern>,
    host_config: HostConfig,
}

impl HostEntry {
    fn matches(&self, host: &str) -> bool {
        let mut matches = false;
        for host_pattern in self.host_patterns.iter() {
            if check_host_against_glob_pattern(host, &host_pattern.pattern) {
                if host_pattern.negated {
                    // A matching negated pattern disqualifies the whole entry.
                    return false;
                }
                matches = true;
            }
        }
        matches
    }
}

struct SshConfig {
    entries: Vec<HostEntry>,
}

impl SshConfig {
    fn query(&self, host: &str) -> HostConfig {
        self.entries
            .iter()
            .filter(|e| e.matches(host))
            .map(|e| &e.host_config)
            .fold(HostConfig::default(), HostConfig::merge)
    }
}

/// Settings resolved for one host alias.
#[derive(Clone, Debug)]
pub struct Config {
    host_name: String,
    user: Option<String>,
    port: Option<u16>,
    host_config: HostConfig,
}

impl Config {
    pub fn default(host: &str) -> Self {
        Self {
            host_name: host.to_string(),
            user: None,
            port: None,
            host_config: HostConfig::default(),
        }
    }

    /// Override the user, e.g. from a `user@host` command line argument.
    pub fn with_user<U: Into<String>>(mut self, user: U) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Override the port, e.g. from a `-p` command line argument.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// The alias the configuration was looked up with.
    pub fn alias(&self) -> &str {
        &self.host_name
    }

    pub fn user(&self) -> String {
        self.user
            .as_deref()
            .or(self.host_config.user.as_deref())
            .map(ToString::to_string)
            .unwrap_or_else(whoami::username)
    }

    pub fn port(&self) -> u16 {
        self.port.or(self.host_config.port).unwrap_or(22)
    }

    pub fn host(&self) -> &str {
        self.host_config
            .hostname
            .as_ref()
            .unwrap_or(&self.host_name)
    }

    pub fn identity_files(&self) -> &[PathBuf] {
        self.host_config.identity_file.as_deref().unwrap_or(&[])
    }

    /// The `ProxyCommand`, with its `%` tokens expanded.
    pub fn proxy_command(&self) -> Option<String> {
        self.host_config
            .proxy_command
            .as_deref()
            .filter(|c| !c.eq_ignore_ascii_case("none"))
            .map(|c| self.expand_tokens(c))
    }

    pub fn proxy_jump(&self) -> Option<&str> {
        self.host_config
            .proxy_jump
            .as_deref()
            .filter(|c| !c.eq_ignore_ascii_case("none"))
    }

    pub fn user_known_hosts_file(&self) -> Option<&Path> {
        self.host_config.user_known_hosts_file.as_deref()
    }

    pub fn strict_host_key_checking(&self) -> Option<bool> {
        self.host_config.strict_host_key_checking
    }

    pub fn ciphers(&self) -> Option<&AlgorithmList> {
        self.host_config.ciphers.as_ref()
    }

    pub fn macs(&self) -> Option<&AlgorithmList> {
        self.host_config.macs.as_ref()
    }

    pub fn kex_algorithms(&self) -> Option<&AlgorithmList> {
        self.host_config.kex_algorithms.as_ref()
    }

    pub fn host_key_algorithms(&self) -> Option<&AlgorithmList> {
        self.host_config.host_key_algorithms.as_ref()
    }

    pub fn compression(&self) -> Option<bool> {
        self.host_config.compression
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.host_config.connect_timeout
    }

    pub fn number_of_password_prompts(&self) -> Option<u32> {
        self.host_config.number_of_password_prompts
    }

    pub fn preferred_authentications(&self) -> Option<&[String]> {
        self.host_config.preferred_authentications.as_deref()
    }

    // Expand the ssh_config(5) percent tokens we know about. Used lazily,
    // right before a ProxyCommand is spawned.
    fn expand_tokens(&self, original: &str) -> String {
        let mut string = original.to_string();
        string = string.replace("%u", &self.user());
        string = string.replace("%h", self.host());
        string = string.replace("%H", self.host());
        string = string.replace("%n", &self.host_name);
        string = string.replace("%p", &format!("{}", self.port()));
        string = string.replace("%%", "%");
        string
    }

    /// Open the byte stream for this host: the proxy command if one is
    /// configured, a plain TCP connection otherwise.
    pub async fn stream(&self) -> Result<Stream, Error> {
        if let Some(proxy_command) = self.proxy_command() {
            let cmd: Vec<&str> = proxy_command.split(' ').collect();
            Stream::proxy_command(cmd.first().unwrap_or(&""), cmd.get(1..).unwrap_or(&[]))
                .await
                .map_err(Into::into)
        } else {
            Stream::tcp_connect((self.host(), self.port()))
                .await
                .map_err(Into::into)
        }
    }
}

fn parse_yes_no(key: &'static str, value: &str) -> Result<bool, Error> {
    match value.to_lowercase().as_str() {
        "yes" | "true" => Ok(true),
        "no" | "false" => Ok(false),
        _ => Err(Error::InvalidValue {
            key,
            value: value.to_string(),
        }),
    }
}

fn parse_ssh_config(contents: &str) -> Result<SshConfig, Error> {
    let mut entries = Vec::new();

    let mut host_patterns: Option<Vec<HostPattern>> = None;
    let mut config = HostConfig::default();
    let mut found_params = false;

    for line in contents.lines() {
        let line = line.trim();
        if line.starts_with('#') {
            continue;
        }
        let tokens = line
            .splitn(2, |c: char| c.is_ascii_whitespace() || c == '=')
            .collect::<Vec<&str>>();
        if tokens.len() == 2 {
            let (key, value) = (tokens.first().unwrap_or(&""), tokens.get(1).unwrap_or(&""));
            let value = value.trim_start_matches(|c: char| c.is_ascii_whitespace() || c == '=');
            let lower = key.to_lowercase();
            if lower != "host" {
                found_params = true;
            }
            match lower.as_str() {
                "host" => {
                    let patterns = value
                        .split_ascii_whitespace()
                        .filter(|pattern| !pattern.is_empty())
                        .map(|pattern| {
                            let (pattern, negated) = match pattern.strip_prefix('!') {
                                Some(pattern) => (pattern, true),
                                None => (pattern, false),
                            };
                            HostPattern {
                                pattern: pattern.to_string(),
                                negated,
                            }
                        })
                        .collect();

                    if let Some(host_patterns) = host_patterns.take() {
                        let host_config = std::mem::take(&mut config);
                        entries.push(HostEntry {
                            host_patterns,
                            host_config,
                        });
                    } else if found_params {
                        return Err(Error::HostNotFound);
                    }

                    found_params = false;
                    host_patterns = Some(patterns);
                }
                "user" => config.user = Some(value.to_string()),
                "hostname" => config.hostname = Some(value.to_string()),
                "port" => {
                    if let Ok(port) = value.parse::<u16>() {
                        config.port = Some(port)
                    }
                }
                "identityfile" => {
                    let identity_file = value.strip_quotes().expand_home()?;
                    if let Some(files) = config.identity_file.as_mut() {
                        files.push(identity_file);
                    } else {
                        config.identity_file = Some(vec![identity_file])
                    }
                }
                "proxycommand" => config.proxy_command = Some(value.to_string()),
                "proxyjump" => config.proxy_jump = Some(value.to_string()),
                "userknownhostsfile" => {
                    config.user_known_hosts_file = Some(value.strip_quotes().expand_home()?);
                }
                "stricthostkeychecking" => match value.to_lowercase().as_str() {
                    "no" | "off" => config.strict_host_key_checking = Some(false),
                    _ => config.strict_host_key_checking = Some(true),
                },
                "ciphers" => config.ciphers = Some(AlgorithmList::parse(value)),
                "macs" => config.macs = Some(AlgorithmList::parse(value)),
                "kexalgorithms" => config.kex_algorithms = Some(AlgorithmList::parse(value)),
                "hostkeyalgorithms" => {
                    config.host_key_algorithms = Some(AlgorithmList::parse(value))
                }
                "compression" => config.compression = Some(parse_yes_no("Compression", value)?),
                "connecttimeout" => {
                    let secs = value.parse::<u64>().map_err(|_| Error::InvalidValue {
                        key: "ConnectTimeout",
                        value: value.to_string(),
                    })?;
                    config.connect_timeout = Some(Duration::from_secs(secs))
                }
                "numberofpasswordprompts" => {
                    let n = value.parse::<u32>().map_err(|_| Error::InvalidValue {
                        key: "NumberOfPasswordPrompts",
                        value: value.to_string(),
                    })?;
                    config.number_of_password_prompts = Some(n)
                }
                "preferredauthentications" => {
                    config.preferred_authentications = Some(
                        value
                            .split(',')
                            .map(str::trim)
                            .filter(|x| !x.is_empty())
                            .map(ToString::to_string)
                            .collect(),
                    )
                }
                key => {
                    debug!("ignoring ssh_config option {key:?}");
                }
            }
        }
    }

    if let Some(host_patterns) = host_patterns.take() {
        let host_config = std::mem::take(&mut config);
        entries.push(HostEntry {
            host_patterns,
            host_config,
        });
    } else if found_params {
        // Options were given outside of any Host block.
        return Err(Error::HostNotFound);
    }

    Ok(SshConfig { entries })
}

pub fn parse(file: &str, host: &str) -> Result<Config, Error> {
    let ssh_config = parse_ssh_config(file)?;
    let host_config = ssh_config.query(host);
    Ok(Config {
        host_name: host.to_string(),
        user: None,
        port: None,
        host_config,
    })
}

pub fn parse_home(host: &str) -> Result<Config, Error> {
    let mut home = if let Some(home) = home::home_dir() {
        home
    } else {
        return Err(Error::NoHome);
    };
    home.push(".ssh");
    home.push("config");
    parse_path(&home, host)
}

pub fn parse_path<P: AsRef<Path>>(path: P, host: &str) -> Result<Config, Error> {
    let mut s = String::new();
    let mut b = std::fs::File::open(path)?;
    b.read_to_string(&mut s)?;
    parse(&s, host)
}

fn check_host_against_glob_pattern(candidate: &str, glob_pattern: &str) -> bool {
    match Glob::new(glob_pattern) {
        Ok(glob) => glob.compile_matcher().is_match(candidate),
        _ => false,
    }
}

trait SshConfigStrExt {
    fn strip_quotes(&self) -> Self;
    fn expand_home(&self) -> Result<PathBuf, Error>;
}

impl SshConfigStrExt for &str {
    fn strip_quotes(&self) -> Self {
        if self.len() > 1
            && ((self.starts_with('\'') && self.ends_with('\''))
                || (self.starts_with('\"') && self.ends_with('\"')))
        {
            #[allow(clippy::indexing_slicing)] // length checked
            &self[1..self.len() - 1]
        } else {
            self
        }
    }

    fn expand_home(&self) -> Result<PathBuf, Error> {
        if self.starts_with("~/") {
            if let Some(mut home) = home::home_dir() {
                home.push(self.split_at(2).1);
                Ok(home)
            } else {
                Err(Error::NoHome)
            }
        } else {
            Ok(self.into())
        }
    }
}

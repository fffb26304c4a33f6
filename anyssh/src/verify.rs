//! Host key verification and banner delivery.

use std::collections::HashMap;

use async_trait::async_trait;
use log::{info, warn};
use ssh_key::PublicKey;

/// Verdict of a [`HostKeyVerifier`]. Only `Valid` lets a connection
/// proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyStatus {
    Valid,
    /// Nothing is known about this host.
    Unknown,
    /// The host is known under a different key.
    Rejected,
}

/// Decides whether the server's host key is acceptable. Called exactly
/// once per connection, right after the key exchange.
#[async_trait]
pub trait HostKeyVerifier: Send + Sync {
    async fn verify(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyStatus;
}

#[async_trait]
impl<F> HostKeyVerifier for F
where
    F: Fn(&str, u16, &PublicKey) -> HostKeyStatus + Send + Sync,
{
    async fn verify(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyStatus {
        self(host, port, key)
    }
}

/// Accepts every key. Only for tests and throwaway hosts.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

#[async_trait]
impl HostKeyVerifier for AcceptAll {
    async fn verify(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyStatus {
        warn!(
            "accepting host key {} for {host}:{port} without verification",
            key.fingerprint(Default::default())
        );
        HostKeyStatus::Valid
    }
}

/// A fixed table of trusted keys per `(host, port)`.
#[derive(Debug, Clone, Default)]
pub struct KnownKeys {
    keys: HashMap<(String, u16), Vec<PublicKey>>,
}

impl KnownKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<H: Into<String>>(mut self, host: H, port: u16, key: PublicKey) -> Self {
        self.keys.entry((host.into(), port)).or_default().push(key);
        self
    }
}

#[async_trait]
impl HostKeyVerifier for KnownKeys {
    async fn verify(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyStatus {
        match self.keys.get(&(host.to_string(), port)) {
            None => HostKeyStatus::Unknown,
            Some(known) if known.iter().any(|k| k.key_data() == key.key_data()) => {
                HostKeyStatus::Valid
            }
            Some(_) => {
                warn!("host key for {host}:{port} does not match the known keys");
                HostKeyStatus::Rejected
            }
        }
    }
}

/// Receives the server's pre-authentication banner.
pub trait BannerSink: Send + Sync {
    fn deliver(&self, banner: &str);
}

impl<F> BannerSink for F
where
    F: Fn(&str) + Send + Sync,
{
    fn deliver(&self, banner: &str) {
        self(banner)
    }
}

/// Logs the banner at info level.
#[derive(Debug, Clone, Copy, Default)]
pub struct BannerLog;

impl BannerSink for BannerLog {
    fn deliver(&self, banner: &str) {
        info!("server banner: {}", banner.trim_end());
    }
}

//! Multi-round authentication: match the methods the server accepts
//! against the caller's authenticators until one succeeds or none is
//! left.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{debug, info, warn};
use ssh_key::PrivateKey;
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

use super::{race, BannerDelivery};
use crate::auth::{
    AgentClient, AuthOutcome, AuthResult, Authenticator, Challenge, ChallengeResponder,
    KeyMaterial, KeyProvider, KeyboardInteractiveAuthResponse, MethodKind, PasswordPrompt,
};
use crate::backend::Transport;
use crate::{Error, SessionConfig};

pub(super) struct Negotiation<'a> {
    pub transport: &'a mut dyn Transport,
    pub user: &'a str,
    pub config: &'a SessionConfig,
    pub cancel: &'a CancellationToken,
    pub banner: &'a mut BannerDelivery,
}

impl Negotiation<'_> {
    /// Drive the negotiation. `Ok` carries the overall outcome, never
    /// `Cancelled`: a cancelled prompt ends the negotiation with
    /// [`Error::AuthenticationCancelled`].
    pub(super) async fn run(mut self, authenticators: &[Authenticator]) -> Result<AuthOutcome, Error> {
        let mut table: HashMap<MethodKind, Vec<(usize, &Authenticator)>> = HashMap::new();
        for (index, authenticator) in authenticators.iter().enumerate() {
            table
                .entry(authenticator.method())
                .or_default()
                .push((index, authenticator));
        }
        let mut tried = HashSet::new();
        let mut partial = false;

        loop {
            let cancel = self.cancel;
            let methods = race(
                cancel,
                Error::AuthenticationCancelled,
                self.transport.auth_methods(self.user),
            )
            .await?;
            if self.transport.is_authenticated() {
                debug!("server accepted {} without credentials", self.user);
                return Ok(AuthOutcome::Success);
            }
            if methods.is_empty() {
                return Err(Error::AuthenticationFailed(
                    "no remaining authentication methods".to_string(),
                ));
            }
            debug!("server accepts {methods}");

            let next = methods
                .iter()
                .filter_map(|method| table.get(method))
                .flatten()
                .find(|(index, _)| !tried.contains(index));
            let Some(&(index, authenticator)) = next else {
                return Ok(if partial {
                    AuthOutcome::PartialSuccess(methods)
                } else {
                    info!("no authenticator left for {} ({methods})", self.user);
                    AuthOutcome::Failure
                });
            };
            tried.insert(index);

            debug!("trying {authenticator:?} for {}", self.user);
            let outcome = match authenticator {
                Authenticator::Password(prompt) => self.password(prompt).await?,
                Authenticator::PublicKey(provider) => self.publickey(provider).await?,
                Authenticator::KeyboardInteractive(responder) => {
                    self.keyboard_interactive(responder).await?
                }
                Authenticator::Agent(agent) => self.agent(agent).await?,
            };
            if outcome != AuthOutcome::Cancelled {
                self.banner.poll(&mut *self.transport).await;
            }

            match outcome {
                AuthOutcome::Success => return Ok(AuthOutcome::Success),
                AuthOutcome::Failure => {
                    debug!("{} rejected", authenticator.method());
                }
                AuthOutcome::PartialSuccess(next) => {
                    debug!("{} accepted, server wants {next}", authenticator.method());
                    partial = true;
                }
                AuthOutcome::Cancelled => {
                    info!("authentication cancelled by the prompt");
                    return Err(Error::AuthenticationCancelled);
                }
            }
        }
    }

    async fn password(&mut self, prompt: &Arc<dyn PasswordPrompt>) -> Result<AuthOutcome, Error> {
        let (user, cancel) = (self.user, self.cancel);
        let secret = race(cancel, Error::AuthenticationCancelled, async {
            Ok::<_, Error>(prompt.password(user).await)
        })
        .await?;
        let Some(secret) = secret.filter(|s| !s.is_empty()).map(Zeroizing::new) else {
            return Ok(AuthOutcome::Cancelled);
        };
        let result = race(
            cancel,
            Error::AuthenticationCancelled,
            self.transport.auth_password(user, &secret),
        )
        .await?;
        Ok(result.into())
    }

    async fn publickey(&mut self, provider: &Arc<dyn KeyProvider>) -> Result<AuthOutcome, Error> {
        let (user, cancel) = (self.user, self.cancel);
        let material = race(cancel, Error::AuthenticationCancelled, async {
            Ok::<_, Error>(provider.key(user).await)
        })
        .await?;
        let key = match material {
            Ok(Some(KeyMaterial::Parsed(key))) => key,
            Ok(Some(KeyMaterial::OpenSsh(text))) => match PrivateKey::from_openssh(text.as_bytes())
            {
                Ok(key) => Arc::new(key),
                Err(e) => {
                    warn!("unusable private key: {e}");
                    return Ok(AuthOutcome::Failure);
                }
            },
            Ok(None) => return Ok(AuthOutcome::Cancelled),
            Err(e) => {
                warn!("could not load the private key: {e}");
                return Ok(AuthOutcome::Failure);
            }
        };

        let key = if key.is_encrypted() {
            // At least one try, whatever the configuration says.
            let attempts = self.config.max_passphrase_attempts.max(1);
            match decrypt(user, cancel, attempts, provider, &key).await? {
                Some(key) => key,
                None => return Ok(AuthOutcome::Cancelled),
            }
        } else {
            key
        };
        debug!("offering {} key", key.algorithm());
        let result = race(
            cancel,
            Error::AuthenticationCancelled,
            self.transport.auth_publickey(user, key),
        )
        .await?;
        Ok(result.into())
    }

    async fn keyboard_interactive(
        &mut self,
        responder: &Arc<dyn ChallengeResponder>,
    ) -> Result<AuthOutcome, Error> {
        let (user, cancel) = (self.user, self.cancel);
        let submethods = &self.config.keyboard_interactive_submethods;
        let mut response = race(
            cancel,
            Error::AuthenticationCancelled,
            self.transport.auth_keyboard_interactive_start(user, submethods),
        )
        .await?;
        loop {
            let answers = match response {
                KeyboardInteractiveAuthResponse::Success => return Ok(AuthOutcome::Success),
                KeyboardInteractiveAuthResponse::Failure {
                    remaining_methods,
                    partial_success,
                } => {
                    return Ok(AuthResult::Failure {
                        remaining_methods,
                        partial_success,
                    }
                    .into())
                }
                KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } if prompts.is_empty() => {
                    Vec::new()
                }
                KeyboardInteractiveAuthResponse::InfoRequest {
                    name,
                    instructions,
                    prompts,
                } => {
                    let challenge = Challenge {
                        name,
                        instructions,
                        prompts,
                    };
                    let answers = race(cancel, Error::AuthenticationCancelled, async {
                        Ok::<_, Error>(responder.respond(&challenge).await)
                    })
                    .await?;
                    let Some(answers) = answers.filter(|a| !a.is_empty()) else {
                        return Ok(AuthOutcome::Cancelled);
                    };
                    if answers.len() != challenge.prompts.len() {
                        warn!(
                            "{} answers for {} prompts, giving up on keyboard-interactive",
                            answers.len(),
                            challenge.prompts.len()
                        );
                        return Ok(AuthOutcome::Failure);
                    }
                    answers
                }
            };
            response = race(
                cancel,
                Error::AuthenticationCancelled,
                self.transport.auth_keyboard_interactive_respond(answers),
            )
            .await?;
        }
    }

    async fn agent(&mut self, agent: &Arc<dyn AgentClient>) -> Result<AuthOutcome, Error> {
        let (user, cancel) = (self.user, self.cancel);
        let identities = race(cancel, Error::AuthenticationCancelled, async {
            Ok::<_, Error>(agent.identities().await)
        })
        .await?;
        let identities = match identities {
            Ok(identities) => identities,
            Err(e) => {
                warn!("could not list agent identities: {e}");
                return Ok(AuthOutcome::Failure);
            }
        };
        if identities.is_empty() {
            debug!("agent holds no keys");
            return Ok(AuthOutcome::Failure);
        }
        for key in identities {
            debug!("offering agent key {}", key.fingerprint(Default::default()));
            let result = race(
                cancel,
                Error::AuthenticationCancelled,
                self.transport.auth_agent(user, &key, agent.clone()),
            )
            .await?;
            match AuthOutcome::from(result) {
                AuthOutcome::Failure => continue,
                outcome => return Ok(outcome),
            }
        }
        Ok(AuthOutcome::Failure)
    }
}

/// Ask for passphrases until one decrypts `key`. `None` if the provider
/// gives up.
async fn decrypt(
    user: &str,
    cancel: &CancellationToken,
    attempts: u32,
    provider: &Arc<dyn KeyProvider>,
    key: &PrivateKey,
) -> Result<Option<Arc<PrivateKey>>, Error> {
    for attempt in 1..=attempts {
        let passphrase = race(cancel, Error::AuthenticationCancelled, async {
            Ok::<_, Error>(provider.passphrase(user, attempt).await)
        })
        .await?;
        let Some(passphrase) = passphrase.filter(|p| !p.is_empty()).map(Zeroizing::new) else {
            return Ok(None);
        };
        match key.decrypt(passphrase.as_bytes()) {
            Ok(key) => return Ok(Some(Arc::new(key))),
            Err(e) => warn!("could not decrypt the key (attempt {attempt}/{attempts}): {e}"),
        }
    }
    Err(Error::AuthenticationAttemptsExceeded { attempts })
}

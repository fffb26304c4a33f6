use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyssh::auth::{KeyMaterial, KeyProvider};
use anyssh::backend::memory::{MemoryBackend, MemoryServer, Round, ServerEvent};
use anyssh::{
    AcceptAll, AuthOutcome, Authenticator, Error, LocalAgent, MethodKind, PrivateKey, Session,
    SessionConfig, SessionState,
};
use async_trait::async_trait;
use rand_core::OsRng;
use ssh_key::{Algorithm, LineEnding};
use zeroize::Zeroizing;

fn key() -> PrivateKey {
    PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap()
}

async fn connected(server: &Arc<MemoryServer>, user: &str) -> Session {
    let mut session = Session::new(
        Arc::new(MemoryBackend::new(server.clone())),
        SessionConfig::default(),
    )
    .with_verifier(Arc::new(AcceptAll));
    session.connect("memory", 22, user).await.unwrap();
    session
}

/// Answers with the passphrases in order, then gives up.
struct Passphrases {
    pem: Zeroizing<String>,
    answers: Vec<&'static str>,
    asked: AtomicU32,
}

#[async_trait]
impl KeyProvider for Passphrases {
    async fn key(&self, _user: &str) -> Result<Option<KeyMaterial>, Error> {
        Ok(Some(KeyMaterial::OpenSsh(self.pem.clone())))
    }

    async fn passphrase(&self, _user: &str, attempt: u32) -> Option<String> {
        self.asked.fetch_add(1, Ordering::SeqCst);
        self.answers
            .get(attempt as usize - 1)
            .map(|p| p.to_string())
    }
}

#[tokio::test]
async fn password() -> Result<(), anyhow::Error> {
    let _ = env_logger::try_init();
    let server = MemoryServer::builder().user("alice", "secret").build();

    let mut session = connected(&server, "alice").await;
    assert!(!session.authenticate(&[Authenticator::password("nope")]).await?);
    assert_eq!(session.state(), SessionState::Connected);
    assert!(session.authenticate(&[Authenticator::password("secret")]).await?);
    assert_eq!(session.state(), SessionState::Authenticated);
    assert_eq!(session.username(), Some("alice"));
    Ok(())
}

#[tokio::test]
async fn authenticators_follow_the_servers_offer() -> Result<(), anyhow::Error> {
    let _ = env_logger::try_init();
    let alice = key();
    let server = MemoryServer::builder()
        .authorized_key("alice", alice.public_key().clone())
        .build();

    // The password is never tried: the server does not offer it.
    let mut session = connected(&server, "alice").await;
    let ok = session
        .authenticate(&[
            Authenticator::password("secret"),
            Authenticator::private_key(alice),
        ])
        .await?;
    assert!(ok);
    let tried: Vec<MethodKind> = server
        .events()
        .into_iter()
        .filter_map(|e| match e {
            ServerEvent::Auth { method, .. } => Some(method),
            _ => None,
        })
        .collect();
    assert_eq!(tried, vec![MethodKind::None, MethodKind::PublicKey]);
    Ok(())
}

#[tokio::test]
async fn publickey_then_password() -> Result<(), anyhow::Error> {
    let _ = env_logger::try_init();
    let alice = key();
    let server = MemoryServer::builder()
        .user("alice", "secret")
        .authorized_key("alice", alice.public_key().clone())
        .require(&[MethodKind::PublicKey, MethodKind::Password])
        .build();

    let mut session = connected(&server, "alice").await;
    let outcome = session
        .authenticate_outcome(&[Authenticator::private_key(alice)])
        .await?;
    let AuthOutcome::PartialSuccess(next) = outcome else {
        panic!("expected a partial success, got {outcome:?}");
    };
    assert!(next.contains(&MethodKind::Password));
    assert_eq!(session.state(), SessionState::Connected);

    assert!(session.authenticate(&[Authenticator::password("secret")]).await?);
    assert_eq!(session.state(), SessionState::Authenticated);
    Ok(())
}

#[tokio::test]
async fn both_factors_in_one_call() -> Result<(), anyhow::Error> {
    let _ = env_logger::try_init();
    let alice = key();
    let server = MemoryServer::builder()
        .user("alice", "secret")
        .authorized_key("alice", alice.public_key().clone())
        .require(&[MethodKind::PublicKey, MethodKind::Password])
        .build();

    let mut session = connected(&server, "alice").await;
    let ok = session
        .authenticate(&[
            Authenticator::password("secret"),
            Authenticator::private_key(alice),
        ])
        .await?;
    assert!(ok);
    Ok(())
}

#[tokio::test]
async fn keyboard_interactive_rounds() -> Result<(), anyhow::Error> {
    let _ = env_logger::try_init();
    let server = MemoryServer::builder()
        .keyboard_interactive(
            "bob",
            vec![
                Round::new("login").question("Password: ", false, "hunter2"),
                Round::new("otp").question("Code: ", true, "123456"),
            ],
        )
        .build();

    let mut session = connected(&server, "bob").await;
    let ok = session
        .authenticate(&[Authenticator::keyboard_interactive(|challenge| {
            let answers = challenge
                .prompts
                .iter()
                .map(|p| match p.prompt.as_str() {
                    "Password: " => "hunter2".to_string(),
                    _ => "123456".to_string(),
                })
                .collect();
            Some(answers)
        })])
        .await?;
    assert!(ok);
    Ok(())
}

#[tokio::test]
async fn declined_challenge_cancels() -> Result<(), anyhow::Error> {
    let _ = env_logger::try_init();
    let server = MemoryServer::builder()
        .keyboard_interactive("bob", vec![Round::new("").question("Password: ", false, "x")])
        .build();

    let mut session = connected(&server, "bob").await;
    let err = session
        .authenticate(&[Authenticator::keyboard_interactive(|_| None)])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AuthenticationCancelled));
    assert_eq!(session.state(), SessionState::Connected);
    Ok(())
}

#[tokio::test]
async fn encrypted_key_retries_the_passphrase() -> Result<(), anyhow::Error> {
    let _ = env_logger::try_init();
    let alice = key();
    let server = MemoryServer::builder()
        .authorized_key("alice", alice.public_key().clone())
        .build();
    let pem = alice.encrypt(&mut OsRng, "right")?.to_openssh(LineEnding::LF)?;

    let provider = Arc::new(Passphrases {
        pem,
        answers: vec!["wrong", "right"],
        asked: AtomicU32::new(0),
    });
    let mut session = connected(&server, "alice").await;
    assert!(
        session
            .authenticate(&[Authenticator::PublicKey(provider.clone())])
            .await?
    );
    assert_eq!(provider.asked.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test]
async fn passphrase_attempts_are_bounded() -> Result<(), anyhow::Error> {
    let _ = env_logger::try_init();
    let alice = key();
    let server = MemoryServer::builder()
        .authorized_key("alice", alice.public_key().clone())
        .build();
    let pem = alice.encrypt(&mut OsRng, "right")?.to_openssh(LineEnding::LF)?;

    let mut session = connected(&server, "alice").await;
    let err = session
        .authenticate(&[Authenticator::openssh_key(pem.to_string(), Some("wrong".into()))])
        .await
        .unwrap_err();
    let attempts = SessionConfig::default().max_passphrase_attempts;
    assert!(matches!(
        err,
        Error::AuthenticationAttemptsExceeded { attempts: a } if a == attempts
    ));
    assert_eq!(session.state(), SessionState::Connected);
    Ok(())
}

#[tokio::test]
async fn zero_passphrase_attempts_still_asks_once() -> Result<(), anyhow::Error> {
    let _ = env_logger::try_init();
    let alice = key();
    let server = MemoryServer::builder()
        .authorized_key("alice", alice.public_key().clone())
        .build();
    let pem = alice.encrypt(&mut OsRng, "right")?.to_openssh(LineEnding::LF)?;
    let config = || SessionConfig {
        max_passphrase_attempts: 0,
        ..Default::default()
    };

    let provider = Arc::new(Passphrases {
        pem: pem.clone(),
        answers: vec!["right"],
        asked: AtomicU32::new(0),
    });
    let mut session = Session::new(Arc::new(MemoryBackend::new(server.clone())), config())
        .with_verifier(Arc::new(AcceptAll));
    session.connect("memory", 22, "alice").await?;
    assert!(
        session
            .authenticate(&[Authenticator::PublicKey(provider.clone())])
            .await?
    );
    assert_eq!(provider.asked.load(Ordering::SeqCst), 1);

    let provider = Arc::new(Passphrases {
        pem,
        answers: vec!["wrong", "right"],
        asked: AtomicU32::new(0),
    });
    let mut session = Session::new(Arc::new(MemoryBackend::new(server.clone())), config())
        .with_verifier(Arc::new(AcceptAll));
    session.connect("memory", 22, "alice").await?;
    let err = session
        .authenticate(&[Authenticator::PublicKey(provider.clone())])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::AuthenticationAttemptsExceeded { attempts: 1 }
    ));
    assert_eq!(provider.asked.load(Ordering::SeqCst), 1);
    assert_eq!(session.state(), SessionState::Connected);
    Ok(())
}

#[tokio::test]
async fn key_file() -> Result<(), anyhow::Error> {
    let _ = env_logger::try_init();
    let alice = key();
    let server = MemoryServer::builder()
        .authorized_key("alice", alice.public_key().clone())
        .build();
    let path = std::env::temp_dir().join(format!("anyssh-key-{}", std::process::id()));
    std::fs::write(&path, alice.to_openssh(LineEnding::LF)?.as_bytes())?;

    let mut session = connected(&server, "alice").await;
    let ok = session
        .authenticate(&[Authenticator::key_file(&path, None)])
        .await;
    std::fs::remove_file(&path)?;
    assert!(ok?);
    Ok(())
}

#[tokio::test]
async fn agent() -> Result<(), anyhow::Error> {
    let _ = env_logger::try_init();
    let stranger = key();
    let alice = key();
    let server = MemoryServer::builder()
        .authorized_key("alice", alice.public_key().clone())
        .build();

    let mut session = connected(&server, "alice").await;
    let agent = LocalAgent::new(vec![stranger, alice]);
    assert!(session.authenticate(&[Authenticator::agent(agent)]).await?);
    Ok(())
}

#[tokio::test]
async fn anonymous_user_needs_no_credentials() -> Result<(), anyhow::Error> {
    let _ = env_logger::try_init();
    let server = MemoryServer::builder().anonymous_user("guest").build();

    let mut session = connected(&server, "guest").await;
    assert!(session.authenticate(&[]).await?);
    Ok(())
}

#[tokio::test]
async fn unknown_user_fails() -> Result<(), anyhow::Error> {
    let _ = env_logger::try_init();
    let server = MemoryServer::builder().user("alice", "secret").build();

    let mut session = connected(&server, "mallory").await;
    assert!(!session.authenticate(&[Authenticator::password("secret")]).await?);
    assert_eq!(session.state(), SessionState::Connected);
    Ok(())
}

use std::sync::Arc;

use anyssh::backend::memory::{MemoryBackend, MemoryServer};
use anyssh::backend::BackendRegistry;
use anyssh::{AcceptAll, Authenticator, Error, SessionConfig, SessionState};

#[tokio::test]
async fn sessions_by_backend_name() -> Result<(), anyhow::Error> {
    let _ = env_logger::try_init();
    let staging = MemoryServer::builder().user("alice", "staging").build();
    let production = MemoryServer::builder().user("alice", "production").build();

    let mut registry = BackendRegistry::new();
    registry
        .register(Arc::new(MemoryBackend::named("staging", staging)))
        .register(Arc::new(MemoryBackend::named("production", production)));
    assert_eq!(registry.names(), vec!["production", "staging"]);
    assert_eq!(registry.default_name(), Some("staging"));

    let mut session = registry
        .session("production", SessionConfig::default())?
        .with_verifier(Arc::new(AcceptAll));
    assert_eq!(session.backend_name(), "production");
    assert_eq!(session.state(), SessionState::Disconnected);
    session.connect("memory", 22, "alice").await?;
    assert!(session.authenticate(&[Authenticator::password("production")]).await?);

    registry.set_default("production")?;
    let session = registry.default_session(SessionConfig::default())?;
    assert_eq!(session.backend_name(), "production");
    Ok(())
}

#[test]
fn unknown_backends() {
    let mut registry = BackendRegistry::new();
    assert!(matches!(
        registry.default_session(SessionConfig::default()),
        Err(Error::NoSuchBackend(_))
    ));
    assert!(matches!(
        registry.session("russh", SessionConfig::default()),
        Err(Error::NoSuchBackend(name)) if name == "russh"
    ));
    assert!(matches!(
        registry.set_default("russh"),
        Err(Error::NoSuchBackend(_))
    ));
    assert!(registry.get("memory").is_err());
}

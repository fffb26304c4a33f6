use std::sync::Arc;
use std::time::Duration;

use anyssh::backend::memory::{MemoryBackend, MemoryServer, Reply};
use anyssh::pending::{AsyncSession, OperationKind};
use anyssh::{AcceptAll, Authenticator, ChannelKind, Error, Session, SessionConfig, SessionState};

const WAIT: Duration = Duration::from_secs(5);

fn facade(server: Arc<MemoryServer>) -> AsyncSession {
    let session = Session::new(Arc::new(MemoryBackend::new(server)), SessionConfig::default())
        .with_verifier(Arc::new(AcceptAll));
    AsyncSession::new(session)
}

async fn logged_in(server: Arc<MemoryServer>) -> Result<AsyncSession, anyhow::Error> {
    let session = facade(server);
    session.connect("memory", 22, "alice").wait(WAIT).await?;
    let ok = session
        .authenticate(vec![Authenticator::password("secret")])
        .wait(WAIT)
        .await?;
    assert!(ok);
    Ok(session)
}

#[tokio::test]
async fn exec_through_the_facade() -> Result<(), anyhow::Error> {
    let _ = env_logger::try_init();
    let server = MemoryServer::builder()
        .user("alice", "secret")
        .command(|cmd| Reply::stdout(format!("{cmd}\n"), 7))
        .build();
    let session = logged_in(server).await?;
    assert_eq!(session.state(), SessionState::Authenticated);

    let channel = session.exec("echo hi").wait(WAIT).await?;
    let out = channel.read_to_end().wait(WAIT).await?;
    assert_eq!(out, b"echo hi\n");
    assert_eq!(channel.wait_exit_status().wait(WAIT).await?, Some(7));

    session.close().wait(WAIT).await?;
    assert_eq!(session.state(), SessionState::Closed);
    Ok(())
}

#[tokio::test]
async fn writes_reach_the_shell_in_order() -> Result<(), anyhow::Error> {
    let _ = env_logger::try_init();
    let server = MemoryServer::builder()
        .user("alice", "secret")
        .echo_shell()
        .build();
    let session = logged_in(server).await?;

    let shell = session
        .open_channel(ChannelKind::Shell { pty: None })
        .wait(WAIT)
        .await?;
    let mut reading = shell.read_to_end();
    let writes: Vec<_> = (0..20).map(|i| shell.write_all(format!("{i},"))).collect();
    let mut eof = shell.shutdown();
    for mut write in writes {
        write.wait(WAIT).await?;
    }
    eof.wait(WAIT).await?;

    let echoed = String::from_utf8(reading.wait(WAIT).await?)?;
    let expected: String = (0..20).map(|i| format!("{i},")).collect();
    assert_eq!(echoed, expected);
    assert_eq!(shell.wait_exit_status().wait(WAIT).await?, Some(0));
    Ok(())
}

#[tokio::test]
async fn busy_session_rejects_a_second_operation() -> Result<(), anyhow::Error> {
    let _ = env_logger::try_init();
    let server = MemoryServer::builder()
        .user("alice", "secret")
        .connect_delay(Duration::from_millis(300))
        .build();
    let session = facade(server);

    let mut connect = session.connect("memory", 22, "alice");
    let mut second = session.connect("memory", 22, "alice");
    assert_eq!(second.kind(), OperationKind::Connect);
    assert!(second.is_done());
    assert!(matches!(
        second.wait(WAIT).await,
        Err(Error::IllegalState { .. })
    ));
    assert!(session.try_session().is_err());

    connect.wait(WAIT).await?;
    assert_eq!(session.state(), SessionState::Connected);
    assert!(session.try_session().is_ok());
    Ok(())
}

#[tokio::test]
async fn wait_timeout_keeps_the_operation() -> Result<(), anyhow::Error> {
    let _ = env_logger::try_init();
    let server = MemoryServer::builder()
        .user("alice", "secret")
        .connect_delay(Duration::from_millis(300))
        .build();
    let session = facade(server);

    let mut connect = session.connect("memory", 22, "alice");
    assert!(matches!(
        connect.wait(Duration::from_millis(10)).await,
        Err(Error::TimeoutExceeded)
    ));
    assert!(!connect.is_done());
    connect.wait(WAIT).await?;
    assert_eq!(session.state(), SessionState::Connected);

    // The result is gone once taken.
    assert!(matches!(
        connect.wait(WAIT).await,
        Err(Error::IllegalState { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn cancel_unblocks_a_prompt() -> Result<(), anyhow::Error> {
    let _ = env_logger::try_init();
    let server = MemoryServer::builder().user("alice", "secret").build();
    let session = facade(server);
    session.connect("memory", 22, "alice").wait(WAIT).await?;

    let mut auth = session.authenticate(vec![Authenticator::password_with(|_| {
        futures::future::pending::<Option<String>>()
    })]);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(session.state(), SessionState::Authenticating);
    auth.cancel();
    assert!(matches!(
        auth.wait(WAIT).await,
        Err(Error::AuthenticationCancelled)
    ));
    assert_eq!(session.state(), SessionState::Connected);

    let ok = session
        .authenticate(vec![Authenticator::password("secret")])
        .wait(WAIT)
        .await?;
    assert!(ok);
    Ok(())
}

#[tokio::test]
async fn cancelled_connect() -> Result<(), anyhow::Error> {
    let _ = env_logger::try_init();
    let server = MemoryServer::builder()
        .user("alice", "secret")
        .connect_delay(Duration::from_secs(30))
        .build();
    let session = facade(server);

    let mut connect = session.connect("memory", 22, "alice");
    connect.cancel();
    assert!(matches!(connect.wait(WAIT).await, Err(Error::Cancelled)));
    assert_eq!(session.state(), SessionState::Disconnected);
    Ok(())
}

#[tokio::test]
async fn channel_open_failure_is_reported() -> Result<(), anyhow::Error> {
    let _ = env_logger::try_init();
    let server = MemoryServer::builder()
        .user("alice", "secret")
        .reject_channels()
        .build();
    let session = logged_in(server).await?;

    let err = session.exec("true").wait(WAIT).await.unwrap_err();
    assert!(matches!(err, Error::ChannelOpenFailure(_)));
    assert_eq!(session.state(), SessionState::Authenticated);
    Ok(())
}

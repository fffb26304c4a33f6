///
/// A session against the in-memory backend, driven through the
/// non-blocking facade. No network access needed:
/// cargo run --example memory_session
///
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use anyssh::backend::memory::{MemoryBackend, MemoryServer, Reply};
use anyssh::pending::AsyncSession;
use anyssh::{AcceptAll, Authenticator, Session, SessionConfig};
use log::info;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .init();

    let server = MemoryServer::builder()
        .user("alice", "secret")
        .banner("Authorized use only.\n")
        .command(|cmd| match cmd {
            "uptime" => Reply::stdout(" 10:00:00 up 42 days\n", 0),
            _ => Reply::output("", format!("{cmd}: command not found\n"), 127),
        })
        .build();

    let session = Session::new(Arc::new(MemoryBackend::new(server)), SessionConfig::default())
        .with_verifier(Arc::new(AcceptAll));
    let session = AsyncSession::new(session);

    session.connect("memory", 22, "alice").wait(WAIT).await?;
    let ok = session
        .authenticate(vec![Authenticator::password("secret")])
        .wait(WAIT)
        .await?;
    info!("authenticated: {ok}");

    for command in ["uptime", "frobnicate"] {
        let channel = session.exec(command).wait(WAIT).await?;
        let out = channel.read_to_end().wait(WAIT).await?;
        let status = channel.wait_exit_status().wait(WAIT).await?;
        println!("{command}: {:?} (exit {status:?})", String::from_utf8_lossy(&out));
    }

    session.close().wait(WAIT).await?;
    Ok(())
}

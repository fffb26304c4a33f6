///
/// Run this example with:
/// cargo run --features russh --example exec_simple -- -k <private key path> <host> <command>
///
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use anyssh::backend::russh::RusshBackend;
use anyssh::backend::BackendRegistry;
use anyssh::{AcceptAll, Authenticator, SessionConfig};
use clap::Parser;
use log::info;
use tokio::io::AsyncWriteExt;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .init();

    let cli = Cli::parse();

    let mut registry = BackendRegistry::new();
    registry.register(Arc::new(RusshBackend::new()));

    // No known_hosts handling here: any host key is accepted.
    let mut session = registry
        .default_session(SessionConfig::default())?
        .with_verifier(Arc::new(AcceptAll));

    info!("Connecting to {}:{}", cli.host, cli.port);
    session
        .connect(
            &cli.host,
            cli.port,
            &cli.username.unwrap_or("root".to_string()),
        )
        .await?;

    let mut authenticators = vec![Authenticator::key_file(cli.private_key, None)];
    if let Ok(password) = std::env::var("SSH_PASSWORD") {
        authenticators.push(Authenticator::password(password));
    }
    if !session.authenticate(&authenticators).await? {
        anyhow::bail!("Authentication failed");
    }

    // arguments are escaped manually since the SSH protocol doesn't support quoting
    let command = cli
        .command
        .into_iter()
        .map(|x| shell_escape::escape(x.into()))
        .collect::<Vec<_>>()
        .join(" ");
    let channel = session.exec(command).await?;

    let mut out = channel.take_stdout()?;
    tokio::io::copy(&mut out, &mut tokio::io::stdout()).await?;
    tokio::io::stdout().flush().await?;

    println!("Exitcode: {:?}", channel.wait_exit_status().await);
    session.close().await?;
    Ok(())
}

#[derive(clap::Parser)]
#[clap(trailing_var_arg = true)]
pub struct Cli {
    #[clap(index = 1)]
    host: String,

    #[clap(long, short, default_value_t = 22)]
    port: u16,

    #[clap(long, short)]
    username: Option<String>,

    #[clap(long, short = 'k')]
    private_key: PathBuf,

    #[clap(index = 2, required = true)]
    command: Vec<String>,
}

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use portal_transport::config::DEFAULT_RENDEZVOUS_URL;
use portal_transport::{archive, PortalConfig, Receiver, Sender};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

mod progress;

const EVENT_QUEUE: usize = 256;

#[derive(Parser)]
#[command(name = "portal")]
#[command(about = "Send files and folders to another computer over a short password", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Rendezvous server URL
    #[arg(long, global = true, env = "PORTAL_RENDEZVOUS", default_value = DEFAULT_RENDEZVOUS_URL)]
    rendezvous: String,

    /// Never attempt a direct connection
    #[arg(long, global = true)]
    relay_only: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send files and folders
    Send {
        /// Files and folders to send
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Receive files and folders
    Receive {
        /// Password shown by the sender
        password: String,
        /// Directory to save into
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },
    /// Run a rendezvous server
    Serve {
        /// Address to listen on
        #[arg(long, env = "PORTAL_ADDR", default_value = "0.0.0.0:8080")]
        addr: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();

    let mut config = PortalConfig::new(cli.rendezvous);
    if cli.relay_only {
        config = config.relay_only();
    }

    match cli.command {
        Commands::Send { paths } => send(config, paths).await,
        Commands::Receive { password, output } => receive(config, &password, &output).await,
        Commands::Serve { addr } => serve(addr).await,
    }
}

async fn send(config: PortalConfig, paths: Vec<PathBuf>) -> anyhow::Result<()> {
    let payload = archive::pack(paths).await?;

    let (tx, rx) = mpsc::channel(EVENT_QUEUE);
    let ui = tokio::spawn(progress::render(rx));

    let result = Sender::new(config).with_events(tx).send(payload).await;
    let _ = ui.await;

    let outcome = result?;
    println!(
        "Sent {} ({} bytes, {}) in {:.1?}",
        outcome.name, outcome.bytes, outcome.connection, outcome.elapsed
    );
    Ok(())
}

async fn receive(config: PortalConfig, password: &str, output: &Path) -> anyhow::Result<()> {
    if !output.is_dir() {
        bail!("{} is not a directory", output.display());
    }

    // Anonymous, so an aborted download leaves nothing behind
    let part = tempfile::tempfile().context("failed to create download buffer")?;
    let mut file = tokio::fs::File::from_std(part);

    let (tx, rx) = mpsc::channel(EVENT_QUEUE);
    let ui = tokio::spawn(progress::render(rx));

    let result = Receiver::new(config)
        .with_events(tx)
        .receive(password, &mut file)
        .await;
    let _ = ui.await;
    let outcome = result?;

    file.flush().await?;
    let created = archive::unpack(file.into_std().await, output.to_path_buf())
        .await
        .with_context(|| format!("failed to unpack into {}", output.display()))?;

    println!(
        "Received {} ({} bytes, {}) in {:.1?}",
        outcome.name, outcome.bytes, outcome.connection, outcome.elapsed
    );
    for path in created {
        println!("  {}", path.display());
    }
    Ok(())
}

async fn serve(addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    portal_server::run_server(listener).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from(["portal", "receive", "7-tiger-lamp-orbit", "-o", "/tmp"])
            .unwrap();
        match cli.command {
            Commands::Receive { password, output } => {
                assert_eq!(password, "7-tiger-lamp-orbit");
                assert_eq!(output, PathBuf::from("/tmp"));
            }
            _ => panic!("expected receive"),
        }
    }

    #[test]
    fn test_cli_send_takes_several_paths() {
        let cli = Cli::try_parse_from(["portal", "send", "photos", "notes.txt"]).unwrap();
        match cli.command {
            Commands::Send { paths } => {
                assert_eq!(paths, vec![PathBuf::from("photos"), PathBuf::from("notes.txt")]);
            }
            _ => panic!("expected send"),
        }

        assert!(Cli::try_parse_from(["portal", "send"]).is_err());
    }
}

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use portal_server::{run_server_with, ServerConfig};
use tokio::net::TcpListener;

/// Portal rendezvous server.
#[derive(Parser, Debug)]
#[command(name = "portal-server", version, about)]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "PORTAL_ADDR", default_value = "0.0.0.0:8080")]
    addr: SocketAddr,

    /// Seconds an unpaired sender may wait.
    #[arg(long, default_value_t = 3600)]
    session_ttl: u64,

    /// Seconds a paired session may sit silent before the relay starts.
    #[arg(long, default_value_t = 60)]
    control_idle: u64,

    /// Concurrent connections allowed per client IP.
    #[arg(long, default_value_t = 16)]
    max_conn_per_ip: usize,

    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let listener = TcpListener::bind(args.addr)
        .await
        .with_context(|| format!("failed to bind {}", args.addr))?;

    let config = ServerConfig::default()
        .with_session_ttl(Duration::from_secs(args.session_ttl))
        .with_control_idle(Duration::from_secs(args.control_idle))
        .with_max_conn_per_ip(args.max_conn_per_ip);
    run_server_with(listener, config).await;
    Ok(())
}

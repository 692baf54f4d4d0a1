// slsk-node: Soulseek client daemon. Logs in, shares the configured directories, and takes part
// in the distributed search network until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use slsk_node::{Client, Config};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "slsk-node", version, about = "Soulseek client daemon")]
struct Cli {
    /// Config file (default: ~/.config/slsk/config.toml, then /etc/slsk/config.toml).
    #[arg(short, long, env = "SLSK_CONFIG")]
    config: Option<PathBuf>,
    /// Overrides the configured username.
    #[arg(short, long)]
    username: Option<String>,
    /// Overrides the configured listen port.
    #[arg(short = 'p', long)]
    listen_port: Option<u16>,
    /// Log filter, e.g. `info` or `slsk_node=debug`. RUST_LOG takes precedence.
    #[arg(long, default_value = "info")]
    log: String,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = Config::load(cli.config.as_deref()).context("loading config")?;
    if let Some(username) = cli.username {
        config.username = username;
    }
    if let Some(port) = cli.listen_port {
        config.listen_port = port;
    }
    config.validate().context("invalid config")?;

    let shares = slsk_node::shares::scan(&config.shared_dirs).context("scanning shared directories")?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let (client, _handle, mut events) = Client::new(config, Arc::new(shares));
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                info!(?event, "event");
            }
        });
        tokio::select! {
            res = client.run() => res.context("client stopped"),
            res = shutdown_signal() => {
                info!("shutting down");
                res
            }
        }
    })
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "ctrl-c handler failed");
        }
    }
    Ok(())
}

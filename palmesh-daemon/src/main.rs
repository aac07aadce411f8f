// Palmesh LAN daemon: multicast discovery, TCP transport and a line console around the core router.

mod config;
mod console;
mod discovery;
mod transport;

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use palmesh_core::Router;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use transport::{Links, TcpTransport};

#[derive(Debug, Parser)]
#[command(name = "palmesh", version, about = "Serverless LAN chat mesh")]
struct Args {
    /// Config file (default: ~/.config/palmesh/config.toml, then /etc/palmesh/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Start a room right away instead of waiting to be found
    #[arg(long)]
    host: bool,
    /// Display name, overrides config and PALMESH_NAME
    #[arg(short, long)]
    name: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut cfg = config::load(args.config.as_deref())?;
    if let Some(name) = args.name {
        cfg.name = name;
    }

    let advertising = Arc::new(AtomicBool::new(false));
    let tcp = TcpTransport::new(advertising.clone());
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let mut router = Router::new(cfg.name.clone(), tcp.clone(), event_tx)
        .context("generating identity key")?;
    router.set_seen_capacity(cfg.seen_capacity);
    if args.host {
        router.host().context("starting room")?;
    }
    let local = router.local_user().clone();
    let local_id = local.id;
    println!("palmesh {} as {} ({})", env!("CARGO_PKG_VERSION"), local.name, local.id);
    println!("fingerprint {}", router.local_fingerprint());
    let router = Arc::new(tokio::sync::Mutex::new(router));

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let listener = TcpListener::bind(("0.0.0.0", cfg.transport_port))
            .await
            .with_context(|| format!("binding transport port {}", cfg.transport_port))?;
        let (connect_tx, connect_rx) = mpsc::unbounded_channel();

        let disc_port = cfg.discovery_port;
        let transport_port = cfg.transport_port;
        tokio::spawn(async move {
            if let Err(e) = discovery::run_discovery(
                local_id,
                disc_port,
                transport_port,
                advertising,
                connect_tx,
            )
            .await
            {
                error!(error = %e, "discovery stopped");
            }
        });

        let links = Links::new(router.clone(), tcp, local_id);
        let static_peers = cfg.peers.clone();
        tokio::spawn(async move {
            if let Err(e) =
                transport::run_transport(links, listener, static_peers, connect_rx).await
            {
                error!(error = %e, "transport stopped");
            }
        });

        tokio::select! {
            r = console::run_console(router.clone(), event_rx) => r?,
            r = shutdown_signal() => r?,
        }
        info!("shutting down");
        Ok::<(), anyhow::Error>(())
    })?;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

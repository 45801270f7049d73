//! mcproxy — a man-in-the-middle proxy for a versioned binary game
//! protocol. Accepts one client connection at a time, splices it to the
//! real upstream server, and rewrites the handshake's cryptographic
//! pedigree in flight so both ends believe they are talking directly to
//! each other.

use anyhow::{Context, Result};
use clap::Parser;
use mcproxy_common::config::ProxyConfig;
use mcproxy_common::trace::{trace_file_path, TraceWriter};
use mcproxy_session::Session;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// A man-in-the-middle proxy for a versioned binary game protocol.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Upstream server hostname to proxy toward.
    upstream_host: Option<String>,

    /// Client-facing listen port.
    #[arg(long)]
    listen_port: Option<u16>,

    /// Upstream server port.
    #[arg(long)]
    upstream_port: Option<u16>,

    /// Local port for the session-hijack impersonation endpoint.
    #[arg(long)]
    hijack_port: Option<u16>,

    /// Hostname of the real session-validation service.
    #[arg(long)]
    session_host: Option<String>,

    /// Directory `.mcs` trace files are written to.
    #[arg(long)]
    trace_dir: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let config = build_config(cli)?;

    info!("==============================================");
    info!("   mcproxy v{}", env!("CARGO_PKG_VERSION"));
    info!("==============================================");
    info!("");
    info!("Upstream:       {}:{}", config.upstream_host, config.upstream_port);
    info!("Listen port:    {}", config.listen_port);
    info!("Hijack port:    {}", config.hijack_port);
    info!("Session host:   {}", config.session_host);
    info!("Trace dir:      {}", config.trace_dir.display());
    info!("==============================================");
    info!("");

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received SIGINT, shutting down after the current session");
            let _ = shutdown_tx.send(true);
        }
    });

    let listen_addr = SocketAddr::from(([0, 0, 0, 0], config.listen_port));
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind listen port {listen_addr}"))?;
    info!("listening on {listen_addr}, waiting for one client at a time");

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                let (client_stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!("accept failed: {e}");
                        continue;
                    }
                };
                info!("accepted client {peer}");
                if let Err(e) = run_session(&config, client_stream, shutdown_rx.clone()).await {
                    warn!("session with {peer} ended with an error: {e}");
                }
                info!("session with {peer} finished");
            }
        }
    }

    info!("shutdown complete");
    Ok(())
}

fn build_config(cli: Cli) -> Result<ProxyConfig> {
    let mut config = ProxyConfig::load()?;
    if let Some(host) = cli.upstream_host {
        config.upstream_host = host;
    }
    if let Some(port) = cli.listen_port {
        config.listen_port = port;
    }
    if let Some(port) = cli.upstream_port {
        config.upstream_port = port;
    }
    if let Some(port) = cli.hijack_port {
        config.hijack_port = port;
    }
    if let Some(host) = cli.session_host {
        config.session_host = host;
    }
    if let Some(dir) = cli.trace_dir {
        config.trace_dir = dir;
    }
    Ok(config)
}

async fn run_session(
    config: &ProxyConfig,
    client_stream: TcpStream,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let upstream_addr = format!("{}:{}", config.upstream_host, config.upstream_port);
    let upstream_stream = TcpStream::connect(&upstream_addr)
        .await
        .with_context(|| format!("failed to connect to upstream {upstream_addr}"))?;
    info!("connected to upstream {upstream_addr}");

    let hijack_addr = SocketAddr::from(([0, 0, 0, 0], config.hijack_port));
    let hijack_rx = mcproxy_hijack::spawn(hijack_addr);

    let started_at = chrono::Local::now();
    let trace_path = trace_file_path(&config.trace_dir, started_at);
    let mut session = Session::new();
    session.rsa_key_bits = config.rsa_key_bits;
    let session = match TraceWriter::create(&trace_path) {
        Ok(writer) => {
            info!("recording trace to {}", trace_path.display());
            session.with_trace(writer)
        }
        Err(e) => {
            warn!("failed to open trace file {}: {e}", trace_path.display());
            session
        }
    };

    mcproxy_session::pump::run(
        session,
        client_stream,
        upstream_stream,
        hijack_rx,
        config.session_host.clone(),
        shutdown_rx,
    )
    .await;
    Ok(())
}

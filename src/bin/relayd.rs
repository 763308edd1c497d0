//! relayd - local multi-user message relay server
//!
//! Loads the authorized users, opens the audit log and serves clients on a
//! Unix socket until SIGINT or SIGTERM.
//!
//! # Usage
//!
//! ```bash
//! relayd users.txt audit.log
//! relayd users.txt audit.log --socket /run/user/1000/relay.sock
//! RELAY_SOCKET=/tmp/other.sock relayd users.txt audit.log
//! ```

use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use relayd::audit::DEFAULT_AUDIT_CAPACITY;
use relayd::config::DEFAULT_SOCKET_PATH;
use relayd::{load_registry, AuditPipeline, RelayServer, ServerConfig};

/// relayd - local multi-user message relay
#[derive(Parser, Debug)]
#[command(name = "relayd", version, about)]
struct Args {
    /// File listing authorized usernames, one per line
    users_path: PathBuf,

    /// Audit log, truncated at startup
    log_path: PathBuf,

    /// Unix socket to listen on
    #[arg(long, env = "RELAY_SOCKET", default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    /// Audit records buffered before senders wait
    #[arg(long, default_value_t = DEFAULT_AUDIT_CAPACITY)]
    audit_capacity: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("relayd=info".parse()?)
                .add_directive("relay_core=info".parse()?)
                .add_directive("relay_protocol=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "Relay server starting"
    );

    let (registry, users) = load_registry(&args.users_path).with_context(|| {
        format!(
            "Failed to load authorized users from {}",
            args.users_path.display()
        )
    })?;
    info!(users, "Registry started");

    let audit = AuditPipeline::start(&args.log_path, args.audit_capacity)
        .await
        .context("Failed to start audit log")?;
    info!(log = %args.log_path.display(), "Audit pipeline started");

    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let config = ServerConfig::default()
        .with_socket_path(&args.socket)
        .with_audit_capacity(args.audit_capacity);
    let server = RelayServer::new(config, registry, audit, cancel_token);

    let report = match server.run().await {
        Ok(report) => report,
        Err(e) => {
            error!(error = %e, "Server error");
            // Stop the writer task before exiting
            let _ = server.context().audit().shutdown().await;
            return Err(e).context("Fatal startup error");
        }
    };

    info!(
        disconnected = report.disconnected,
        audit_lines = report.audit_lines,
        "Relay server stopped"
    );
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT");
        }
    }

    Ok(())
}

//! relay - interactive client for the local message relay
//!
//! # Usage
//!
//! ```text
//! relay alice                  # connect as alice
//! relay alice --socket PATH    # use another socket
//! ```
//!
//! Then type `%ONE <user> <text>`, `%LIST`, `%EXIT` or any other line to
//! broadcast it.

use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::process;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{stderr, stdin, stdout, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use relay_cli::client::DEFAULT_SOCKET_PATH;
use relay_cli::{connect_with_retry, handshake, run_session, ClientConfig, ClientError};

/// relay - chat with other users of this machine
#[derive(Parser, Debug)]
#[command(name = "relay", version, about)]
struct Args {
    /// Username to connect as
    username: String,

    /// Unix socket of the relay server
    #[arg(long, env = "RELAY_SOCKET", default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    /// Connection attempts before giving up
    #[arg(long, default_value_t = 5)]
    retries: u32,
}

// ============================================================================
// Logging Setup
// ============================================================================

fn create_log_file() -> Option<fs::File> {
    let log_dir = dirs::state_dir()?.join("relay");

    if let Err(e) = fs::create_dir_all(&log_dir) {
        eprintln!("Warning: Failed to create log directory {log_dir:?}: {e}");
        return None;
    }

    let log_path = log_dir.join("client.log");
    match OpenOptions::new().create(true).append(true).open(&log_path) {
        Ok(file) => Some(file),
        Err(e) => {
            eprintln!("Warning: Failed to open log file {log_path:?}: {e}");
            None
        }
    }
}

fn init_logging() {
    // stdout carries chat text, so logs go to a file or nowhere
    if let Some(file) = create_log_file() {
        let filter = EnvFilter::from_default_env().add_directive(
            "relay_cli=info"
                .parse()
                .unwrap_or_else(|_| tracing_subscriber::filter::Directive::from(tracing::Level::INFO)),
        );

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new("off"))
            .init();
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging();

    info!(username = %args.username, "Relay client starting");

    let config = ClientConfig {
        socket_path: args.socket,
        retries: args.retries,
        retry_delay: Duration::from_secs(1),
    };

    let stream = connect_with_retry(&config)
        .await
        .context("Is relayd running?")?;
    let (mut reader, mut writer) = stream.into_split();

    match handshake(&mut reader, &mut writer, &args.username).await {
        Ok(()) => {}
        Err(ClientError::Rejected(text)) => {
            error!(%text, "Connection rejected");
            eprintln!("{text}");
            process::exit(1);
        }
        Err(e) => return Err(e).context("Handshake failed"),
    }

    let cancel_token = CancellationToken::new();
    let interrupt_token = cancel_token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted");
            interrupt_token.cancel();
        }
    });

    let result = run_session(
        reader,
        writer,
        BufReader::new(stdin()),
        &mut stdout(),
        &mut stderr(),
        cancel_token,
    )
    .await;

    // A pending stdin read would hold up runtime shutdown, so exit directly
    match result {
        Ok(end) => {
            info!(?end, "Relay client stopped");
            process::exit(0);
        }
        Err(e) => {
            error!(error = %e, "Session failed");
            eprintln!("relay: {e}");
            process::exit(1);
        }
    }
}

//! Shutdown coordinator.
//!
//! Runs once, after the accept loop has stopped:
//!
//! 1. raise the shutdown flag so worker-side disconnects stand down
//! 2. take the table barrier
//! 3. unbind every connected user; for each, remove its handle, drop it from
//!    the summary, send EXIT and close the socket
//! 4. release the barrier, cancel workers and wait for every tracked task
//! 5. stop the audit pipeline after it has drained
//! 6. release whatever is left in the table and the summary

use tokio::io::AsyncWrite;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use relay_protocol::{write_message, WireMessage};

use super::connection::close_writer;
use super::context::ServerContext;

/// What the coordinator did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Users disconnected by force
    pub disconnected: usize,
    /// Handles found after all workers had stopped
    pub leftover: usize,
    /// Lines the audit writer wrote over its life
    pub audit_lines: u64,
}

/// Tears the relay down. A second call returns an empty report.
pub async fn coordinate_shutdown<W>(ctx: &ServerContext<W>) -> ShutdownReport
where
    W: AsyncWrite + Unpin + Send,
{
    if !ctx.begin_shutdown() {
        debug!("Shutdown already in progress");
        return ShutdownReport::default();
    }
    info!("Shutting down relay");

    let limit = ctx.config().write_timeout;
    let mut report = ShutdownReport::default();

    {
        let mut edit = ctx.locks().edit().await;

        let targets = match ctx.registry().disconnect_all().await {
            Ok(targets) => targets,
            Err(e) => {
                warn!(error = %e, "Registry unavailable during shutdown");
                Vec::new()
            }
        };

        for (username, conn) in targets {
            let removed = edit.remove(conn);
            ctx.summary().remove(username.as_str()).await;
            match removed {
                Ok(mut writer) => {
                    let bye = timeout(limit, write_message(&mut writer, &WireMessage::exit())).await;
                    if let Ok(Err(e)) = bye {
                        debug!(%username, error = %e, "Failed to send goodbye");
                    }
                    close_writer(writer, limit).await;
                    report.disconnected += 1;
                }
                Err(e) => debug!(%username, error = %e, "Handle already gone"),
            }
        }
    }

    ctx.workers_token().cancel();
    ctx.tracker().close();
    ctx.tracker().wait().await;
    debug!("All connection tasks finished");

    match ctx.audit().shutdown().await {
        Ok(lines) => report.audit_lines = lines,
        Err(e) => warn!(error = %e, "Audit pipeline did not stop cleanly"),
    }

    let leftover = ctx.locks().edit().await.drain();
    report.leftover = leftover.len();
    for (conn, writer) in leftover {
        debug!(%conn, "Closing leftover connection");
        close_writer(writer, limit).await;
    }
    ctx.summary().clear().await;

    info!(
        disconnected = report.disconnected,
        audit_lines = report.audit_lines,
        "Relay shut down"
    );
    report
}

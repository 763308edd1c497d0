//! Per-connection lifecycle: handshake, worker loop, disconnect.
//!
//! ```text
//! AwaitHandshake ──CONNECT(name)──▶ admit ──OK──▶ Worker loop ──▶ disconnect
//!        │                            │                 │
//!        └── wrong kind / empty ──────┴── ERROR, close  └── EXIT, EOF, violation
//! ```
//!
//! Admission runs entirely under the table barrier: insert the writer, bind
//! the name, list it in the summary and write OK. No other task can send to
//! the new user until the client has seen OK.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`
//! - Every failure ends in a logged, closed connection, never a crashed task

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use relay_core::{RelayError, Username};
use relay_protocol::{read_message, write_message, MessageKind, ProtocolError, WireMessage};

use super::context::ServerContext;
use super::router::{self, Flow, Origin};
use crate::locks::{ConnId, LockError};
use crate::registry::RegistryError;

/// Errors that end a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Handshake rejected: {0}")]
    Rejected(RelayError),

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Server is shutting down")]
    ShuttingDown,

    #[error("Lock table error: {0}")]
    Lock(#[from] LockError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// Serves one accepted connection from handshake to disconnect.
///
/// Runs as a single tracked task: after a successful handshake the same
/// task becomes the user's worker.
pub async fn serve<R, W>(ctx: Arc<ServerContext<W>>, mut reader: R, writer: W, connection: u64)
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    debug!(connection, "New connection");

    let admitted = tokio::select! {
        biased;
        _ = ctx.workers_token().cancelled() => {
            debug!(connection, "Shutdown before handshake completed");
            return;
        }
        result = handshake(&ctx, &mut reader, writer) => result,
    };

    match admitted {
        Ok((username, conn)) => {
            info!(%username, %conn, "User connected");
            Worker::new(ctx, reader, username, conn).run().await;
        }
        Err(e) => {
            warn!(connection, error = %e, "Handshake failed");
        }
    }
}

/// Reads CONNECT and admits the user, or rejects with an ERROR reply.
pub async fn handshake<R, W>(
    ctx: &ServerContext<W>,
    reader: &mut R,
    writer: W,
) -> Result<(Username, ConnId), ConnectionError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let limit = ctx.config().handshake_timeout;
    let first = match timeout(limit, read_message(reader)).await {
        Ok(Ok(msg)) => msg,
        Ok(Err(e @ ProtocolError::UnknownKind(_))) => {
            let err = RelayError::protocol(e.to_string());
            reject(ctx, writer, &err).await;
            return Err(ConnectionError::Rejected(err));
        }
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => return Err(ConnectionError::HandshakeTimeout),
    };

    if first.kind != MessageKind::Connect || first.payload.is_empty() {
        let err = RelayError::protocol("expected CONNECT with a username");
        reject(ctx, writer, &err).await;
        return Err(ConnectionError::Rejected(err));
    }

    let name = first.text().into_owned();
    admit(ctx, &name, writer).await
}

async fn admit<W>(
    ctx: &ServerContext<W>,
    name: &str,
    writer: W,
) -> Result<(Username, ConnId), ConnectionError>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut edit = ctx.locks().edit_timeout(ctx.config().barrier_timeout).await?;

    if ctx.is_shutting_down() {
        drop(edit);
        reject(ctx, writer, &RelayError::protocol("server is shutting down")).await;
        return Err(ConnectionError::ShuttingDown);
    }

    let conn = edit.insert(writer)?;
    let username = match ctx.registry().bind(name, conn).await {
        Ok(username) => username,
        Err(e) => {
            let writer = edit.remove(conn)?;
            drop(edit);
            let err = e
                .to_relay_error()
                .unwrap_or_else(|| RelayError::protocol("registry unavailable"));
            reject(ctx, writer, &err).await;
            return Err(ConnectionError::Rejected(err));
        }
    };

    ctx.summary().add(username.as_str()).await;

    let write_limit = ctx.config().write_timeout;
    let sent = match edit.get_mut(conn) {
        Ok(writer) => {
            match timeout(write_limit, write_message(writer, &WireMessage::ok())).await {
                Ok(result) => result.map_err(ConnectionError::from),
                Err(_) => Err(ConnectionError::WriteTimeout),
            }
        }
        Err(e) => Err(e.into()),
    };

    if let Err(e) = sent {
        // Roll back in reverse order
        ctx.summary().remove(username.as_str()).await;
        if let Err(unbind) = ctx.registry().unbind(&username).await {
            warn!(%username, error = %unbind, "Rollback unbind failed");
        }
        if let Ok(writer) = edit.remove(conn) {
            close_writer(writer, write_limit).await;
        }
        return Err(e);
    }

    Ok((username, conn))
}

/// Best-effort ERROR reply, then close.
async fn reject<W>(ctx: &ServerContext<W>, mut writer: W, err: &RelayError)
where
    W: AsyncWrite + Unpin + Send,
{
    let limit = ctx.config().write_timeout;
    debug!(code = err.code(), "Rejecting connection");
    match timeout(limit, write_message(&mut writer, &WireMessage::error(err))).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "Failed to send rejection"),
        Err(_) => debug!("Rejection write timed out"),
    }
    close_writer(writer, limit).await;
}

/// Shuts down the write direction; the peer then sees end of stream.
pub(crate) async fn close_writer<W>(mut writer: W, limit: Duration)
where
    W: AsyncWrite + Unpin,
{
    if let Ok(Err(e)) = timeout(limit, writer.shutdown()).await {
        debug!(error = %e, "Socket shutdown failed");
    }
}

// ============================================================================
// Worker
// ============================================================================

/// Receive loop for one connected user.
pub struct Worker<R, W> {
    ctx: Arc<ServerContext<W>>,
    reader: R,
    username: Username,
    conn: ConnId,
}

impl<R, W> Worker<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(ctx: Arc<ServerContext<W>>, reader: R, username: Username, conn: ConnId) -> Self {
        Self {
            ctx,
            reader,
            username,
            conn,
        }
    }

    /// Receives and routes until the user leaves, its connection is evicted
    /// or shutdown cancels it.
    pub async fn run(mut self) {
        let evicted = self.ctx.eviction_token(self.conn).await;
        loop {
            let received = tokio::select! {
                biased;
                _ = self.ctx.workers_token().cancelled() => {
                    debug!(username = %self.username, "Worker cancelled");
                    return;
                }
                _ = evicted.cancelled() => {
                    warn!(username = %self.username, "Connection broken by a failed write");
                    disconnect(&self.ctx, &self.username, false).await;
                    return;
                }
                result = read_message(&mut self.reader) => result,
            };

            let origin = Origin {
                username: &self.username,
                conn: self.conn,
            };

            match received {
                Ok(msg) => match router::route(&self.ctx, origin, msg).await {
                    Flow::Continue => {}
                    Flow::Exit => {
                        disconnect(&self.ctx, &self.username, true).await;
                        return;
                    }
                    Flow::Violation => {
                        disconnect(&self.ctx, &self.username, false).await;
                        return;
                    }
                },
                Err(e) if e.is_disconnect() => {
                    debug!(username = %self.username, error = %e, "Peer closed connection");
                    disconnect(&self.ctx, &self.username, false).await;
                    return;
                }
                Err(e) => {
                    warn!(
                        username = %self.username,
                        error = %e,
                        "Unreadable message, dropping user"
                    );
                    let err = RelayError::protocol(e.to_string());
                    if let Err(send) = self.ctx.send(self.conn, &WireMessage::error(&err)).await {
                        debug!(username = %self.username, error = %send, "Failed to report error");
                    }
                    disconnect(&self.ctx, &self.username, false).await;
                    return;
                }
            }
        }
    }
}

/// Disconnect path shared by EXIT, peer close and protocol violations.
///
/// Does nothing once shutdown has started, or if the session was already
/// torn down: the registry lets exactly one caller unbind a session.
pub async fn disconnect<W>(ctx: &ServerContext<W>, username: &Username, goodbye: bool)
where
    W: AsyncWrite + Unpin + Send,
{
    if ctx.is_shutting_down() {
        debug!(%username, "Disconnect left to shutdown");
        return;
    }

    let (conn, online) = match ctx.registry().unbind(username).await {
        Ok(unbound) => unbound,
        Err(RegistryError::NotConnected(_)) => {
            debug!(%username, "Session already torn down");
            return;
        }
        Err(e) => {
            warn!(%username, error = %e, "Unbind failed");
            return;
        }
    };

    let removed = ctx.locks().edit().await.remove(conn);
    ctx.forget(conn).await;
    ctx.summary().remove(username.as_str()).await;
    match removed {
        Ok(mut writer) => {
            let limit = ctx.config().write_timeout;
            if goodbye {
                let bye = timeout(limit, write_message(&mut writer, &WireMessage::exit())).await;
                if let Ok(Err(e)) = bye {
                    debug!(%username, error = %e, "Failed to send goodbye");
                }
            }
            close_writer(writer, limit).await;
        }
        Err(e) => debug!(%username, error = %e, "Handle already removed"),
    }

    info!(%username, online_secs = online.as_secs(), "User disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::AuthorizedUsers;
    use tokio::io::{duplex, split, DuplexStream, ReadHalf, WriteHalf};

    use crate::audit::AuditPipeline;
    use crate::config::ServerConfig;
    use crate::registry::spawn_registry;

    type TestContext = ServerContext<WriteHalf<DuplexStream>>;

    async fn context(dir: &tempfile::TempDir) -> Arc<TestContext> {
        let registry = spawn_registry(AuthorizedUsers::parse("alice\nbob\n").unwrap());
        let audit = AuditPipeline::start(dir.path().join("audit.log"), 8)
            .await
            .unwrap();
        let config = ServerConfig::default().with_handshake_timeout(Duration::from_millis(200));
        Arc::new(ServerContext::new(config, registry, audit))
    }

    struct Pipe {
        client_read: ReadHalf<DuplexStream>,
        client_write: WriteHalf<DuplexStream>,
        server_read: ReadHalf<DuplexStream>,
        server_write: WriteHalf<DuplexStream>,
    }

    fn pipe() -> Pipe {
        let (client, server) = duplex(4096);
        let (client_read, client_write) = split(client);
        let (server_read, server_write) = split(server);
        Pipe {
            client_read,
            client_write,
            server_read,
            server_write,
        }
    }

    #[tokio::test]
    async fn test_handshake_accepts_known_user() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir).await;
        let mut p = pipe();

        write_message(&mut p.client_write, &WireMessage::connect("alice"))
            .await
            .unwrap();
        let (username, conn) = handshake(&ctx, &mut p.server_read, p.server_write)
            .await
            .unwrap();

        assert_eq!(username.as_str(), "alice");
        assert_eq!(read_message(&mut p.client_read).await.unwrap(), WireMessage::ok());
        assert_eq!(ctx.registry().lookup("alice").await.unwrap(), Some(conn));
        assert_eq!(ctx.summary().snapshot().await, "[LIST] alice");
    }

    #[tokio::test]
    async fn test_handshake_rejects_unknown_user() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir).await;
        let mut p = pipe();

        write_message(&mut p.client_write, &WireMessage::connect("mallory"))
            .await
            .unwrap();
        let err = handshake(&ctx, &mut p.server_read, p.server_write)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Rejected(RelayError::UnknownUser { .. })));

        let reply = read_message(&mut p.client_read).await.unwrap();
        assert_eq!(reply.text(), "[ERROR] mallory: not a registered user");
        assert!(matches!(
            read_message(&mut p.client_read).await,
            Err(ProtocolError::Closed)
        ));
        assert!(ctx.locks().is_empty().await);
        assert_eq!(ctx.summary().snapshot().await, "[LIST]");
    }

    #[tokio::test]
    async fn test_handshake_rejects_second_session() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir).await;

        let mut first = pipe();
        write_message(&mut first.client_write, &WireMessage::connect("bob"))
            .await
            .unwrap();
        handshake(&ctx, &mut first.server_read, first.server_write)
            .await
            .unwrap();

        let mut second = pipe();
        write_message(&mut second.client_write, &WireMessage::connect("bob"))
            .await
            .unwrap();
        let err = handshake(&ctx, &mut second.server_read, second.server_write)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Rejected(RelayError::AlreadyConnected { .. })
        ));
        assert_eq!(
            read_message(&mut second.client_read).await.unwrap().text(),
            "[ERROR] bob: username already in use"
        );
        assert_eq!(ctx.locks().len().await, 1);
    }

    #[tokio::test]
    async fn test_handshake_rejects_wrong_first_message() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir).await;

        for first in [WireMessage::connect(""), WireMessage::list()] {
            let mut p = pipe();
            write_message(&mut p.client_write, &first).await.unwrap();
            let err = handshake(&ctx, &mut p.server_read, p.server_write)
                .await
                .unwrap_err();
            assert!(matches!(err, ConnectionError::Rejected(RelayError::Protocol { .. })));
            let reply = read_message(&mut p.client_read).await.unwrap();
            assert_eq!(reply.kind, MessageKind::Error);
        }
    }

    #[tokio::test]
    async fn test_handshake_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir).await;
        let mut p = pipe();

        let err = handshake(&ctx, &mut p.server_read, p.server_write)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::HandshakeTimeout));
    }

    #[tokio::test]
    async fn test_handshake_refused_during_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir).await;
        ctx.begin_shutdown();

        let mut p = pipe();
        write_message(&mut p.client_write, &WireMessage::connect("alice"))
            .await
            .unwrap();
        let err = handshake(&ctx, &mut p.server_read, p.server_write)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::ShuttingDown));
        assert_eq!(ctx.registry().lookup("alice").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_worker_exit_tears_down_once() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir).await;
        let mut p = pipe();

        write_message(&mut p.client_write, &WireMessage::connect("alice"))
            .await
            .unwrap();
        let (username, conn) = handshake(&ctx, &mut p.server_read, p.server_write)
            .await
            .unwrap();
        read_message(&mut p.client_read).await.unwrap();

        write_message(&mut p.client_write, &WireMessage::exit())
            .await
            .unwrap();
        Worker::new(Arc::clone(&ctx), p.server_read, username.clone(), conn)
            .run()
            .await;

        assert_eq!(read_message(&mut p.client_read).await.unwrap(), WireMessage::exit());
        assert!(matches!(
            read_message(&mut p.client_read).await,
            Err(ProtocolError::Closed)
        ));
        assert_eq!(ctx.registry().lookup("alice").await.unwrap(), None);
        assert!(ctx.locks().is_empty().await);
        assert_eq!(ctx.summary().snapshot().await, "[LIST]");

        // A second teardown finds nothing to do
        disconnect(&ctx, &username, true).await;
        assert_eq!(ctx.summary().snapshot().await, "[LIST]");
    }

    #[tokio::test]
    async fn test_worker_peer_close_is_exit() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir).await;
        let mut p = pipe();

        write_message(&mut p.client_write, &WireMessage::connect("bob"))
            .await
            .unwrap();
        let (username, conn) = handshake(&ctx, &mut p.server_read, p.server_write)
            .await
            .unwrap();
        drop(p.client_write);
        drop(p.client_read);

        Worker::new(Arc::clone(&ctx), p.server_read, username, conn)
            .run()
            .await;

        assert_eq!(ctx.registry().count().await.unwrap(), (2, 0));
        assert!(ctx.locks().is_empty().await);
    }

    #[tokio::test]
    async fn test_worker_tears_down_evicted_connection() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir).await;
        let mut p = pipe();

        write_message(&mut p.client_write, &WireMessage::connect("alice"))
            .await
            .unwrap();
        let (username, conn) = handshake(&ctx, &mut p.server_read, p.server_write)
            .await
            .unwrap();
        read_message(&mut p.client_read).await.unwrap();

        let worker = tokio::spawn(
            Worker::new(Arc::clone(&ctx), p.server_read, username, conn).run(),
        );
        // Let the worker register before the connection breaks
        tokio::task::yield_now().await;
        while ctx.registry().lookup("alice").await.unwrap().is_some() {
            ctx.evict(conn).await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        worker.await.unwrap();

        assert!(ctx.locks().is_empty().await);
        assert_eq!(ctx.summary().snapshot().await, "[LIST]");
        // No goodbye, just end of stream
        assert!(matches!(
            read_message(&mut p.client_read).await,
            Err(ProtocolError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_worker_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir).await;
        let mut p = pipe();

        write_message(&mut p.client_write, &WireMessage::connect("bob"))
            .await
            .unwrap();
        let (username, conn) = handshake(&ctx, &mut p.server_read, p.server_write)
            .await
            .unwrap();

        ctx.workers_token().cancel();
        Worker::new(Arc::clone(&ctx), p.server_read, username, conn)
            .run()
            .await;

        // Cancellation leaves teardown to the shutdown coordinator
        assert_eq!(ctx.registry().count().await.unwrap(), (2, 1));
    }
}

//! Message routing: one step of a worker after each receive.
//!
//! | Kind    | Action                                                   |
//! |---------|----------------------------------------------------------|
//! | TO_ONE  | `[sender] body` to one connected receiver                |
//! | BCAST   | `[BCAST][sender] body` to every connected user, sender too |
//! | LIST    | summary snapshot back to the sender                      |
//! | EXIT    | hand control back to the worker's disconnect path        |
//! | other   | protocol ERROR, then disconnect                          |
//!
//! Per-recipient failures are reported to the sender as ERROR replies and
//! never stop the loop. Every copy that reaches a recipient produces one
//! audit record; a copy whose write failed produces none.

use tokio::io::AsyncWrite;
use tracing::{debug, warn};

use relay_core::{RelayError, Username};
use relay_protocol::{MessageKind, WireMessage};

use super::context::ServerContext;
use crate::audit::AuditRecord;
use crate::locks::ConnId;
use crate::registry::RegistryError;

/// What the worker should do after a routed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep receiving
    Continue,
    /// Client asked to leave
    Exit,
    /// Client broke the protocol; it has been told and must be dropped
    Violation,
}

/// The connected user a worker routes for.
#[derive(Debug, Clone, Copy)]
pub struct Origin<'a> {
    pub username: &'a Username,
    pub conn: ConnId,
}

/// Routes one received message from `origin`.
pub async fn route<W>(ctx: &ServerContext<W>, origin: Origin<'_>, msg: WireMessage) -> Flow
where
    W: AsyncWrite + Unpin + Send,
{
    debug!(
        username = %origin.username,
        kind = %msg.kind,
        len = msg.payload.len(),
        "Routing message"
    );

    match msg.kind {
        MessageKind::ToOne => {
            match msg.split_to_one() {
                Ok((receiver, body)) => send_to_one(ctx, origin, &receiver, &body).await,
                Err(e) => {
                    debug!(username = %origin.username, error = %e, "Malformed TO_ONE");
                    reply_error(ctx, origin, &RelayError::MalformedToOne).await;
                }
            }
            Flow::Continue
        }
        MessageKind::Bcast => {
            broadcast(ctx, origin, &msg.text()).await;
            Flow::Continue
        }
        MessageKind::List => {
            let summary = ctx.summary().snapshot().await;
            reply(ctx, origin, &WireMessage::new(MessageKind::List, summary)).await;
            Flow::Continue
        }
        MessageKind::Exit => Flow::Exit,
        MessageKind::Connect | MessageKind::Ok | MessageKind::Error | MessageKind::Ping => {
            warn!(
                username = %origin.username,
                kind = %msg.kind,
                "Unexpected message kind after handshake"
            );
            let err = RelayError::protocol(format!("unexpected {} message", msg.kind));
            reply_error(ctx, origin, &err).await;
            Flow::Violation
        }
    }
}

/// Delivers a unicast message, reporting any failure to the sender.
async fn send_to_one<W>(ctx: &ServerContext<W>, origin: Origin<'_>, receiver: &str, body: &str)
where
    W: AsyncWrite + Unpin + Send,
{
    let target = match ctx.registry().lookup(receiver).await {
        Ok(Some(conn)) => conn,
        Ok(None) => {
            reply_error(ctx, origin, &RelayError::user_not_connected(receiver)).await;
            return;
        }
        Err(RegistryError::UnknownUser(_)) => {
            reply_error(ctx, origin, &RelayError::unknown_user(receiver)).await;
            return;
        }
        Err(e) => {
            warn!(error = %e, "Registry unavailable during TO_ONE");
            reply_error(ctx, origin, &RelayError::delivery_failure(receiver)).await;
            return;
        }
    };

    let text = format!("[{}] {}", origin.username, body);
    let record = AuditRecord::direct(origin.username.as_str(), receiver, body);
    let msg = WireMessage::new(MessageKind::ToOne, text);
    if let Err(err) = deliver(ctx, target, receiver, &msg, record).await {
        reply_error(ctx, origin, &err).await;
    }
}

/// Fans a broadcast out to every connected user, the sender included.
async fn broadcast<W>(ctx: &ServerContext<W>, origin: Origin<'_>, body: &str)
where
    W: AsyncWrite + Unpin + Send,
{
    let targets = match ctx.registry().connected_targets().await {
        Ok(targets) => targets,
        Err(e) => {
            warn!(error = %e, "Registry unavailable during BCAST");
            return;
        }
    };

    let text = format!("[BCAST][{}] {}", origin.username, body);
    let msg = WireMessage::bcast(&text);
    let mut delivered = 0usize;

    for (receiver, conn) in &targets {
        let record = AuditRecord::broadcast(origin.username.as_str(), receiver.as_str(), body);
        match deliver(ctx, *conn, receiver.as_str(), &msg, record).await {
            Ok(()) => delivered += 1,
            Err(err) => reply_error(ctx, origin, &err).await,
        }
    }

    debug!(
        username = %origin.username,
        delivered,
        targets = targets.len(),
        "Broadcast fanned out"
    );
}

/// Sends one copy and audits it on success.
async fn deliver<W>(
    ctx: &ServerContext<W>,
    conn: ConnId,
    receiver: &str,
    msg: &WireMessage,
    record: AuditRecord,
) -> Result<(), RelayError>
where
    W: AsyncWrite + Unpin + Send,
{
    if let Err(e) = ctx.send(conn, msg).await {
        debug!(receiver, %conn, error = %e, "Delivery failed");
        return Err(if e.is_gone() {
            RelayError::user_not_connected(receiver)
        } else {
            RelayError::delivery_failure(receiver)
        });
    }

    if let Err(e) = ctx.audit().enqueue(record).await {
        warn!(receiver, error = %e, "Delivered message was not audited");
    }
    Ok(())
}

async fn reply<W>(ctx: &ServerContext<W>, origin: Origin<'_>, msg: &WireMessage)
where
    W: AsyncWrite + Unpin + Send,
{
    if let Err(e) = ctx.send(origin.conn, msg).await {
        debug!(username = %origin.username, error = %e, "Reply to sender failed");
    }
}

async fn reply_error<W>(ctx: &ServerContext<W>, origin: Origin<'_>, err: &RelayError)
where
    W: AsyncWrite + Unpin + Send,
{
    debug!(username = %origin.username, code = err.code(), "Replying with error");
    reply(ctx, origin, &WireMessage::error(err)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};

    use relay_core::AuthorizedUsers;
    use relay_protocol::read_message;
    use tokio::io::{duplex, split, DuplexStream, ReadHalf, WriteHalf};

    use crate::audit::AuditPipeline;
    use crate::config::ServerConfig;
    use crate::registry::spawn_registry;

    type TestContext = ServerContext<WriteHalf<DuplexStream>>;

    struct Peer {
        reader: ReadHalf<DuplexStream>,
        _writer: WriteHalf<DuplexStream>,
        username: Username,
        conn: ConnId,
    }

    impl Peer {
        fn origin(&self) -> Origin<'_> {
            Origin {
                username: &self.username,
                conn: self.conn,
            }
        }

        async fn recv(&mut self) -> WireMessage {
            read_message(&mut self.reader).await.unwrap()
        }
    }

    async fn context(dir: &tempfile::TempDir) -> (TestContext, PathBuf) {
        let registry = spawn_registry(AuthorizedUsers::parse("alice\nbob\ncarol\n").unwrap());
        let log = dir.path().join("audit.log");
        let audit = AuditPipeline::start(&log, 8).await.unwrap();
        (ServerContext::new(ServerConfig::default(), registry, audit), log)
    }

    async fn connect(ctx: &TestContext, name: &str) -> Peer {
        let (client, server) = duplex(4096);
        let (reader, writer) = split(client);
        let (_, server_writer) = split(server);

        let conn = ctx.locks().edit().await.insert(server_writer).unwrap();
        let username = ctx.registry().bind(name, conn).await.unwrap();
        ctx.summary().add(name).await;

        Peer {
            reader,
            _writer: writer,
            username,
            conn,
        }
    }

    async fn audit_lines(ctx: &TestContext, log: &Path) -> Vec<String> {
        ctx.audit().shutdown().await.unwrap();
        tokio::fs::read_to_string(log)
            .await
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[tokio::test]
    async fn test_to_one_delivers_formatted_text() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, log) = context(&dir).await;
        let alice = connect(&ctx, "alice").await;
        let mut bob = connect(&ctx, "bob").await;

        let flow = route(&ctx, alice.origin(), WireMessage::to_one("bob", "hello")).await;
        assert_eq!(flow, Flow::Continue);

        let msg = bob.recv().await;
        assert_eq!(msg.kind, MessageKind::ToOne);
        assert_eq!(msg.text(), "[alice] hello");

        assert_eq!(audit_lines(&ctx, &log).await, vec!["alice:bob:hello"]);
    }

    #[tokio::test]
    async fn test_to_one_errors_go_back_to_sender() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, log) = context(&dir).await;
        let mut alice = connect(&ctx, "alice").await;

        route(&ctx, alice.origin(), WireMessage::to_one("carol", "hi")).await;
        let msg = alice.recv().await;
        assert_eq!(msg.kind, MessageKind::Error);
        assert_eq!(msg.text(), "[ERROR] carol: user not connected");

        route(&ctx, alice.origin(), WireMessage::to_one("zed", "hi")).await;
        assert_eq!(alice.recv().await.text(), "[ERROR] zed: not a registered user");

        let malformed = WireMessage::new(MessageKind::ToOne, b"no separator".to_vec());
        let flow = route(&ctx, alice.origin(), malformed).await;
        assert_eq!(flow, Flow::Continue);
        assert!(alice.recv().await.text().contains("malformed message"));

        assert!(audit_lines(&ctx, &log).await.is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_echoes_to_sender() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, log) = context(&dir).await;
        let mut alice = connect(&ctx, "alice").await;
        let mut bob = connect(&ctx, "bob").await;
        let mut carol = connect(&ctx, "carol").await;

        route(&ctx, alice.origin(), WireMessage::bcast("hey all")).await;

        for peer in [&mut alice, &mut bob, &mut carol] {
            let msg = peer.recv().await;
            assert_eq!(msg.kind, MessageKind::Bcast);
            assert_eq!(msg.text(), "[BCAST][alice] hey all");
        }

        assert_eq!(
            audit_lines(&ctx, &log).await,
            vec!["alice:alice:hey all", "alice:bob:hey all", "alice:carol:hey all"]
        );
    }

    #[tokio::test]
    async fn test_broadcast_partial_failure_continues() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, log) = context(&dir).await;
        let mut alice = connect(&ctx, "alice").await;
        let bob = connect(&ctx, "bob").await;
        let mut carol = connect(&ctx, "carol").await;

        // Bob's handle vanishes while the registry still lists him
        ctx.locks().edit().await.remove(bob.conn).unwrap();

        route(&ctx, alice.origin(), WireMessage::bcast("still here")).await;

        assert_eq!(alice.recv().await.text(), "[BCAST][alice] still here");
        assert_eq!(alice.recv().await.text(), "[ERROR] bob: user not connected");
        assert_eq!(carol.recv().await.text(), "[BCAST][alice] still here");

        assert_eq!(audit_lines(&ctx, &log).await.len(), 2);
    }

    #[tokio::test]
    async fn test_broken_recipient_is_not_audited() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, log) = context(&dir).await;
        let mut alice = connect(&ctx, "alice").await;
        let bob = connect(&ctx, "bob").await;

        // An earlier write to bob failed mid-frame
        ctx.locks().acquire(bob.conn).await.unwrap().poison();

        route(&ctx, alice.origin(), WireMessage::to_one("bob", "hello")).await;
        assert_eq!(
            alice.recv().await.text(),
            "[ERROR] bob: message not delivered due to a delivery failure"
        );

        assert!(audit_lines(&ctx, &log).await.is_empty());
    }

    #[tokio::test]
    async fn test_list_returns_summary() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _log) = context(&dir).await;
        let mut alice = connect(&ctx, "alice").await;
        let _bob = connect(&ctx, "bob").await;

        route(&ctx, alice.origin(), WireMessage::list()).await;
        let msg = alice.recv().await;
        assert_eq!(msg.kind, MessageKind::List);
        assert_eq!(msg.text(), "[LIST] alice bob");
    }

    #[tokio::test]
    async fn test_exit_and_violation_flows() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _log) = context(&dir).await;
        let mut alice = connect(&ctx, "alice").await;

        assert_eq!(
            route(&ctx, alice.origin(), WireMessage::exit()).await,
            Flow::Exit
        );

        let flow = route(&ctx, alice.origin(), WireMessage::connect("alice")).await;
        assert_eq!(flow, Flow::Violation);
        let msg = alice.recv().await;
        assert_eq!(msg.kind, MessageKind::Error);
        assert!(msg.text().starts_with("[ERROR] protocol error"));
    }
}

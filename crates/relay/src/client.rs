//! Relay connection client.
//!
//! This module provides:
//! - Connection to the relay socket with a bounded retry loop
//! - The CONNECT / OK handshake
//! - The interactive session loop pumping stdin commands to the server and
//!   server frames to stdout / stderr
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relay_protocol::{read_message, write_message, MessageKind, ProtocolError, WireMessage};

use crate::command::{parse_line, Command};
use crate::error::{ClientError, Result};

/// Default socket path, shared with the server.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/relay.sock";

/// Frames buffered between the socket reader task and the session loop.
const FRAME_BUFFER: usize = 32;

// ============================================================================
// Configuration
// ============================================================================

/// Connection behavior of the client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Path to the relay's Unix socket.
    pub socket_path: PathBuf,

    /// Connection attempts before giving up (at least one is made).
    pub retries: u32,

    /// Pause between attempts.
    pub retry_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            retries: 5,
            retry_delay: Duration::from_secs(1),
        }
    }
}

// ============================================================================
// Connection
// ============================================================================

/// Connects to the relay, retrying up to `config.retries` times.
pub async fn connect_with_retry(config: &ClientConfig) -> Result<UnixStream> {
    let attempts = config.retries.max(1);
    let mut attempt = 0u32;

    loop {
        attempt = attempt.saturating_add(1);
        debug!(
            attempt,
            socket_path = %config.socket_path.display(),
            "Attempting to connect to relay"
        );

        match UnixStream::connect(&config.socket_path).await {
            Ok(stream) => {
                debug!(attempt, "Connection successful");
                return Ok(stream);
            }
            Err(e) if attempt >= attempts => {
                return Err(ClientError::Connect {
                    path: config.socket_path.clone(),
                    attempts,
                    source: e,
                });
            }
            Err(e) => {
                warn!(attempt, error = %e, "Connection attempt failed, will retry");
                sleep(config.retry_delay).await;
            }
        }
    }
}

/// Sends CONNECT and waits for the server's verdict.
///
/// An ERROR reply becomes [`ClientError::Rejected`] carrying the server text.
pub async fn handshake<R, W>(reader: &mut R, writer: &mut W, username: &str) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    write_message(writer, &WireMessage::connect(username)).await?;

    let reply = read_message(reader).await?;
    match reply.kind {
        MessageKind::Ok => {
            info!(%username, "Handshake complete");
            Ok(())
        }
        MessageKind::Error => Err(ClientError::Rejected(reply.text().into_owned())),
        other => Err(ClientError::UnexpectedReply(other)),
    }
}

// ============================================================================
// Session
// ============================================================================

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Server sent EXIT
    Goodbye,
    /// Server closed the socket without a goodbye
    Closed,
}

/// Runs the interactive session until the server says goodbye or closes.
///
/// Lines from `input` are parsed into commands and sent. Server frames are
/// printed one per line, ERROR text to `err` and everything else to `out`.
/// After `%EXIT`, end of input or cancellation the client sends EXIT and
/// keeps draining server frames until the goodbye arrives.
pub async fn run_session<R, W, I, O, E>(
    reader: R,
    mut writer: W,
    input: I,
    out: &mut O,
    err: &mut E,
    cancel_token: CancellationToken,
) -> Result<SessionEnd>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
    I: AsyncBufRead + Unpin,
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    // read_message is not cancel-safe, so frames are read on their own task
    let (frame_tx, mut frames) = mpsc::channel(FRAME_BUFFER);
    let reader_task = tokio::spawn(read_frames(reader, frame_tx));

    let mut lines = input.lines();
    let mut leaving = false;

    let result = loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Some(Ok(msg)) if msg.kind == MessageKind::Exit => {
                    info!("Server said goodbye");
                    break Ok(SessionEnd::Goodbye);
                }
                Some(Ok(msg)) => {
                    let sink: &mut (dyn AsyncWrite + Unpin) = if msg.kind == MessageKind::Error {
                        &mut *err
                    } else {
                        &mut *out
                    };
                    if let Err(e) = print_line(sink, &msg.text()).await {
                        break Err(e.into());
                    }
                }
                Some(Err(ProtocolError::Closed)) | None => {
                    info!("Server closed the connection");
                    break Ok(SessionEnd::Closed);
                }
                Some(Err(e)) => break Err(e.into()),
            },

            line = lines.next_line(), if !leaving => {
                let command = match line {
                    Ok(Some(line)) => match parse_line(&line) {
                        Ok(Some(command)) => command,
                        Ok(None) => continue,
                        Err(usage) => {
                            if let Err(e) = print_line(err, &usage.to_string()).await {
                                break Err(e.into());
                            }
                            continue;
                        }
                    },
                    Ok(None) => {
                        debug!("Input closed");
                        Command::Exit
                    }
                    Err(e) => break Err(e.into()),
                };

                leaving = command == Command::Exit;
                if let Err(e) = write_message(&mut writer, &command.to_message()).await {
                    break Err(e.into());
                }
            }

            _ = cancel_token.cancelled(), if !leaving => {
                info!("Session cancelled, leaving relay");
                leaving = true;
                if let Err(e) = write_message(&mut writer, &WireMessage::exit()).await {
                    break Err(e.into());
                }
            }
        }
    };

    reader_task.abort();
    result
}

async fn read_frames<R>(mut reader: R, tx: mpsc::Sender<std::result::Result<WireMessage, ProtocolError>>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = read_message(&mut reader).await;
        let stop = frame.is_err();
        if tx.send(frame).await.is_err() || stop {
            return;
        }
    }
}

async fn print_line<O>(out: &mut O, text: &str) -> std::io::Result<()>
where
    O: AsyncWrite + Unpin + ?Sized,
{
    out.write_all(text.as_bytes()).await?;
    out.write_all(b"\n").await?;
    out.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, split, DuplexStream, ReadHalf, WriteHalf};

    /// Server side of an in-memory connection.
    struct FakeServer {
        reader: ReadHalf<DuplexStream>,
        writer: WriteHalf<DuplexStream>,
    }

    impl FakeServer {
        async fn expect(&mut self) -> WireMessage {
            read_message(&mut self.reader).await.unwrap()
        }

        async fn reply(&mut self, msg: WireMessage) {
            write_message(&mut self.writer, &msg).await.unwrap();
        }
    }

    fn pair() -> (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>, FakeServer) {
        let (client, server) = duplex(4096);
        let (client_read, client_write) = split(client);
        let (reader, writer) = split(server);
        (client_read, client_write, FakeServer { reader, writer })
    }

    #[tokio::test]
    async fn test_handshake_ok() {
        let (mut reader, mut writer, mut server) = pair();
        let server_task = tokio::spawn(async move {
            assert_eq!(server.expect().await, WireMessage::connect("alice"));
            server.reply(WireMessage::ok()).await;
            server
        });

        handshake(&mut reader, &mut writer, "alice").await.unwrap();
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_rejected_carries_text() {
        let (mut reader, mut writer, mut server) = pair();
        let server_task = tokio::spawn(async move {
            server.expect().await;
            server
                .reply(WireMessage::error_text("[ERROR] mallory: not a registered user"))
                .await;
            server
        });

        let err = handshake(&mut reader, &mut writer, "mallory").await.unwrap_err();
        assert_eq!(err.to_string(), "[ERROR] mallory: not a registered user");
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_unexpected_reply() {
        let (mut reader, mut writer, mut server) = pair();
        let server_task = tokio::spawn(async move {
            server.expect().await;
            server.reply(WireMessage::list()).await;
            server
        });

        let err = handshake(&mut reader, &mut writer, "alice").await.unwrap_err();
        assert!(matches!(err, ClientError::UnexpectedReply(MessageKind::List)));
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_session_sends_commands_and_prints_frames() {
        let (reader, writer, mut server) = pair();
        let server_task = tokio::spawn(async move {
            assert_eq!(server.expect().await, WireMessage::to_one("bob", "hi"));
            server
                .reply(WireMessage::new(MessageKind::ToOne, "[bob] hey"))
                .await;
            assert_eq!(server.expect().await, WireMessage::bcast("all of you"));
            assert_eq!(server.expect().await, WireMessage::list());
            server.reply(WireMessage::error_text("[ERROR] zed: user not connected")).await;
            server
                .reply(WireMessage::new(MessageKind::List, "[LIST] alice bob"))
                .await;
            assert_eq!(server.expect().await, WireMessage::exit());
            server.reply(WireMessage::exit()).await;
            server
        });

        let input: &[u8] = b"%ONE bob hi\n\n%NOPE\nall of you\n%LIST\n%EXIT\nignored\n";
        let mut out = Vec::new();
        let mut err = Vec::new();
        let end = run_session(reader, writer, input, &mut out, &mut err, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(end, SessionEnd::Goodbye);
        assert_eq!(String::from_utf8(out).unwrap(), "[bob] hey\n[LIST] alice bob\n");
        let err = String::from_utf8(err).unwrap();
        assert!(err.contains("unknown command"));
        assert!(err.contains("[ERROR] zed: user not connected"));
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_session_end_of_input_sends_exit() {
        let (reader, writer, mut server) = pair();
        let server_task = tokio::spawn(async move {
            assert_eq!(server.expect().await, WireMessage::exit());
            server.reply(WireMessage::exit()).await;
            server
        });

        let input: &[u8] = b"";
        let mut out = Vec::new();
        let mut err = Vec::new();
        let end = run_session(reader, writer, input, &mut out, &mut err, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(end, SessionEnd::Goodbye);
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_session_server_close_ends_session() {
        let (reader, writer, server) = pair();
        drop(server);

        // Input that never ends
        let (_input_keepalive, input) = duplex(64);
        let input = tokio::io::BufReader::new(input);
        let mut out = Vec::new();
        let mut err = Vec::new();
        let end = run_session(reader, writer, input, &mut out, &mut err, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(end, SessionEnd::Closed);
    }

    #[tokio::test]
    async fn test_session_cancel_sends_exit() {
        let (reader, writer, mut server) = pair();
        let cancel_token = CancellationToken::new();
        cancel_token.cancel();

        let server_task = tokio::spawn(async move {
            assert_eq!(server.expect().await, WireMessage::exit());
            server.reply(WireMessage::exit()).await;
            server
        });

        let (_input_keepalive, input) = duplex(64);
        let input = tokio::io::BufReader::new(input);
        let mut out = Vec::new();
        let mut err = Vec::new();
        let end = run_session(reader, writer, input, &mut out, &mut err, cancel_token)
            .await
            .unwrap();
        assert_eq!(end, SessionEnd::Goodbye);
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_gives_up_after_retries() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig {
            socket_path: dir.path().join("missing.sock"),
            retries: 3,
            retry_delay: Duration::from_millis(5),
        };

        let err = connect_with_retry(&config).await.unwrap_err();
        assert!(matches!(err, ClientError::Connect { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_connect_succeeds_once_socket_appears() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("late.sock");
        let config = ClientConfig {
            socket_path: socket_path.clone(),
            retries: 50,
            retry_delay: Duration::from_millis(10),
        };

        let binder = tokio::spawn(async move {
            sleep(Duration::from_millis(30)).await;
            let listener = tokio::net::UnixListener::bind(&socket_path).unwrap();
            let _ = listener.accept().await.unwrap();
        });

        connect_with_retry(&config).await.unwrap();
        binder.await.unwrap();
    }
}

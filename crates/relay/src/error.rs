//! Error types for the relay client.
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use std::io;
use std::path::PathBuf;

use relay_protocol::{MessageKind, ProtocolError};
use thiserror::Error;

// ============================================================================
// Client Error Type
// ============================================================================

/// Relay client errors.
///
/// Connection errors mean the server is probably not running; rejection
/// errors carry the server's ERROR text verbatim so it can be shown to the
/// user as is.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The socket could not be reached within the retry budget.
    #[error("Failed to connect to {} after {attempts} attempts: {source}", path.display())]
    Connect {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    /// The server answered CONNECT with an ERROR.
    #[error("{0}")]
    Rejected(String),

    /// The server answered CONNECT with something other than OK or ERROR.
    #[error("Unexpected reply to CONNECT: {0}")]
    UnexpectedReply(MessageKind),

    /// Frame-level failure.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error passthrough (stdin, stdout).
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Convenience Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

//! Protocol errors.

use std::io;

use thiserror::Error;

/// Errors produced while reading, writing or interpreting frames.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Connection closed")]
    Closed,

    #[error("Connection closed in the middle of a frame")]
    Truncated,

    #[error("Unknown message type {0:#04x}")]
    UnknownKind(u8),

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Payload is missing its NUL terminator")]
    MissingTerminator,

    #[error("Malformed TO_ONE payload: {0}")]
    MalformedToOne(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// True when the error means the peer went away rather than misbehaved.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Closed | Self::Truncated => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}

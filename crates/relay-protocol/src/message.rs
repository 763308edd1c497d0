//! Protocol message types for client/server communication.

use std::borrow::Cow;
use std::fmt;

use relay_core::RelayError;

use crate::error::ProtocolError;

/// Message kinds, identified on the wire by a single byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// Handshake request carrying the username
    Connect = b'C',
    /// Handshake accepted
    Ok = b'0',
    /// Error report, payload is human-readable text
    Error = b'E',
    /// Unicast message
    ToOne = b'T',
    /// Broadcast message
    Bcast = b'B',
    /// Connected users query / reply
    List = b'L',
    /// Disconnect request or server goodbye
    Exit = b'X',
    /// Keep-alive, absorbed by the reader
    Ping = b'P',
}

impl MessageKind {
    /// Wire tag for this kind.
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// Maps a wire tag back to a kind.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'C' => Some(Self::Connect),
            b'0' => Some(Self::Ok),
            b'E' => Some(Self::Error),
            b'T' => Some(Self::ToOne),
            b'B' => Some(Self::Bcast),
            b'L' => Some(Self::List),
            b'X' => Some(Self::Exit),
            b'P' => Some(Self::Ping),
            _ => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connect => "CONNECT",
            Self::Ok => "OK",
            Self::Error => "ERROR",
            Self::ToOne => "TO_ONE",
            Self::Bcast => "BCAST",
            Self::List => "LIST",
            Self::Exit => "EXIT",
            Self::Ping => "PING",
        };
        f.write_str(name)
    }
}

/// A single frame: kind plus payload bytes (without the trailing NUL).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

impl WireMessage {
    /// Creates a message from a kind and raw payload.
    pub fn new(kind: MessageKind, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// Creates a payload-less message.
    pub fn empty(kind: MessageKind) -> Self {
        Self::new(kind, Vec::new())
    }

    /// Creates a handshake request.
    pub fn connect(username: &str) -> Self {
        Self::new(MessageKind::Connect, username)
    }

    /// Creates a handshake acceptance.
    pub fn ok() -> Self {
        Self::empty(MessageKind::Ok)
    }

    /// Creates an error reply from free text.
    pub fn error_text(text: impl Into<String>) -> Self {
        Self::new(MessageKind::Error, text.into())
    }

    /// Creates an error reply for a relay error.
    pub fn error(err: &RelayError) -> Self {
        Self::error_text(err.reply_text())
    }

    /// Creates a unicast request: payload is `receiver\0body`.
    pub fn to_one(receiver: &str, body: &str) -> Self {
        let mut payload = Vec::with_capacity(receiver.len() + body.len() + 1);
        payload.extend_from_slice(receiver.as_bytes());
        payload.push(0);
        payload.extend_from_slice(body.as_bytes());
        Self::new(MessageKind::ToOne, payload)
    }

    /// Creates a broadcast request.
    pub fn bcast(body: &str) -> Self {
        Self::new(MessageKind::Bcast, body)
    }

    /// Creates a connected users query.
    pub fn list() -> Self {
        Self::empty(MessageKind::List)
    }

    /// Creates a disconnect request / goodbye.
    pub fn exit() -> Self {
        Self::empty(MessageKind::Exit)
    }

    /// Creates a keep-alive frame.
    pub fn ping() -> Self {
        Self::empty(MessageKind::Ping)
    }

    /// Payload decoded as text, replacing invalid UTF-8.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Splits a TO_ONE payload into `(receiver, body)`.
    pub fn split_to_one(&self) -> Result<(String, String), ProtocolError> {
        let sep = self
            .payload
            .iter()
            .position(|b| *b == 0)
            .ok_or(ProtocolError::MalformedToOne("missing receiver separator"))?;

        let (receiver, rest) = self.payload.split_at(sep);
        if receiver.is_empty() {
            return Err(ProtocolError::MalformedToOne("empty receiver"));
        }

        let body = rest.get(1..).unwrap_or_default();
        Ok((
            String::from_utf8_lossy(receiver).into_owned(),
            String::from_utf8_lossy(body).into_owned(),
        ))
    }
}

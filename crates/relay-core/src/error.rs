//! Relay error taxonomy following panic-free policy.
//!
//! Every variant that concerns a peer can be rendered as the text of an
//! ERROR reply with [`RelayError::reply_text`]. Pipeline backpressure is not
//! an error: a full audit queue suspends the sender instead of failing.

use thiserror::Error;

/// Prefix carried by every ERROR reply payload.
pub const ERROR_PREFIX: &str = "[ERROR]";

/// Errors surfaced to clients or to the operator.
///
/// The `Display` text of the peer-facing variants is the body of the
/// ERROR reply, in `subject: description` form where a subject exists.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Malformed handshake or message
    #[error("protocol error: {reason}")]
    Protocol { reason: String },

    /// Username is not in the authorized list
    #[error("{username}: not a registered user")]
    UnknownUser { username: String },

    /// Username already has an open session
    #[error("{username}: username already in use")]
    AlreadyConnected { username: String },

    /// Recipient is known but has no open session
    #[error("{username}: user not connected")]
    UserNotConnected { username: String },

    /// Send to a specific recipient failed
    #[error("{username}: message not delivered due to a delivery failure")]
    DeliveryFailure { username: String },

    /// TO_ONE payload without a receiver
    #[error("malformed message: use '%ONE username message'")]
    MalformedToOne,

    /// Bind, listen or log-file failure before accepting work
    #[error("fatal startup error: {0}")]
    FatalStartup(String),
}

impl RelayError {
    /// Creates a protocol error.
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }

    /// Creates an unknown user error.
    pub fn unknown_user(username: impl Into<String>) -> Self {
        Self::UnknownUser {
            username: username.into(),
        }
    }

    /// Creates an already connected error.
    pub fn already_connected(username: impl Into<String>) -> Self {
        Self::AlreadyConnected {
            username: username.into(),
        }
    }

    /// Creates a user not connected error.
    pub fn user_not_connected(username: impl Into<String>) -> Self {
        Self::UserNotConnected {
            username: username.into(),
        }
    }

    /// Creates a delivery failure error.
    pub fn delivery_failure(username: impl Into<String>) -> Self {
        Self::DeliveryFailure {
            username: username.into(),
        }
    }

    /// Stable code for log fields.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Protocol { .. } => "protocol_error",
            Self::UnknownUser { .. } => "unknown_user",
            Self::AlreadyConnected { .. } => "already_connected",
            Self::UserNotConnected { .. } => "user_not_connected",
            Self::DeliveryFailure { .. } => "delivery_failure",
            Self::MalformedToOne => "malformed_to_one",
            Self::FatalStartup(_) => "fatal_startup",
        }
    }

    /// Payload text for an ERROR reply, e.g. `[ERROR] bob: user not connected`.
    pub fn reply_text(&self) -> String {
        format!("{ERROR_PREFIX} {self}")
    }
}

/// Result type for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;

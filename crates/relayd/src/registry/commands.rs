//! Registry actor commands and errors.
//!
//! - `RegistryCommand`: requests sent to the actor, each with a oneshot reply
//! - `RegistryError`: failures of registry operations

use std::time::Duration;

use relay_core::{RelayError, Username};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::locks::ConnId;

// ============================================================================
// Registry Commands
// ============================================================================

/// Commands sent to the registry actor.
#[derive(Debug)]
pub enum RegistryCommand {
    /// Resolve a username to its live connection, if any.
    ///
    /// # Errors
    /// - `RegistryError::UnknownUser` if the name is not authorized
    Lookup {
        username: String,
        respond_to: oneshot::Sender<Result<Option<ConnId>, RegistryError>>,
    },

    /// Mark a disconnected user as connected on `conn`.
    ///
    /// # Errors
    /// - `RegistryError::UnknownUser` if the name is not authorized
    /// - `RegistryError::AlreadyConnected` if the user is already bound
    Bind {
        username: String,
        conn: ConnId,
        respond_to: oneshot::Sender<Result<Username, RegistryError>>,
    },

    /// Mark a connected user as disconnected.
    ///
    /// Responds with the released handle and how long the user was online.
    ///
    /// # Errors
    /// - `RegistryError::UnknownUser` if the name is not authorized
    /// - `RegistryError::NotConnected` if the user is not bound
    Unbind {
        username: Username,
        respond_to: oneshot::Sender<Result<(ConnId, Duration), RegistryError>>,
    },

    /// Snapshot of every connected user with its handle, in registry order.
    ConnectedTargets {
        respond_to: oneshot::Sender<Vec<(Username, ConnId)>>,
    },

    /// Unbind every connected user at once, returning what was bound.
    DisconnectAll {
        respond_to: oneshot::Sender<Vec<(Username, ConnId)>>,
    },

    /// Counts of `(authorized, connected)` users.
    Count {
        respond_to: oneshot::Sender<(usize, usize)>,
    },
}

// ============================================================================
// Registry Errors
// ============================================================================

/// Errors from registry operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("not a registered user: {0}")]
    UnknownUser(String),

    #[error("user already connected: {0}")]
    AlreadyConnected(String),

    #[error("user not connected: {0}")]
    NotConnected(String),

    #[error("registry channel closed")]
    ChannelClosed,
}

impl RegistryError {
    /// Maps this failure onto the client-visible error for `username`.
    ///
    /// Returns `None` for internal failures that have no client reply.
    pub fn to_relay_error(&self) -> Option<RelayError> {
        match self {
            Self::UnknownUser(name) => Some(RelayError::unknown_user(name)),
            Self::AlreadyConnected(name) => Some(RelayError::already_connected(name)),
            Self::NotConnected(name) => Some(RelayError::user_not_connected(name)),
            Self::ChannelClosed => None,
        }
    }
}

//! Client interface for the registry actor.
//!
//! # Panic-Free Guarantees
//!
//! Channel errors are mapped to `RegistryError::ChannelClosed`; nothing here
//! unwraps.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use relay_core::Username;

use super::commands::{RegistryCommand, RegistryError};
use crate::locks::ConnId;

/// Cheap-to-clone handle for talking to the registry actor.
#[derive(Clone)]
pub struct RegistryHandle {
    sender: mpsc::Sender<RegistryCommand>,
}

impl RegistryHandle {
    pub fn new(sender: mpsc::Sender<RegistryCommand>) -> Self {
        Self { sender }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RegistryCommand,
    ) -> Result<T, RegistryError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;
        rx.await.map_err(|_| RegistryError::ChannelClosed)
    }

    /// Resolves `username` to its live connection.
    ///
    /// `Ok(None)` means the user is authorized but not connected.
    pub async fn lookup(&self, username: &str) -> Result<Option<ConnId>, RegistryError> {
        self.request(|respond_to| RegistryCommand::Lookup {
            username: username.to_string(),
            respond_to,
        })
        .await?
    }

    /// Marks `username` as connected on `conn`.
    ///
    /// # Errors
    ///
    /// - `RegistryError::UnknownUser` if the name is not authorized
    /// - `RegistryError::AlreadyConnected` if the user already has a session
    pub async fn bind(&self, username: &str, conn: ConnId) -> Result<Username, RegistryError> {
        self.request(|respond_to| RegistryCommand::Bind {
            username: username.to_string(),
            conn,
            respond_to,
        })
        .await?
    }

    /// Marks `username` as disconnected, returning the released handle and
    /// the time the user was online.
    ///
    /// Exactly one caller wins for a given session: a second unbind, or an
    /// unbind racing [`RegistryHandle::disconnect_all`], gets `NotConnected`.
    pub async fn unbind(&self, username: &Username) -> Result<(ConnId, Duration), RegistryError> {
        self.request(|respond_to| RegistryCommand::Unbind {
            username: username.clone(),
            respond_to,
        })
        .await?
    }

    /// Snapshot of connected users and their handles.
    pub async fn connected_targets(&self) -> Result<Vec<(Username, ConnId)>, RegistryError> {
        self.request(|respond_to| RegistryCommand::ConnectedTargets { respond_to })
            .await
    }

    /// Unbinds every connected user, returning what was bound.
    pub async fn disconnect_all(&self) -> Result<Vec<(Username, ConnId)>, RegistryError> {
        self.request(|respond_to| RegistryCommand::DisconnectAll { respond_to })
            .await
    }

    /// `(authorized, connected)` user counts.
    pub async fn count(&self) -> Result<(usize, usize), RegistryError> {
        self.request(|respond_to| RegistryCommand::Count { respond_to })
            .await
    }
}

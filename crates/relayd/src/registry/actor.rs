//! Registry actor - owns the authorized users and their connection state.
//!
//! The actor is the single owner of the user table. Commands arrive on an
//! mpsc channel and are processed one at a time, so every check-and-set
//! (for example "is this user free? then bind it") is atomic with respect
//! to every other registry operation.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()` or direct indexing
//! - Reply send failures are ignored: the requester may have gone away

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info};

use relay_core::{AuthorizedUsers, Username};

use super::commands::{RegistryCommand, RegistryError};
use crate::locks::ConnId;

// ============================================================================
// Session State
// ============================================================================

/// Connection state of one authorized user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected { conn: ConnId, since: DateTime<Utc> },
}

#[derive(Debug)]
struct Session {
    username: Username,
    state: SessionState,
}

// ============================================================================
// Registry Actor
// ============================================================================

/// The registry actor.
///
/// Users are stored in file order; `index` maps a name to its position.
/// The set of users never changes after startup, only their state.
pub struct RegistryActor {
    receiver: mpsc::Receiver<RegistryCommand>,
    sessions: Vec<Session>,
    index: HashMap<Username, usize>,
}

impl RegistryActor {
    /// Creates an actor holding every authorized user, all disconnected.
    pub fn new(users: AuthorizedUsers, receiver: mpsc::Receiver<RegistryCommand>) -> Self {
        let sessions: Vec<Session> = users
            .into_iter()
            .map(|username| Session {
                username,
                state: SessionState::Disconnected,
            })
            .collect();
        let index = sessions
            .iter()
            .enumerate()
            .map(|(i, s)| (s.username.clone(), i))
            .collect();

        Self {
            receiver,
            sessions,
            index,
        }
    }

    /// Runs the actor loop until every handle is dropped.
    pub async fn run(mut self) {
        info!(users = self.sessions.len(), "Registry actor starting");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!(
            connected = self.connected_count(),
            "Registry actor stopped"
        );
    }

    fn handle_command(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::Lookup {
                username,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_lookup(&username));
            }
            RegistryCommand::Bind {
                username,
                conn,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_bind(&username, conn));
            }
            RegistryCommand::Unbind {
                username,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_unbind(&username));
            }
            RegistryCommand::ConnectedTargets { respond_to } => {
                let _ = respond_to.send(self.connected_targets());
            }
            RegistryCommand::DisconnectAll { respond_to } => {
                let _ = respond_to.send(self.handle_disconnect_all());
            }
            RegistryCommand::Count { respond_to } => {
                let _ = respond_to.send((self.sessions.len(), self.connected_count()));
            }
        }
    }

    // ========================================================================
    // Command Handlers
    // ========================================================================

    fn session_mut(&mut self, username: &str) -> Result<&mut Session, RegistryError> {
        let idx = self
            .index
            .get(username)
            .copied()
            .ok_or_else(|| RegistryError::UnknownUser(username.to_string()))?;
        self.sessions
            .get_mut(idx)
            .ok_or_else(|| RegistryError::UnknownUser(username.to_string()))
    }

    fn handle_lookup(&mut self, username: &str) -> Result<Option<ConnId>, RegistryError> {
        let session = self.session_mut(username)?;
        Ok(match session.state {
            SessionState::Connected { conn, .. } => Some(conn),
            SessionState::Disconnected => None,
        })
    }

    fn handle_bind(&mut self, username: &str, conn: ConnId) -> Result<Username, RegistryError> {
        let session = self.session_mut(username)?;
        if let SessionState::Connected { .. } = session.state {
            return Err(RegistryError::AlreadyConnected(username.to_string()));
        }

        session.state = SessionState::Connected {
            conn,
            since: Utc::now(),
        };
        let username = session.username.clone();
        debug!(%username, %conn, "User bound");
        Ok(username)
    }

    fn handle_unbind(&mut self, username: &Username) -> Result<(ConnId, Duration), RegistryError> {
        let session = self.session_mut(username.as_str())?;
        let SessionState::Connected { conn, since } = session.state else {
            return Err(RegistryError::NotConnected(username.to_string()));
        };

        session.state = SessionState::Disconnected;
        let online = (Utc::now() - since).to_std().unwrap_or_default();
        debug!(%username, %conn, online_secs = online.as_secs(), "User unbound");
        Ok((conn, online))
    }

    fn connected_targets(&self) -> Vec<(Username, ConnId)> {
        self.sessions
            .iter()
            .filter_map(|s| match s.state {
                SessionState::Connected { conn, .. } => Some((s.username.clone(), conn)),
                SessionState::Disconnected => None,
            })
            .collect()
    }

    fn handle_disconnect_all(&mut self) -> Vec<(Username, ConnId)> {
        let targets = self.connected_targets();
        for session in &mut self.sessions {
            session.state = SessionState::Disconnected;
        }
        if !targets.is_empty() {
            info!(count = targets.len(), "Disconnected all users");
        }
        targets
    }

    fn connected_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|s| matches!(s.state, SessionState::Connected { .. }))
            .count()
    }

    /// State of `username`, for tests.
    #[cfg(test)]
    pub fn state_of(&self, username: &str) -> Option<SessionState> {
        self.index
            .get(username)
            .and_then(|idx| self.sessions.get(*idx))
            .map(|s| s.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locks::SessionLockTable;
    use tokio::sync::oneshot;

    fn create_actor() -> RegistryActor {
        let users = AuthorizedUsers::parse("alice\nbob\ncarol\n").unwrap();
        let (_cmd_tx, cmd_rx) = mpsc::channel(16);
        RegistryActor::new(users, cmd_rx)
    }

    async fn conn_ids(n: usize) -> Vec<ConnId> {
        let table = SessionLockTable::<Vec<u8>>::new();
        let mut edit = table.edit().await;
        (0..n).map(|_| edit.insert(Vec::new()).unwrap()).collect()
    }

    fn bind(actor: &mut RegistryActor, name: &str, conn: ConnId) -> Result<Username, RegistryError> {
        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::Bind {
            username: name.to_string(),
            conn,
            respond_to: tx,
        });
        rx.try_recv().unwrap()
    }

    #[tokio::test]
    async fn test_bind_then_lookup() {
        let mut actor = create_actor();
        let conn = conn_ids(1).await[0];

        let name = bind(&mut actor, "bob", conn).unwrap();
        assert_eq!(name.as_str(), "bob");
        assert!(matches!(
            actor.state_of("bob"),
            Some(SessionState::Connected { conn: c, .. }) if c == conn
        ));

        let (tx, rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::Lookup {
            username: "bob".to_string(),
            respond_to: tx,
        });
        assert_eq!(rx.await.unwrap(), Ok(Some(conn)));
    }

    #[tokio::test]
    async fn test_lookup_disconnected_and_unknown() {
        let mut actor = create_actor();

        let (tx, rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::Lookup {
            username: "carol".to_string(),
            respond_to: tx,
        });
        assert_eq!(rx.await.unwrap(), Ok(None));

        let (tx, rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::Lookup {
            username: "zed".to_string(),
            respond_to: tx,
        });
        assert_eq!(
            rx.await.unwrap(),
            Err(RegistryError::UnknownUser("zed".to_string()))
        );
    }

    #[tokio::test]
    async fn test_bind_twice_fails() {
        let mut actor = create_actor();
        let ids = conn_ids(2).await;

        bind(&mut actor, "alice", ids[0]).unwrap();
        assert_eq!(
            bind(&mut actor, "alice", ids[1]),
            Err(RegistryError::AlreadyConnected("alice".to_string()))
        );
        // Original binding untouched
        assert!(matches!(
            actor.state_of("alice"),
            Some(SessionState::Connected { conn, .. }) if conn == ids[0]
        ));
    }

    #[tokio::test]
    async fn test_bind_unknown_user() {
        let mut actor = create_actor();
        let conn = conn_ids(1).await[0];
        assert_eq!(
            bind(&mut actor, "mallory", conn),
            Err(RegistryError::UnknownUser("mallory".to_string()))
        );
    }

    #[tokio::test]
    async fn test_unbind_then_rebind() {
        let mut actor = create_actor();
        let ids = conn_ids(2).await;
        bind(&mut actor, "bob", ids[0]).unwrap();

        let (tx, rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::Unbind {
            username: Username::parse("bob").unwrap(),
            respond_to: tx,
        });
        let (conn, _) = rx.await.unwrap().unwrap();
        assert_eq!(conn, ids[0]);
        assert_eq!(actor.state_of("bob"), Some(SessionState::Disconnected));

        // Second unbind reports not connected
        let (tx, rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::Unbind {
            username: Username::parse("bob").unwrap(),
            respond_to: tx,
        });
        assert_eq!(
            rx.await.unwrap(),
            Err(RegistryError::NotConnected("bob".to_string()))
        );

        bind(&mut actor, "bob", ids[1]).unwrap();
        assert!(matches!(
            actor.state_of("bob"),
            Some(SessionState::Connected { conn, .. }) if conn == ids[1]
        ));
    }

    #[tokio::test]
    async fn test_connected_targets_in_file_order() {
        let mut actor = create_actor();
        let ids = conn_ids(2).await;
        bind(&mut actor, "carol", ids[0]).unwrap();
        bind(&mut actor, "alice", ids[1]).unwrap();

        let (tx, rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::ConnectedTargets { respond_to: tx });
        let targets = rx.await.unwrap();
        let names: Vec<_> = targets.iter().map(|(u, _)| u.as_str()).collect();
        assert_eq!(names, vec!["alice", "carol"]);
    }

    #[tokio::test]
    async fn test_disconnect_all() {
        let mut actor = create_actor();
        let ids = conn_ids(2).await;
        bind(&mut actor, "alice", ids[0]).unwrap();
        bind(&mut actor, "bob", ids[1]).unwrap();

        let (tx, rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::DisconnectAll { respond_to: tx });
        assert_eq!(rx.await.unwrap().len(), 2);

        let (tx, rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::Count { respond_to: tx });
        assert_eq!(rx.await.unwrap(), (3, 0));
    }
}

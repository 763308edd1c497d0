//! User registry using the actor pattern.
//!
//! The registry holds every authorized user and whether that user currently
//! has a session. It is the only place that decides "is this name free?",
//! and because the actor processes commands one at a time, two handshakes
//! for the same name can never both win.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐  RegistryCommand   ┌─────────────────┐
//! │ Dispatcher /    │───────────────────▶│  RegistryActor  │
//! │ Workers         │  (mpsc + oneshot)  │ Vec<Session> in │
//! └─────────────────┘                    │ file order      │
//!                                        └─────────────────┘
//! ```

use std::path::Path;

use tokio::sync::mpsc;

use relay_core::{AuthorizedUsers, UsersFileError};

mod actor;
mod commands;
mod handle;

pub use actor::{RegistryActor, SessionState};
pub use commands::{RegistryCommand, RegistryError};
pub use handle::RegistryHandle;

/// Command channel buffer size
const COMMAND_BUFFER: usize = 100;

/// Spawns the registry actor over `users` and returns a handle to it.
///
/// The actor stops once every handle has been dropped.
pub fn spawn_registry(users: AuthorizedUsers) -> RegistryHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let actor = RegistryActor::new(users, cmd_rx);
    tokio::spawn(actor.run());

    RegistryHandle::new(cmd_tx)
}

/// Loads the authorized-users file and spawns a registry over it.
///
/// Returns the handle together with the number of users loaded. Fails
/// without spawning anything if the file is unreadable, has a bad line or
/// lists nobody.
pub fn load_registry(path: impl AsRef<Path>) -> Result<(RegistryHandle, usize), UsersFileError> {
    let users = AuthorizedUsers::load(path)?;
    let count = users.len();
    Ok((spawn_registry(users), count))
}

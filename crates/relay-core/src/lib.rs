//! Relay Core - Shared types for the local message relay
//!
//! This crate provides the domain types shared between the server
//! (relayd) and the client (relay).
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod error;
pub mod user;
pub mod users;

// Re-exports for convenience
pub use error::{RelayError, RelayResult};
pub use user::{Username, UsernameError, MAX_USERNAME_LEN};
pub use users::{AuthorizedUsers, UsersFileError};

//! relay-cli - interactive client for the local message relay
//!
//! The client connects to the relay socket, performs the CONNECT
//! handshake and then runs one session loop:
//!
//! 1. **Socket reader task**: reads frames and forwards them to the loop
//! 2. **Session loop**: prints server frames and sends parsed stdin commands
//!
//! The loop ends when the server says goodbye or closes the socket.

pub mod client;
pub mod command;
pub mod error;

pub use client::{connect_with_retry, handshake, run_session, ClientConfig, SessionEnd};
pub use command::{parse_line, Command, UsageError};
pub use error::{ClientError, Result};

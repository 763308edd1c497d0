//! Server configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audit::DEFAULT_AUDIT_CAPACITY;

/// Default socket path
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/relay.sock";

/// Write timeout (10 seconds)
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Time a new connection gets to send CONNECT (30 seconds)
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest a handshake waits for the table barrier (5 seconds)
pub const DEFAULT_BARRIER_TIMEOUT: Duration = Duration::from_secs(5);

/// Runtime settings for [`crate::server::RelayServer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub socket_path: PathBuf,
    pub audit_capacity: usize,
    pub write_timeout: Duration,
    pub handshake_timeout: Duration,
    pub barrier_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            audit_capacity: DEFAULT_AUDIT_CAPACITY,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            barrier_timeout: DEFAULT_BARRIER_TIMEOUT,
        }
    }
}

impl ServerConfig {
    pub fn with_socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = path.into();
        self
    }

    pub fn with_audit_capacity(mut self, capacity: usize) -> Self {
        self.audit_capacity = capacity;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_barrier_timeout(mut self, timeout: Duration) -> Self {
        self.barrier_timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

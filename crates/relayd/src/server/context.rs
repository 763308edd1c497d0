//! Shared server state handed to the dispatcher, every worker and the
//! shutdown coordinator.
//!
//! The registry, lock table and summary are guarded independently. When an
//! operation touches more than one of them it follows a fixed order: bind
//! before adding to the summary, remove from the table before removing from
//! the summary.
//!
//! A write that fails or stalls part way through a frame is fatal for that
//! connection: the slot is poisoned so nothing else reaches the corrupted
//! stream, and the owning worker is told to tear the session down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWrite;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::Mutex;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::warn;

use relay_protocol::{write_message, ProtocolError, WireMessage};

use crate::audit::AuditPipeline;
use crate::config::ServerConfig;
use crate::locks::{ConnId, LockError, SessionLockTable};
use crate::registry::RegistryHandle;
use crate::summary::ConnectedSummary;

/// Why a frame could not be written to a connection.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("connection unavailable: {0}")]
    Lock(#[from] LockError),

    #[error("write failed: {0}")]
    Write(#[from] ProtocolError),

    #[error("send lock not acquired within {0:?}")]
    LockTimeout(Duration),

    #[error("write timed out after {0:?}")]
    Timeout(Duration),
}

impl DeliveryError {
    /// True when the recipient's handle is gone, i.e. it disconnected after
    /// it was looked up.
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::Lock(LockError::UnknownHandle(_)))
    }

    /// True when the connection can no longer carry frames.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Write(_) | Self::Timeout(_) | Self::Lock(LockError::Poisoned(_))
        )
    }
}

/// Everything the relay shares between tasks.
///
/// Generic over the connection writer so routing can be exercised against
/// in-memory streams.
pub struct ServerContext<W = OwnedWriteHalf> {
    config: ServerConfig,
    registry: RegistryHandle,
    locks: SessionLockTable<W>,
    summary: ConnectedSummary,
    audit: AuditPipeline,
    shutting_down: AtomicBool,
    tracker: TaskTracker,
    workers: CancellationToken,
    evictions: Mutex<HashMap<ConnId, CancellationToken>>,
}

impl<W> ServerContext<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(config: ServerConfig, registry: RegistryHandle, audit: AuditPipeline) -> Self {
        Self {
            config,
            registry,
            locks: SessionLockTable::new(),
            summary: ConnectedSummary::new(),
            audit,
            shutting_down: AtomicBool::new(false),
            tracker: TaskTracker::new(),
            workers: CancellationToken::new(),
            evictions: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    pub fn locks(&self) -> &SessionLockTable<W> {
        &self.locks
    }

    pub fn summary(&self) -> &ConnectedSummary {
        &self.summary
    }

    pub fn audit(&self) -> &AuditPipeline {
        &self.audit
    }

    /// Tracks dispatcher and worker tasks so shutdown can wait for them.
    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Cancelled once, when workers must stop at their next receive point.
    pub fn workers_token(&self) -> &CancellationToken {
        &self.workers
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Raises the shutdown flag. Returns false if it was already raised.
    pub fn begin_shutdown(&self) -> bool {
        !self.shutting_down.swap(true, Ordering::SeqCst)
    }

    /// Token cancelled when `conn` must be torn down by its worker.
    pub async fn eviction_token(&self, conn: ConnId) -> CancellationToken {
        self.evictions
            .lock()
            .await
            .entry(conn)
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    /// Asks the worker owning `conn` to disconnect it.
    pub async fn evict(&self, conn: ConnId) {
        if let Some(token) = self.evictions.lock().await.get(&conn) {
            token.cancel();
        }
    }

    /// Drops the eviction token of a removed connection.
    pub async fn forget(&self, conn: ConnId) {
        self.evictions.lock().await.remove(&conn);
    }

    /// Sends one frame to `conn` under its element lock.
    ///
    /// Waiting for the lock and writing share one write timeout. A failed or
    /// stalled write poisons the slot and evicts the connection, so a later
    /// send can never land behind a partial frame.
    pub async fn send(&self, conn: ConnId, msg: &WireMessage) -> Result<(), DeliveryError> {
        let limit = self.config.write_timeout;
        let deadline = Instant::now() + limit;

        let mut guard = timeout_at(deadline, self.locks.acquire(conn))
            .await
            .map_err(|_| DeliveryError::LockTimeout(limit))??;

        let err = match timeout_at(deadline, write_message(&mut *guard, msg)).await {
            Ok(Ok(())) => {
                guard.release();
                return Ok(());
            }
            Ok(Err(e)) => DeliveryError::Write(e),
            Err(_) => DeliveryError::Timeout(limit),
        };

        guard.poison();
        warn!(%conn, error = %err, "Connection poisoned, evicting");
        self.evict(conn).await;
        Err(err)
    }
}

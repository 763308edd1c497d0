//! Audit pipeline - bounded queue plus a single log writer task.
//!
//! Every delivered TO_ONE or BCAST copy becomes one [`AuditRecord`]. The
//! queue is a bounded mpsc channel: when it is full, [`AuditPipeline::enqueue`]
//! suspends the sending worker until the writer catches up, so message
//! throughput is tied to how fast the log can be flushed.
//!
//! The writer appends `sender:receiver:body\n` and flushes after each line.
//! On shutdown it stops accepting records, drains what is queued, and only
//! then exits.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Default queue capacity.
pub const DEFAULT_AUDIT_CAPACITY: usize = 64;

/// Errors from the audit pipeline.
#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Failed to open audit log {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Audit pipeline is closed")]
    Closed,

    #[error("Audit writer task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Whether a record came from a unicast or a broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditKind {
    Direct,
    Broadcast,
}

/// One delivered message copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    pub sender: String,
    pub receiver: String,
    pub body: String,
    pub kind: AuditKind,
}

impl AuditRecord {
    pub fn direct(sender: &str, receiver: &str, body: &str) -> Self {
        Self {
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            body: body.to_string(),
            kind: AuditKind::Direct,
        }
    }

    pub fn broadcast(sender: &str, receiver: &str, body: &str) -> Self {
        Self {
            kind: AuditKind::Broadcast,
            ..Self::direct(sender, receiver, body)
        }
    }
}

impl fmt::Display for AuditRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.sender, self.receiver, self.body)
    }
}

/// Handle to the running audit pipeline.
pub struct AuditPipeline {
    tx: mpsc::Sender<AuditRecord>,
    stop: CancellationToken,
    writer: Mutex<Option<JoinHandle<u64>>>,
    path: PathBuf,
}

impl AuditPipeline {
    /// Truncates (or creates) the log at `path` and starts the writer.
    ///
    /// A capacity of zero is raised to one.
    pub async fn start(path: impl AsRef<Path>, capacity: usize) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await
            .map_err(|source| AuditError::Open {
                path: path.clone(),
                source,
            })?;

        let (tx, rx) = mpsc::channel(capacity.max(1));
        let stop = CancellationToken::new();
        let writer = tokio::spawn(run_writer(file, rx, stop.clone()));

        info!(path = %path.display(), capacity = capacity.max(1), "Audit pipeline started");

        Ok(Self {
            tx,
            stop,
            writer: Mutex::new(Some(writer)),
            path,
        })
    }

    /// Queues one record, suspending while the queue is full.
    pub async fn enqueue(&self, record: AuditRecord) -> Result<(), AuditError> {
        self.tx.send(record).await.map_err(|_| AuditError::Closed)
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stops the writer after it has written every queued record.
    ///
    /// Returns the number of lines written over the pipeline's life. Later
    /// calls return zero.
    pub async fn shutdown(&self) -> Result<u64, AuditError> {
        let Some(writer) = self.writer.lock().await.take() else {
            return Ok(0);
        };
        self.stop.cancel();
        let written = writer.await?;
        info!(written, path = %self.path.display(), "Audit pipeline stopped");
        Ok(written)
    }
}

async fn run_writer(
    mut file: File,
    mut rx: mpsc::Receiver<AuditRecord>,
    stop: CancellationToken,
) -> u64 {
    let mut written = 0u64;

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            record = rx.recv() => match record {
                Some(record) => written += write_record(&mut file, &record).await,
                None => break,
            },
        }
    }

    // No new records from here on; drain what is already queued
    rx.close();
    let mut drained = 0usize;
    while let Some(record) = rx.recv().await {
        written += write_record(&mut file, &record).await;
        drained += 1;
    }
    if drained > 0 {
        debug!(drained, "Audit queue drained on shutdown");
    }

    if let Err(e) = file.sync_all().await {
        warn!(error = %e, "Failed to sync audit log");
    }
    written
}

async fn write_record(file: &mut File, record: &AuditRecord) -> u64 {
    let line = format!("{record}\n");
    let result = match file.write_all(line.as_bytes()).await {
        Ok(()) => file.flush().await,
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => {
            trace!(kind = ?record.kind, sender = %record.sender, receiver = %record.receiver, "Audit line written");
            1
        }
        Err(e) => {
            error!(error = %e, sender = %record.sender, receiver = %record.receiver, "Failed to write audit line");
            0
        }
    }
}

//! Session lock table - two-level locking over connection writers.
//!
//! Every connected session owns one slot holding the write side of its
//! socket. Two lock levels cooperate over the same table:
//!
//! - **Element lock**: [`SessionLockTable::acquire`] grants exclusive send
//!   access to one slot. Sends to different slots proceed in parallel.
//! - **Table barrier**: [`SessionLockTable::edit`] grants exclusive access
//!   to the whole table. Only an [`EditGuard`] can insert or remove slots.
//!
//! ```text
//!            RwLock<Slots>  (fair, FIFO)
//!   ┌──────────────┬──────────────┬──────────────┐
//!   │ slot 0       │ slot 1       │ slot 2       │
//!   │ Mutex<W>     │ (free, gen 3)│ Mutex<W>     │
//!   └──────────────┴──────────────┴──────────────┘
//!   acquire(id) = read guard on table + lock on slot mutex
//!   edit()      = write guard on table
//! ```
//!
//! The barrier waits for every outstanding element guard, and because the
//! table lock is fair, once a barrier request is queued no later element
//! acquisition is admitted ahead of it. Structural edits can therefore not
//! be starved by send traffic, and never race an in-flight send.
//!
//! A caller must never hold a [`SendGuard`] while acquiring another guard
//! from the same table: a queued barrier would block the second request
//! while the first is still held.
//!
//! A send that fails part way leaves the stream mid-frame. The sender marks
//! the slot with [`SendGuard::poison`]; every later `acquire` fails with
//! [`LockError::Poisoned`] until the slot is removed.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tokio::time::timeout;

/// Handle to a slot in the lock table.
///
/// The generation makes handles to a recycled slot detectably stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId {
    index: u32,
    generation: u32,
}

impl ConnId {
    /// Slot index, for diagnostics.
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}.{}", self.index, self.generation)
    }
}

/// Errors from lock table operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("unknown connection handle {0}")]
    UnknownHandle(ConnId),

    #[error("connection handle {0} is still in use")]
    Busy(ConnId),

    #[error("connection {0} was poisoned by a failed write")]
    Poisoned(ConnId),

    #[error("table barrier not acquired within {0:?}")]
    BarrierTimeout(Duration),

    #[error("lock table is full")]
    TableFull,
}

struct Entry<W> {
    writer: W,
    poisoned: bool,
}

struct Slot<W> {
    generation: u32,
    cell: Option<Arc<Mutex<Entry<W>>>>,
}

struct Slots<W> {
    entries: Vec<Slot<W>>,
    free: Vec<u32>,
    live: usize,
}

impl<W> Slots<W> {
    fn get(&self, id: ConnId) -> Option<&Arc<Mutex<Entry<W>>>> {
        self.entries
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.cell.as_ref())
    }
}

/// Table of connection writers with per-slot send locks and a global
/// structural-edit barrier.
pub struct SessionLockTable<W> {
    slots: Arc<RwLock<Slots<W>>>,
}

impl<W> Default for SessionLockTable<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W> SessionLockTable<W> {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            slots: Arc::new(RwLock::new(Slots {
                entries: Vec::new(),
                free: Vec::new(),
                live: 0,
            })),
        }
    }

    /// Acquires exclusive send access to one connection.
    ///
    /// Suspends while another task holds the slot or while the barrier is
    /// held or requested. Fails for handles that were never issued or have
    /// since been removed, and for poisoned slots.
    pub async fn acquire(&self, id: ConnId) -> Result<SendGuard<W>, LockError> {
        let table = Arc::clone(&self.slots).read_owned().await;
        let cell = table.get(id).cloned().ok_or(LockError::UnknownHandle(id))?;
        let writer = cell.lock_owned().await;
        if writer.poisoned {
            return Err(LockError::Poisoned(id));
        }
        Ok(SendGuard {
            writer,
            _table: table,
            id,
        })
    }

    /// Acquires the table barrier.
    ///
    /// Suspends until no element guard is outstanding and every earlier
    /// barrier request has been served.
    pub async fn edit(&self) -> EditGuard<W> {
        EditGuard {
            slots: Arc::clone(&self.slots).write_owned().await,
        }
    }

    /// Acquires the table barrier, giving up after `limit`.
    pub async fn edit_timeout(&self, limit: Duration) -> Result<EditGuard<W>, LockError> {
        timeout(limit, self.edit())
            .await
            .map_err(|_| LockError::BarrierTimeout(limit))
    }

    /// Number of live connection slots.
    pub async fn len(&self) -> usize {
        self.slots.read().await.live
    }

    /// True when no connection slot is live.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Exclusive send access to one connection writer.
///
/// Holding it also holds a shared reference on the table, which keeps the
/// barrier away. Release with [`SendGuard::release`] or by dropping it.
pub struct SendGuard<W> {
    // Field order matters: the slot lock is released before the table guard.
    writer: OwnedMutexGuard<Entry<W>>,
    _table: OwnedRwLockReadGuard<Slots<W>>,
    id: ConnId,
}

impl<W> SendGuard<W> {
    /// Handle this guard was acquired for.
    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Gives up send access. Consumes the guard, so it cannot be released twice.
    pub fn release(self) {}

    /// Gives up send access and refuses every later send to this slot.
    ///
    /// Used when a write failed or stalled mid-frame. The writer stays in the
    /// table so the owner's disconnect path can still remove and close it.
    pub fn poison(mut self) {
        self.writer.poisoned = true;
    }
}

impl<W> Deref for SendGuard<W> {
    type Target = W;

    fn deref(&self) -> &W {
        &self.writer.writer
    }
}

impl<W> DerefMut for SendGuard<W> {
    fn deref_mut(&mut self) -> &mut W {
        &mut self.writer.writer
    }
}

/// Exclusive structural access to the table (the barrier).
pub struct EditGuard<W> {
    slots: OwnedRwLockWriteGuard<Slots<W>>,
}

impl<W> EditGuard<W> {
    /// Registers a new connection writer and returns its handle.
    pub fn insert(&mut self, writer: W) -> Result<ConnId, LockError> {
        let cell = Some(Arc::new(Mutex::new(Entry {
            writer,
            poisoned: false,
        })));

        let id = match self.slots.free.pop() {
            Some(index) => {
                let slot = self
                    .slots
                    .entries
                    .get_mut(index as usize)
                    .ok_or(LockError::TableFull)?;
                slot.cell = cell;
                ConnId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index =
                    u32::try_from(self.slots.entries.len()).map_err(|_| LockError::TableFull)?;
                self.slots.entries.push(Slot {
                    generation: 0,
                    cell,
                });
                ConnId {
                    index,
                    generation: 0,
                }
            }
        };

        self.slots.live += 1;
        Ok(id)
    }

    /// Removes a connection and hands its writer back to the caller.
    ///
    /// The slot is recycled under a new generation.
    pub fn remove(&mut self, id: ConnId) -> Result<W, LockError> {
        let slot = self
            .slots
            .entries
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .ok_or(LockError::UnknownHandle(id))?;

        let cell = slot.cell.take().ok_or(LockError::UnknownHandle(id))?;
        let mutex = match Arc::try_unwrap(cell) {
            Ok(mutex) => mutex,
            Err(cell) => {
                slot.cell = Some(cell);
                return Err(LockError::Busy(id));
            }
        };

        slot.generation = slot.generation.wrapping_add(1);
        self.slots.free.push(id.index);
        self.slots.live -= 1;
        Ok(mutex.into_inner().writer)
    }

    /// Direct access to a writer while the barrier is held.
    ///
    /// No element guard can exist under the barrier, so this never waits.
    pub fn get_mut(&mut self, id: ConnId) -> Result<&mut W, LockError> {
        let cell = self
            .slots
            .entries
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.cell.as_mut())
            .ok_or(LockError::UnknownHandle(id))?;
        Arc::get_mut(cell)
            .map(|mutex| &mut mutex.get_mut().writer)
            .ok_or(LockError::Busy(id))
    }

    /// True if `id` refers to a live slot.
    pub fn contains(&self, id: ConnId) -> bool {
        self.slots.get(id).is_some()
    }

    /// Removes every live connection, returning handles and writers.
    pub fn drain(&mut self) -> Vec<(ConnId, W)> {
        let ids: Vec<ConnId> = self
            .slots
            .entries
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.cell.is_some())
            .filter_map(|(index, slot)| {
                u32::try_from(index).ok().map(|index| ConnId {
                    index,
                    generation: slot.generation,
                })
            })
            .collect();

        ids.into_iter()
            .filter_map(|id| self.remove(id).ok().map(|writer| (id, writer)))
            .collect()
    }

    /// Number of live connection slots.
    pub fn len(&self) -> usize {
        self.slots.live
    }

    /// True when no connection slot is live.
    pub fn is_empty(&self) -> bool {
        self.slots.live == 0
    }
}

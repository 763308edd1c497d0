//! relayd - local multi-user message relay server
//!
//! - `registry` - actor owning the authorized users and their connection state
//! - `locks` - session lock table: per-connection send locks plus a table barrier
//! - `summary` - the connected-users text returned by LIST
//! - `audit` - bounded audit queue and its single log writer
//! - `server` - Unix socket dispatcher, workers, routing and shutdown
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         relayd                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐     ┌─────────────────────────────┐    │
//! │  │  RelayServer    │────▶│     RegistryActor           │    │
//! │  │ (Unix Socket)   │     │  (user state owner)         │    │
//! │  └────────┬────────┘     └─────────────────────────────┘    │
//! │           │ one task per connection                         │
//! │           ▼                                                 │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐    │
//! │  │ Worker + Router │────▶│ SessionLockTable ──▶ sockets │    │
//! │  │  (per user)     │────▶│ AuditPipeline   ──▶ log file │    │
//! │  └─────────────────┘     └─────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//!   outside tests
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod audit;
pub mod config;
pub mod locks;
pub mod registry;
pub mod server;
pub mod summary;

pub use audit::{AuditError, AuditPipeline, AuditRecord};
pub use config::ServerConfig;
pub use registry::{load_registry, spawn_registry, RegistryHandle};
pub use server::{RelayServer, ServerError, ShutdownReport};

//! Local-first data synchronization.
//!
//! Clients mutate an embedded replica optimistically and queue operations;
//! a server applies those operations against an authoritative store under
//! version-based optimistic concurrency, detects conflicts, and fans
//! authoritative changes back out over long-lived event streams.
//!
//! The moving parts:
//! - [`types`] — the operation model shared by both sides.
//! - [`storage`] — adapter contracts plus the shipped SQLite client store
//!   and in-memory server store.
//! - [`server`] — the authoritative sync engine (push/pull) and its table
//!   schema.
//! - [`realtime`] — server fan-out and the reconnecting stream client.
//! - [`sync`] — the client engine: local-first mutations, the durable
//!   queue, sync cycles, conflict resolution.
//! - [`collection`] — reactive per-table views for UI consumption.
//! - [`coordinator`] — pub/sub between co-located replicas.

pub mod collection;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod realtime;
pub mod server;
pub mod storage;
pub mod sync;
pub mod types;

pub use collection::{Collection, CollectionBackend};
pub use config::{RealtimeClientOptions, RealtimeServerOptions, ServerOptions, SyncOptions};
pub use coordinator::{Coordinator, CoordinatorMessage, LocalBus, NoopCoordinator};
pub use error::{Result, SyncError, TransportError, TransportErrorKind};
pub use realtime::{
    LocalStreamTransport, RealtimeClient, RealtimeServer, RealtimeStatus, StreamTransport,
};
pub use server::{table, ServerSyncEngine, SyncSchema, TableConfig};
pub use storage::{ClientStore, MemoryServerStore, ServerStore, SqliteStore};
pub use sync::{LocalTransport, SyncEngine, SyncEngineOptions, SyncStatus, SyncTransport};
pub use types::{
    Conflict, ConflictOutcome, ConflictStrategy, OpKind, OpStatus, Operation, PushResult,
    StoredRecord,
};

//! Sync-specific types: the client-to-server transport trait, engine
//! status, callbacks, and engine wiring options.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::SyncOptions;
use crate::coordinator::Coordinator;
use crate::error::{SyncError, TransportError};
use crate::realtime::StreamTransport;
use crate::storage::ClientStore;
use crate::types::{Conflict, Operation, PushResult};

// ============================================================================
// SyncTransport — user-provided network layer
// ============================================================================

/// User-implemented transport for push/pull synchronization.
///
/// Implementations handle network communication with the sync server; the
/// in-process one lives in [`local`](super::local). Authentication is the
/// transport's concern — the engine never sees credentials.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Push a batch of pending operations. The result reports per-op
    /// acceptance; unacked operations stay queued for the next cycle.
    async fn push(&self, operations: &[Operation]) -> Result<PushResult, TransportError>;

    /// Pull authoritative changes since the given instant, excluding this
    /// replica's own echoes where the server supports it.
    async fn pull(&self, since: i64, client_id: &str) -> Result<Vec<Operation>, TransportError>;

    /// Manual conflict resolution hook. `Ok(None)` means the endpoint is
    /// unavailable and the conflict stays pending.
    async fn resolve(&self, _conflict: &Conflict) -> Result<Option<Operation>, TransportError> {
        Ok(None)
    }
}

// ============================================================================
// Engine status & callbacks
// ============================================================================

/// Externally visible engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Idle,
    Syncing,
    Error,
    /// Unresolved conflicts are pending local policy.
    Conflict,
    Offline,
}

pub type StatusCallback = Arc<dyn Fn(SyncStatus) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&SyncError) + Send + Sync>;

// ============================================================================
// Engine wiring
// ============================================================================

/// Everything a [`SyncEngine`](super::SyncEngine) needs at construction.
pub struct SyncEngineOptions {
    pub store: Arc<dyn ClientStore>,
    pub transport: Arc<dyn SyncTransport>,
    pub options: SyncOptions,
    /// Intra-replica coordination; defaults to a no-op for single-replica
    /// deployments.
    pub coordinator: Option<Arc<dyn Coordinator>>,
    /// Stream transport for realtime delivery; `None` leaves the engine on
    /// pull-only polling.
    pub stream_transport: Option<Arc<dyn StreamTransport>>,
    pub on_status: Option<StatusCallback>,
    pub on_error: Option<ErrorCallback>,
}

impl SyncEngineOptions {
    pub fn new(
        store: Arc<dyn ClientStore>,
        transport: Arc<dyn SyncTransport>,
        options: SyncOptions,
    ) -> Self {
        Self {
            store,
            transport,
            options,
            coordinator: None,
            stream_transport: None,
            on_status: None,
            on_error: None,
        }
    }
}

//! Intra-replica coordination: a named pub/sub channel that keeps
//! co-located replicas of one client identity (e.g. parallel UI contexts)
//! visually synchronized.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::types::OpKind;

/// Handler removal token.
pub type Unsubscribe = Box<dyn FnOnce() + Send>;

/// Messages exchanged between co-located replicas.
#[derive(Debug, Clone)]
pub enum CoordinatorMessage {
    /// Sent after every local mutation; receivers reload the affected
    /// collection view.
    DataChanged {
        table: String,
        kind: OpKind,
        data: Value,
    },
    /// Sent after every successful sync cycle or realtime apply; receivers
    /// reload all collection views.
    SyncComplete,
}

pub type CoordinatorHandler = Arc<dyn Fn(&CoordinatorMessage) + Send + Sync>;

/// Broadcast channel between co-located replicas. Handles never observe
/// their own sends.
pub trait Coordinator: Send + Sync {
    fn broadcast(&self, message: CoordinatorMessage);
    fn on(&self, handler: CoordinatorHandler) -> Unsubscribe;
}

// ============================================================================
// NoopCoordinator
// ============================================================================

/// Coordinator for single-replica deployments: every send vanishes.
#[derive(Default)]
pub struct NoopCoordinator;

impl Coordinator for NoopCoordinator {
    fn broadcast(&self, _message: CoordinatorMessage) {}

    fn on(&self, _handler: CoordinatorHandler) -> Unsubscribe {
        Box::new(|| {})
    }
}

// ============================================================================
// LocalBus
// ============================================================================

#[derive(Clone)]
struct Envelope {
    sender: u64,
    message: Arc<CoordinatorMessage>,
}

const CHANNEL_CAPACITY: usize = 256;

/// In-process bus holding one broadcast channel per name. Co-located
/// replicas obtain handles from a shared bus; each handle filters its own
/// echoes since the underlying primitive delivers to every subscriber.
#[derive(Default)]
pub struct LocalBus {
    channels: Mutex<HashMap<String, broadcast::Sender<Envelope>>>,
    next_handle: AtomicU64,
}

impl LocalBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A fresh handle on the named channel.
    pub fn handle(&self, name: &str) -> LocalCoordinator {
        let sender = self
            .channels
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone();
        LocalCoordinator {
            sender,
            handle_id: self.next_handle.fetch_add(1, Ordering::Relaxed),
        }
    }
}

/// One replica's handle on a [`LocalBus`] channel.
pub struct LocalCoordinator {
    sender: broadcast::Sender<Envelope>,
    handle_id: u64,
}

impl Coordinator for LocalCoordinator {
    fn broadcast(&self, message: CoordinatorMessage) {
        // No subscribers is fine; the send result is irrelevant.
        let _ = self.sender.send(Envelope {
            sender: self.handle_id,
            message: Arc::new(message),
        });
    }

    fn on(&self, handler: CoordinatorHandler) -> Unsubscribe {
        let mut receiver = self.sender.subscribe();
        let own_id = self.handle_id;
        let task = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(envelope) => {
                        if envelope.sender == own_id {
                            continue; // self-echo
                        }
                        handler(&envelope.message);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "coordinator receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Box::new(move || task.abort())
    }
}

// ============================================================================
// Tests
// ============================================================================

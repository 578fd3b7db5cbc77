//! Realtime fan-out server: long-lived per-client event streams with
//! heartbeats, per-user connection limits, and subscription filtering.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::RealtimeServerOptions;
use crate::error::{Result, SyncError};
use crate::types::{now_ms, generate_uuid, Operation};

use super::events::{EventPayload, StreamEvent};

/// Observer invoked once per non-empty fan-out, with the number of
/// connections that received the batch.
pub type BroadcastObserver = Arc<dyn Fn(usize) + Send + Sync>;

struct Connection {
    id: String,
    user_id: String,
    client_id: String,
    /// Effective subscription; empty means "all tables".
    tables: Vec<String>,
    sender: UnboundedSender<StreamEvent>,
    created_at: i64,
    last_activity: i64,
}

#[derive(Default)]
struct Registry {
    /// connection id → connection
    connections: HashMap<String, Connection>,
    /// user id → connection ids, oldest first
    user_connections: HashMap<String, Vec<String>>,
}

impl Registry {
    fn remove(&mut self, connection_id: &str) -> Option<Connection> {
        let connection = self.connections.remove(connection_id);
        for ids in self.user_connections.values_mut() {
            ids.retain(|id| id != connection_id);
        }
        self.user_connections.retain(|_, ids| !ids.is_empty());
        connection
    }
}

// ============================================================================
// RealtimeServer
// ============================================================================

/// Fans authoritative operations out to subscribed clients.
///
/// Fan-out is per-connection and non-blocking (unbounded channel sends); a
/// failed send closes only the offending connection. The registry sits
/// behind one mutex so registration, fan-out and heartbeat iteration never
/// race.
pub struct RealtimeServer {
    options: RealtimeServerOptions,
    registry: Arc<Mutex<Registry>>,
    next_event_id: Arc<AtomicU64>,
    observer: Mutex<Option<BroadcastObserver>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeServer {
    pub fn new(options: RealtimeServerOptions) -> Self {
        Self {
            options,
            registry: Arc::new(Mutex::new(Registry::default())),
            next_event_id: Arc::new(AtomicU64::new(0)),
            observer: Mutex::new(None),
            heartbeat: Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.options.enabled
    }

    pub fn connection_count(&self) -> usize {
        self.registry.lock().connections.len()
    }

    pub fn set_observer(&self, observer: BroadcastObserver) {
        *self.observer.lock() = Some(observer);
    }

    fn next_event(&self, payload: EventPayload) -> StreamEvent {
        StreamEvent {
            id: self.next_event_id.fetch_add(1, Ordering::Relaxed) + 1,
            payload,
            timestamp: now_ms(),
        }
    }

    // -----------------------------------------------------------------------
    // Connections
    // -----------------------------------------------------------------------

    /// Register a stream for `(user_id, client_id)` subscribed to `tables`.
    ///
    /// The first event on the returned stream is `connected`. When the user
    /// is at the connection limit the oldest connection is evicted. When
    /// `allowed_tables` is configured the subscription is intersected with
    /// it; an empty subscription means "all tables".
    pub fn create_connection(
        &self,
        connection_id: impl Into<String>,
        user_id: &str,
        client_id: &str,
        tables: Vec<String>,
    ) -> Result<UnboundedReceiver<StreamEvent>> {
        if !self.options.enabled {
            return Err(SyncError::RealtimeUnavailable);
        }
        self.ensure_heartbeat();

        let connection_id = connection_id.into();
        // An empty subscription means "all tables", so with an allow-list
        // configured the effective subscription can never fall below it.
        let effective: Vec<String> = match &self.options.allowed_tables {
            Some(allowed) => {
                let intersection: Vec<String> = tables
                    .into_iter()
                    .filter(|t| allowed.contains(t))
                    .collect();
                if intersection.is_empty() {
                    allowed.clone()
                } else {
                    intersection
                }
            }
            None => tables,
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        let connected = self.next_event(EventPayload::Connected {
            connection_id: connection_id.clone(),
            tables: effective.clone(),
        });

        {
            let mut registry = self.registry.lock();

            // FIFO eviction by created_at once the user is at the limit.
            let max = self.options.max_connections_per_user.max(1);
            loop {
                let ids = registry
                    .user_connections
                    .get(user_id)
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                if ids.len() < max {
                    break;
                }
                let oldest = ids
                    .iter()
                    .min_by_key(|id| {
                        registry
                            .connections
                            .get(*id)
                            .map(|c| c.created_at)
                            .unwrap_or(i64::MIN)
                    })
                    .cloned();
                match oldest {
                    Some(id) => {
                        registry.remove(&id);
                        debug!(connection = %id, user = %user_id, "evicted oldest connection");
                    }
                    None => break,
                }
            }

            let now = now_ms();
            registry
                .user_connections
                .entry(user_id.to_string())
                .or_default()
                .push(connection_id.clone());
            registry.connections.insert(
                connection_id.clone(),
                Connection {
                    id: connection_id.clone(),
                    user_id: user_id.to_string(),
                    client_id: client_id.to_string(),
                    tables: effective,
                    sender,
                    created_at: now,
                    last_activity: now,
                },
            );
        }

        self.send_to(&connection_id, connected);
        Ok(receiver)
    }

    /// Deregister a connection; the peer's stream ends.
    pub fn close_connection(&self, connection_id: &str) {
        self.registry.lock().remove(connection_id);
    }

    fn send_to(&self, connection_id: &str, event: StreamEvent) {
        let failed = {
            let mut registry = self.registry.lock();
            match registry.connections.get(connection_id) {
                Some(connection) => connection.sender.send(event).is_err(),
                None => false,
            }
        };
        if failed {
            self.registry.lock().remove(connection_id);
        }
    }

    // -----------------------------------------------------------------------
    // Fan-out
    // -----------------------------------------------------------------------

    /// Fan a batch of applied operations out to every other subscribed
    /// client. `exclude_client_id` is the originating replica; it receives
    /// nothing for this batch.
    pub fn broadcast(&self, operations: &[Operation], exclude_client_id: Option<&str>) {
        self.fan_out(operations, exclude_client_id, None);
    }

    /// Like [`broadcast`](Self::broadcast), restricted to one user's
    /// connections.
    pub fn send_to_user(&self, user_id: &str, operations: &[Operation]) {
        self.fan_out(operations, None, Some(user_id));
    }

    fn fan_out(&self, operations: &[Operation], exclude_client_id: Option<&str>, user_id: Option<&str>) {
        if !self.options.enabled || operations.is_empty() {
            return;
        }

        let mut delivered = 0usize;
        let mut dead: Vec<String> = Vec::new();

        {
            let mut registry = self.registry.lock();
            let now = now_ms();
            for connection in registry.connections.values_mut() {
                if let Some(uid) = user_id {
                    if connection.user_id != uid {
                        continue;
                    }
                }
                if exclude_client_id == Some(connection.client_id.as_str()) {
                    continue;
                }

                let filtered: Vec<Operation> = if connection.tables.is_empty() {
                    operations.to_vec()
                } else {
                    operations
                        .iter()
                        .filter(|op| connection.tables.contains(&op.table))
                        .cloned()
                        .collect()
                };
                if filtered.is_empty() {
                    continue;
                }

                let mut tables: Vec<String> =
                    filtered.iter().map(|op| op.table.clone()).collect();
                tables.sort();
                tables.dedup();

                let event = StreamEvent {
                    id: self.next_event_id.fetch_add(1, Ordering::Relaxed) + 1,
                    payload: EventPayload::Operations {
                        operations: filtered,
                        tables,
                    },
                    timestamp: now,
                };
                if connection.sender.send(event).is_ok() {
                    connection.last_activity = now;
                    delivered += 1;
                } else {
                    dead.push(connection.id.clone());
                }
            }

            for id in &dead {
                registry.remove(id);
            }
        }

        if delivered > 0 {
            debug!(connections = delivered, ops = operations.len(), "broadcast");
            if let Some(observer) = self.observer.lock().clone() {
                observer(delivered);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Heartbeat
    // -----------------------------------------------------------------------

    /// Spawn the heartbeat loop on first use. Outside a tokio runtime the
    /// server still works; streams just carry no heartbeats.
    fn ensure_heartbeat(&self) {
        if self.options.heartbeat_interval_ms == 0 {
            return;
        }
        let mut slot = self.heartbeat.lock();
        if slot.is_some() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let registry = Arc::clone(&self.registry);
        let next_event_id = Arc::clone(&self.next_event_id);
        let interval = Duration::from_millis(self.options.heartbeat_interval_ms);
        let timeout = self.options.connection_timeout_ms;

        *slot = Some(handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                let now = now_ms();
                let mut dead: Vec<String> = Vec::new();
                let mut registry = registry.lock();
                for connection in registry.connections.values() {
                    if timeout > 0 && now - connection.last_activity > timeout as i64 {
                        warn!(connection = %connection.id, "closing stale connection");
                        dead.push(connection.id.clone());
                        continue;
                    }
                    let event = StreamEvent {
                        id: next_event_id.fetch_add(1, Ordering::Relaxed) + 1,
                        payload: EventPayload::Heartbeat { timestamp: now },
                        timestamp: now,
                    };
                    if connection.sender.send(event).is_err() {
                        dead.push(connection.id.clone());
                    }
                }
                for id in &dead {
                    registry.remove(id);
                }
            }
        }));
    }

    /// Stop the heartbeat, close every connection, drop observers.
    pub fn destroy(&self) {
        if let Some(handle) = self.heartbeat.lock().take() {
            handle.abort();
        }
        let mut registry = self.registry.lock();
        registry.connections.clear();
        registry.user_connections.clear();
        *self.observer.lock() = None;
    }
}

impl Drop for RealtimeServer {
    fn drop(&mut self) {
        if let Some(handle) = self.heartbeat.lock().take() {
            handle.abort();
        }
    }
}

/// Fresh opaque connection id.
pub fn connection_id() -> String {
    generate_uuid()
}

// ============================================================================
// Tests
// ============================================================================

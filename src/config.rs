//! Configuration for the client and server engines.

use crate::types::ConflictStrategy;

// ============================================================================
// Client
// ============================================================================

/// Client sync engine configuration.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Auto-sync period in milliseconds. `0` syncs synchronously after every
    /// mutation; negative disables auto-sync entirely.
    pub sync_interval_ms: i64,
    /// Maximum operations per push request.
    pub batch_size: usize,
    /// How conflicts returned by the server are resolved locally.
    pub conflict_resolution: ConflictStrategy,
    /// Push attempts per batch before a transient transport error propagates.
    pub retry_attempts: u32,
    /// Delay between push retries, in milliseconds.
    pub retry_delay_ms: u64,
    /// Realtime stream configuration; `None` disables realtime.
    pub realtime: Option<RealtimeClientOptions>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            sync_interval_ms: 30_000,
            batch_size: 50,
            conflict_resolution: ConflictStrategy::default(),
            retry_attempts: 3,
            retry_delay_ms: 1_000,
            realtime: None,
        }
    }
}

/// Realtime stream client configuration.
#[derive(Debug, Clone)]
pub struct RealtimeClientOptions {
    pub enabled: bool,
    /// Stream endpoint; carried to the transport verbatim.
    pub endpoint: String,
    /// Tables to subscribe to. Empty means "all tables".
    pub tables: Vec<String>,
    /// Base reconnect delay in milliseconds.
    pub reconnect_interval_ms: u64,
    /// Cap on the exponential reconnect delay.
    pub max_reconnect_interval_ms: u64,
    /// Attempts before giving up and falling back to polling.
    pub max_reconnect_attempts: u32,
    /// Silence on the stream longer than this is treated as a dead
    /// connection.
    pub heartbeat_timeout_ms: u64,
}

impl Default for RealtimeClientOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: String::new(),
            tables: Vec::new(),
            reconnect_interval_ms: 1_000,
            max_reconnect_interval_ms: 30_000,
            max_reconnect_attempts: 10,
            heartbeat_timeout_ms: 45_000,
        }
    }
}

// ============================================================================
// Server
// ============================================================================

/// Server sync engine configuration.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Advisory batch size for adapter batch operations.
    pub batch_size: usize,
    pub realtime: RealtimeServerOptions,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            batch_size: 50,
            realtime: RealtimeServerOptions::default(),
        }
    }
}

/// Realtime fan-out server configuration.
#[derive(Debug, Clone)]
pub struct RealtimeServerOptions {
    pub enabled: bool,
    /// Heartbeat period in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Connections silent longer than this are reaped; `0` disables reaping.
    pub connection_timeout_ms: u64,
    /// Oldest connection is evicted when a user exceeds this.
    pub max_connections_per_user: usize,
    /// When set, subscriptions are intersected with this list.
    pub allowed_tables: Option<Vec<String>>,
}

impl Default for RealtimeServerOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            heartbeat_interval_ms: 30_000,
            connection_timeout_ms: 0,
            max_connections_per_user: 5,
            allowed_tables: None,
        }
    }
}

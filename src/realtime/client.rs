//! Realtime stream client: maintains the long-lived event stream with
//! exponential-backoff reconnection, a heartbeat watchdog, and a polling
//! fallback once attempts are exhausted.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::RealtimeClientOptions;
use crate::error::TransportError;
use crate::types::Operation;

use super::events::{EventPayload, StreamEvent};

/// A live one-way event stream from the server.
pub type EventStream = UnboundedReceiver<StreamEvent>;

/// Parameters carried to the stream endpoint on every (re)connect.
#[derive(Debug, Clone)]
pub struct StreamParams {
    pub endpoint: String,
    pub client_id: String,
    /// Comma-joined on real wires; empty means "all tables".
    pub tables: Vec<String>,
    /// Highest event id seen, for server-side replay when supported.
    pub last_event_id: Option<u64>,
}

/// Opens the long-lived stream. Implementations wrap whatever server-push
/// primitive the deployment has; the in-process one lives in
/// [`local`](super::local).
#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn open(&self, params: &StreamParams) -> Result<EventStream, TransportError>;
}

/// Connection lifecycle of the stream client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealtimeStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Reconnect attempts exhausted; the replica relies on polling until
    /// `reconnect()` or `enable()` is called.
    Fallback,
}

pub type OperationsCallback = Arc<dyn Fn(Vec<Operation>) + Send + Sync>;
pub type RealtimeStatusCallback = Arc<dyn Fn(RealtimeStatus) + Send + Sync>;

/// Reconnect delay for the given attempt: `min(base * 2^attempt, cap)`.
pub fn reconnect_delay(base_ms: u64, cap_ms: u64, attempt: u32) -> Duration {
    let factor = 1u64 << attempt.min(31);
    Duration::from_millis(base_ms.saturating_mul(factor).min(cap_ms))
}

struct ClientInner {
    options: RealtimeClientOptions,
    transport: Arc<dyn StreamTransport>,
    client_id: String,
    status: Mutex<RealtimeStatus>,
    attempts: AtomicU32,
    last_event_id: AtomicU64,
    enabled: AtomicBool,
    /// Bumped on disable/reconnect/destroy so stale run loops exit.
    generation: AtomicU64,
    on_operations: Mutex<Option<OperationsCallback>>,
    on_status: Mutex<Option<RealtimeStatusCallback>>,
}

impl ClientInner {
    fn set_status(&self, status: RealtimeStatus) {
        {
            let mut current = self.status.lock();
            if *current == status {
                return;
            }
            *current = status;
        }
        if let Some(callback) = self.on_status.lock().clone() {
            callback(status);
        }
    }

    fn params(&self) -> StreamParams {
        let last = self.last_event_id.load(Ordering::Relaxed);
        StreamParams {
            endpoint: self.options.endpoint.clone(),
            client_id: self.client_id.clone(),
            tables: self.options.tables.clone(),
            last_event_id: (last > 0).then_some(last),
        }
    }
}

// ============================================================================
// RealtimeClient
// ============================================================================

/// Client half of the realtime channel. `connect()` spawns a background
/// task that owns the stream; all state transitions happen there.
pub struct RealtimeClient {
    inner: Arc<ClientInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeClient {
    pub fn new(
        options: RealtimeClientOptions,
        transport: Arc<dyn StreamTransport>,
        client_id: impl Into<String>,
    ) -> Self {
        let enabled = options.enabled;
        Self {
            inner: Arc::new(ClientInner {
                options,
                transport,
                client_id: client_id.into(),
                status: Mutex::new(RealtimeStatus::Disconnected),
                attempts: AtomicU32::new(0),
                last_event_id: AtomicU64::new(0),
                enabled: AtomicBool::new(enabled),
                generation: AtomicU64::new(0),
                on_operations: Mutex::new(None),
                on_status: Mutex::new(None),
            }),
            task: Mutex::new(None),
        }
    }

    /// Deliver incoming operation batches here.
    pub fn on_operations(&self, callback: OperationsCallback) {
        *self.inner.on_operations.lock() = Some(callback);
    }

    pub fn on_status(&self, callback: RealtimeStatusCallback) {
        *self.inner.on_status.lock() = Some(callback);
    }

    pub fn status(&self) -> RealtimeStatus {
        *self.inner.status.lock()
    }

    pub fn last_event_id(&self) -> u64 {
        self.inner.last_event_id.load(Ordering::Relaxed)
    }

    /// Start (or restart) the stream loop. Disabled clients go straight to
    /// fallback.
    pub fn connect(&self) {
        if !self.inner.enabled.load(Ordering::Relaxed) {
            self.inner.set_status(RealtimeStatus::Fallback);
            return;
        }
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(run_loop(inner, generation));

        let mut task = self.task.lock();
        if let Some(old) = task.replace(handle) {
            old.abort();
        }
    }

    /// Manual reconnect: resets the attempt counter and opens a fresh
    /// stream.
    pub fn reconnect(&self) {
        self.inner.attempts.store(0, Ordering::Relaxed);
        self.connect();
    }

    pub fn enable(&self) {
        self.inner.enabled.store(true, Ordering::Relaxed);
        self.inner.attempts.store(0, Ordering::Relaxed);
        self.connect();
    }

    /// Fully close the stream and stop reconnecting.
    pub fn disable(&self) {
        self.inner.enabled.store(false, Ordering::Relaxed);
        self.inner.generation.fetch_add(1, Ordering::Relaxed);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.inner.set_status(RealtimeStatus::Disconnected);
    }

    /// Close the stream, clear timers, drop observers.
    pub fn destroy(&self) {
        self.disable();
        *self.inner.on_operations.lock() = None;
        *self.inner.on_status.lock() = None;
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

// ============================================================================
// Stream loop
// ============================================================================

async fn run_loop(inner: Arc<ClientInner>, generation: u64) {
    let stale = |inner: &ClientInner| {
        !inner.enabled.load(Ordering::Relaxed)
            || inner.generation.load(Ordering::Relaxed) != generation
    };

    loop {
        if stale(&inner) {
            return;
        }
        inner.set_status(RealtimeStatus::Connecting);

        match inner.transport.open(&inner.params()).await {
            Ok(mut stream) => {
                inner.attempts.store(0, Ordering::Relaxed);
                inner.set_status(RealtimeStatus::Connected);
                read_stream(&inner, &mut stream, generation).await;
                if stale(&inner) {
                    return;
                }
                inner.set_status(RealtimeStatus::Disconnected);
            }
            Err(e) => {
                debug!(error = %e, "realtime connect failed");
            }
        }

        // Schedule the next attempt or give up.
        let attempt = inner.attempts.load(Ordering::Relaxed);
        if attempt >= inner.options.max_reconnect_attempts {
            warn!("realtime reconnect attempts exhausted; falling back to polling");
            inner.set_status(RealtimeStatus::Fallback);
            return;
        }
        inner.attempts.store(attempt + 1, Ordering::Relaxed);
        let delay = reconnect_delay(
            inner.options.reconnect_interval_ms,
            inner.options.max_reconnect_interval_ms,
            attempt,
        );
        tokio::time::sleep(delay).await;
    }
}

/// Drain the stream until it closes, the watchdog fires, or the loop goes
/// stale. Any incoming event resets the watchdog.
async fn read_stream(inner: &Arc<ClientInner>, stream: &mut EventStream, generation: u64) {
    let watchdog = Duration::from_millis(inner.options.heartbeat_timeout_ms.max(1));
    loop {
        if inner.generation.load(Ordering::Relaxed) != generation {
            return;
        }
        let event = match tokio::time::timeout(watchdog, stream.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => {
                debug!("realtime stream closed by server");
                return;
            }
            Err(_) => {
                warn!("realtime heartbeat watchdog expired");
                return;
            }
        };

        inner.last_event_id.store(event.id, Ordering::Relaxed);
        match event.payload {
            EventPayload::Operations { operations, .. } => {
                debug!(count = operations.len(), "realtime operations received");
                if let Some(callback) = inner.on_operations.lock().clone() {
                    callback(operations);
                }
            }
            EventPayload::Heartbeat { .. } | EventPayload::Connected { .. } => {}
            EventPayload::Reconnect => {
                debug!("server requested reconnect");
                return;
            }
            EventPayload::Error { message } => {
                warn!(%message, "realtime stream error event");
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn options(max_attempts: u32) -> RealtimeClientOptions {
        RealtimeClientOptions {
            enabled: true,
            endpoint: "local".to_string(),
            tables: vec![],
            reconnect_interval_ms: 1,
            max_reconnect_interval_ms: 16,
            max_reconnect_attempts: max_attempts,
            heartbeat_timeout_ms: 5_000,
        }
    }

    struct FailingTransport {
        opens: AtomicU32,
    }

    #[async_trait]
    impl StreamTransport for FailingTransport {
        async fn open(&self, _params: &StreamParams) -> Result<EventStream, TransportError> {
            self.opens.fetch_add(1, Ordering::Relaxed);
            Err(TransportError::new("connection refused"))
        }
    }

    struct SilentTransport {
        opens: AtomicU32,
    }

    #[async_trait]
    impl StreamTransport for SilentTransport {
        async fn open(&self, _params: &StreamParams) -> Result<EventStream, TransportError> {
            self.opens.fetch_add(1, Ordering::Relaxed);
            let (_sender, receiver) = mpsc::unbounded_channel();
            // Leak the sender so the stream stays open but silent.
            std::mem::forget(_sender);
            Ok(receiver)
        }
    }

    #[test]
    fn backoff_schedule_doubles_up_to_cap() {
        let delays: Vec<u64> = (0..5)
            .map(|k| reconnect_delay(100, 1_600, k).as_millis() as u64)
            .collect();
        assert_eq!(delays, [100, 200, 400, 800, 1_600]);
        // Capped beyond that.
        assert_eq!(reconnect_delay(100, 1_600, 10).as_millis(), 1_600);
        // Huge attempt counts do not overflow.
        assert_eq!(reconnect_delay(100, 1_600, 63).as_millis(), 1_600);
    }

    #[tokio::test]
    async fn exhausted_attempts_transition_to_fallback() {
        let transport = Arc::new(FailingTransport { opens: AtomicU32::new(0) });
        let client = RealtimeClient::new(options(3), transport.clone(), "client-1");
        client.connect();

        for _ in 0..200 {
            if client.status() == RealtimeStatus::Fallback {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(client.status(), RealtimeStatus::Fallback);
        // Initial attempt plus max_reconnect_attempts retries.
        assert_eq!(transport.opens.load(Ordering::Relaxed), 4);

        // No further streams are opened until an explicit reconnect.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(transport.opens.load(Ordering::Relaxed), 4);
    }

    #[tokio::test]
    async fn reconnect_resets_the_attempt_counter() {
        let transport = Arc::new(FailingTransport { opens: AtomicU32::new(0) });
        let client = RealtimeClient::new(options(1), transport.clone(), "client-1");
        client.connect();
        for _ in 0..200 {
            if client.status() == RealtimeStatus::Fallback {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let after_first_round = transport.opens.load(Ordering::Relaxed);
        assert_eq!(after_first_round, 2);

        client.reconnect();
        for _ in 0..200 {
            if client.status() == RealtimeStatus::Fallback {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(transport.opens.load(Ordering::Relaxed), 4);
    }

    #[tokio::test]
    async fn disabled_client_goes_straight_to_fallback() {
        let transport = Arc::new(FailingTransport { opens: AtomicU32::new(0) });
        let client = RealtimeClient::new(
            RealtimeClientOptions {
                enabled: false,
                ..options(3)
            },
            transport.clone(),
            "client-1",
        );
        client.connect();
        assert_eq!(client.status(), RealtimeStatus::Fallback);
        assert_eq!(transport.opens.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn watchdog_expiry_triggers_reconnect() {
        let transport = Arc::new(SilentTransport { opens: AtomicU32::new(0) });
        let client = RealtimeClient::new(
            RealtimeClientOptions {
                heartbeat_timeout_ms: 5,
                ..options(2)
            },
            transport.clone(),
            "client-1",
        );
        client.connect();

        for _ in 0..200 {
            if transport.opens.load(Ordering::Relaxed) >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(transport.opens.load(Ordering::Relaxed) >= 2);
        client.destroy();
    }

    #[tokio::test]
    async fn disable_stops_the_loop() {
        let transport = Arc::new(FailingTransport { opens: AtomicU32::new(0) });
        let client = RealtimeClient::new(options(1_000), transport.clone(), "client-1");
        client.connect();
        tokio::time::sleep(Duration::from_millis(10)).await;
        client.disable();
        assert_eq!(client.status(), RealtimeStatus::Disconnected);

        let frozen = transport.opens.load(Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(transport.opens.load(Ordering::Relaxed), frozen);
    }
}

//! Client sync engine: optimistic local writes, the durable operation
//! queue, push/pull cycles, conflict resolution, realtime apply, and
//! multi-replica coordination.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::collection::{merged, Collection, CollectionBackend};
use crate::config::SyncOptions;
use crate::coordinator::{Coordinator, CoordinatorMessage, NoopCoordinator, Unsubscribe};
use crate::error::{Result, SyncError};
use crate::realtime::{RealtimeClient, RealtimeStatus, StreamTransport};
use crate::storage::ClientStore;
use crate::types::{
    generate_uuid, value_updated_at, value_version, Conflict, ConflictOutcome, ConflictStrategy,
    OpKind, OpStatus, Operation, PushResult,
};

use super::scheduler::SyncScheduler;
use super::types::{ErrorCallback, StatusCallback, SyncEngineOptions, SyncStatus, SyncTransport};

// ============================================================================
// SyncEngine
// ============================================================================

/// One replica's sync engine.
///
/// Construct with [`SyncEngineOptions`], call [`init`](Self::init) once,
/// then mutate through [`collection`](Self::collection) handles or the
/// record methods directly. All long-lived handles (auto-sync ticker,
/// coordinator subscription, realtime stream) are released in
/// [`destroy`](Self::destroy); the client store is not purged.
pub struct SyncEngine {
    core: Arc<EngineCore>,
}

struct EngineState {
    client_id: String,
    last_sync: i64,
    pending_ops: Vec<Operation>,
    conflicts: Vec<Conflict>,
    is_initialized: bool,
    sync_status: SyncStatus,
}

pub(crate) struct EngineCore {
    store: Arc<dyn ClientStore>,
    transport: Arc<dyn SyncTransport>,
    options: SyncOptions,
    coordinator: Arc<dyn Coordinator>,
    stream_transport: Option<Arc<dyn StreamTransport>>,
    state: Mutex<EngineState>,
    /// Serializes sync cycles; mutations enqueued mid-cycle are picked up by
    /// the next one.
    is_syncing: AtomicBool,
    collections: Mutex<HashMap<String, Collection>>,
    realtime: Mutex<Option<RealtimeClient>>,
    scheduler: Mutex<Option<SyncScheduler>>,
    coordinator_unsub: Mutex<Option<Unsubscribe>>,
    on_status: Option<StatusCallback>,
    on_error: Option<ErrorCallback>,
    self_weak: Mutex<Weak<EngineCore>>,
}

impl SyncEngine {
    pub fn new(options: SyncEngineOptions) -> Self {
        let SyncEngineOptions {
            store,
            transport,
            options,
            coordinator,
            stream_transport,
            on_status,
            on_error,
        } = options;

        let core = Arc::new(EngineCore {
            store,
            transport,
            options,
            coordinator: coordinator.unwrap_or_else(|| Arc::new(NoopCoordinator)),
            stream_transport,
            state: Mutex::new(EngineState {
                client_id: String::new(),
                last_sync: 0,
                pending_ops: Vec::new(),
                conflicts: Vec::new(),
                is_initialized: false,
                sync_status: SyncStatus::Idle,
            }),
            is_syncing: AtomicBool::new(false),
            collections: Mutex::new(HashMap::new()),
            realtime: Mutex::new(None),
            scheduler: Mutex::new(None),
            coordinator_unsub: Mutex::new(None),
            on_status,
            on_error,
            self_weak: Mutex::new(Weak::new()),
        });
        *core.self_weak.lock() = Arc::downgrade(&core);
        Self { core }
    }

    /// One-time setup: load replica metadata, bootstrap-pull on a fresh
    /// replica, start the auto-sync ticker, connect realtime.
    ///
    /// Idempotent within a replica lifetime; a second call logs a warning
    /// and returns. A failure here is fatal for the engine.
    pub async fn init(&self) -> Result<()> {
        self.core.clone().init().await
    }

    /// The reactive view over `table`, created on first use.
    pub fn collection(&self, table: &str) -> Collection {
        let mut collections = self.core.collections.lock();
        if let Some(existing) = collections.get(table) {
            return existing.clone();
        }
        let backend: Arc<dyn CollectionBackend> = self.core.clone();
        let collection = Collection::new(table, Arc::downgrade(&backend));
        collections.insert(table.to_string(), collection.clone());
        collection
    }

    pub async fn create(&self, table: &str, data: Value) -> Result<Value> {
        self.core.create_local(table, data).await
    }

    pub async fn update(&self, table: &str, id: &str, partial: Value) -> Result<Value> {
        self.core.update_local(table, id, partial).await
    }

    pub async fn delete(&self, table: &str, id: &str) -> Result<()> {
        self.core.delete_local(table, id).await
    }

    /// Run one sync cycle (push, pull, conflict resolution). A no-op when a
    /// cycle is already running.
    pub async fn sync(&self) -> Result<()> {
        self.core.sync(false).await
    }

    /// Run a sync cycle even if one appears to be in flight.
    pub async fn force_sync(&self) -> Result<()> {
        self.core.sync(true).await
    }

    pub fn status(&self) -> SyncStatus {
        self.core.state.lock().sync_status
    }

    pub fn client_id(&self) -> String {
        self.core.state.lock().client_id.clone()
    }

    pub fn last_sync(&self) -> i64 {
        self.core.state.lock().last_sync
    }

    /// Queue entries not yet acknowledged by the server.
    pub fn pending_count(&self) -> usize {
        self.core.state.lock().pending_ops.len()
    }

    /// Conflicts awaiting local policy (non-empty only under `Manual`
    /// resolution or between cycles).
    pub fn conflicts(&self) -> Vec<Conflict> {
        self.core.state.lock().conflicts.clone()
    }

    pub fn realtime_status(&self) -> Option<RealtimeStatus> {
        self.core.realtime.lock().as_ref().map(|rt| rt.status())
    }

    /// Stop the ticker, close the coordinator channel, tear down realtime.
    /// The client store is left intact.
    pub fn destroy(&self) {
        if let Some(scheduler) = self.core.scheduler.lock().take() {
            scheduler.stop();
        }
        if let Some(unsub) = self.core.coordinator_unsub.lock().take() {
            unsub();
        }
        if let Some(realtime) = self.core.realtime.lock().take() {
            realtime.destroy();
        }
        self.core.state.lock().is_initialized = false;
    }
}

// ============================================================================
// Engine internals
// ============================================================================

impl EngineCore {
    fn ensure_initialized(&self) -> Result<()> {
        if self.state.lock().is_initialized {
            Ok(())
        } else {
            Err(SyncError::NotInitialized)
        }
    }

    fn set_status(&self, status: SyncStatus) {
        {
            let mut state = self.state.lock();
            if state.sync_status == status {
                return;
            }
            state.sync_status = status;
        }
        if let Some(callback) = &self.on_status {
            callback(status);
        }
    }

    fn weak(&self) -> Weak<EngineCore> {
        self.self_weak.lock().clone()
    }

    // -----------------------------------------------------------------------
    // init
    // -----------------------------------------------------------------------

    async fn init(self: Arc<Self>) -> Result<()> {
        if self.state.lock().is_initialized {
            warn!("sync engine already initialized");
            return Ok(());
        }

        self.store.init()?;
        let client_id = self.store.get_client_id()?;
        let last_sync = self.store.get_last_sync()?;
        let queue = self.store.get_queue()?;
        {
            let mut state = self.state.lock();
            state.client_id = client_id.clone();
            state.last_sync = last_sync;
            state.pending_ops = queue;
        }

        if !self.store.is_initialized()? {
            self.bootstrap_pull(&client_id).await?;
            self.store.set_initialized(true)?;
        }
        self.state.lock().is_initialized = true;

        // Co-located replicas: reload views when a peer mutates or syncs.
        let weak = self.weak();
        let unsub = self.coordinator.on(Arc::new(move |message| {
            let Some(core) = weak.upgrade() else { return };
            match message {
                CoordinatorMessage::DataChanged { table, .. } => core.reload_collection(table),
                CoordinatorMessage::SyncComplete => core.reload_all_collections(),
            }
        }));
        *self.coordinator_unsub.lock() = Some(unsub);

        if self.options.sync_interval_ms > 0 {
            let scheduler = SyncScheduler::new(self.options.sync_interval_ms as u64);
            let weak = self.weak();
            scheduler.start(Arc::new(move || {
                let Some(core) = weak.upgrade() else { return };
                tokio::spawn(async move {
                    if let Err(e) = core.sync(false).await {
                        debug!(error = %e, "auto-sync cycle failed");
                    }
                });
            }));
            *self.scheduler.lock() = Some(scheduler);
        }

        if let (Some(rt_options), Some(stream_transport)) =
            (self.options.realtime.clone(), self.stream_transport.clone())
        {
            if rt_options.enabled {
                let client = RealtimeClient::new(rt_options, stream_transport, client_id);
                let weak = self.weak();
                client.on_operations(Arc::new(move |operations| {
                    let Some(core) = weak.upgrade() else { return };
                    tokio::spawn(async move {
                        core.apply_remote_operations(operations).await;
                    });
                }));
                client.connect();
                *self.realtime.lock() = Some(client);
            }
        }

        Ok(())
    }

    /// First-ever pull on a fresh replica, from the beginning of time.
    async fn bootstrap_pull(&self, client_id: &str) -> Result<()> {
        let operations = self.transport.pull(0, client_id).await?;
        let mut max_ts = 0i64;
        for op in &operations {
            max_ts = max_ts.max(op.timestamp);
            self.apply_authoritative(op)?;
        }
        if max_ts > 0 {
            self.store.set_last_sync(max_ts)?;
            self.state.lock().last_sync = max_ts;
        }
        debug!(count = operations.len(), "bootstrap pull applied");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Local-first mutations
    // -----------------------------------------------------------------------

    async fn create_local(&self, table: &str, mut data: Value) -> Result<Value> {
        self.ensure_initialized()?;

        if data.get("id").and_then(Value::as_str).is_none() {
            if let Some(obj) = data.as_object_mut() {
                obj.insert("id".to_string(), Value::String(generate_uuid()));
            } else {
                return Err(SyncError::InvalidOperation(
                    "create payload must be an object".to_string(),
                ));
            }
        }
        let record = merged(&data, &json!({ "_version": 1 }));

        self.store.insert(table, &record)?;
        self.enqueue(table, OpKind::Insert, record.clone(), 1)?;
        self.after_mutation(table, OpKind::Insert, record.clone()).await;
        Ok(record)
    }

    async fn update_local(&self, table: &str, id: &str, partial: Value) -> Result<Value> {
        self.ensure_initialized()?;

        let current = self
            .store
            .find_one(table, id)?
            .ok_or(SyncError::RecordNotFound)?;
        let version = value_version(&current).unwrap_or(1) + 1;
        let record = merged(&merged(&current, &partial), &json!({ "_version": version }));

        self.store.update(table, id, &record)?;
        self.enqueue(table, OpKind::Update, record.clone(), version)?;
        self.after_mutation(table, OpKind::Update, record.clone()).await;
        Ok(record)
    }

    async fn delete_local(&self, table: &str, id: &str) -> Result<()> {
        self.ensure_initialized()?;

        // Advisory version: one past the last observed server version.
        let version = self
            .store
            .find_one(table, id)?
            .as_ref()
            .and_then(value_version)
            .map_or(1, |v| v + 1);
        self.store.delete(table, id)?;

        let data = json!({ "id": id });
        self.enqueue(table, OpKind::Delete, data.clone(), version)?;
        self.after_mutation(table, OpKind::Delete, data).await;
        Ok(())
    }

    fn enqueue(&self, table: &str, kind: OpKind, data: Value, version: i64) -> Result<()> {
        let client_id = self.state.lock().client_id.clone();
        let op = Operation::new(table, kind, data, client_id, version);
        self.store.add_to_queue(&op)?;
        self.state.lock().pending_ops.push(op);
        Ok(())
    }

    async fn after_mutation(&self, table: &str, kind: OpKind, data: Value) {
        self.coordinator.broadcast(CoordinatorMessage::DataChanged {
            table: table.to_string(),
            kind,
            data,
        });
        // Synchronous mode: push the mutation out right away. The local
        // write already succeeded; a failing cycle surfaces via on_error.
        if self.options.sync_interval_ms == 0 {
            if let Err(e) = self.sync(false).await {
                warn!(error = %e, "post-mutation sync failed");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Sync cycle
    // -----------------------------------------------------------------------

    async fn sync(&self, force: bool) -> Result<()> {
        self.ensure_initialized()?;

        if self
            .is_syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
            && !force
        {
            return Ok(());
        }

        struct SyncingGuard<'a>(&'a AtomicBool);
        impl Drop for SyncingGuard<'_> {
            fn drop(&mut self) {
                self.0.store(false, Ordering::Release);
            }
        }
        let _guard = SyncingGuard(&self.is_syncing);

        self.set_status(SyncStatus::Syncing);

        let outcome: Result<()> = async {
            self.push_phase().await?;
            self.pull_phase().await?;
            if !self.state.lock().conflicts.is_empty() {
                self.resolve_conflicts().await?;
            }
            Ok(())
        }
        .await;

        match outcome {
            Ok(()) => {
                self.reload_all_collections();
                self.coordinator.broadcast(CoordinatorMessage::SyncComplete);
                let status = if self.state.lock().conflicts.is_empty() {
                    SyncStatus::Idle
                } else {
                    SyncStatus::Conflict
                };
                self.set_status(status);
                Ok(())
            }
            Err(e) => {
                self.set_status(SyncStatus::Error);
                if let Some(callback) = &self.on_error {
                    callback(&e);
                }
                Err(e)
            }
        }
    }

    async fn push_phase(&self) -> Result<()> {
        let pending: Vec<Operation> = self
            .store
            .get_queue()?
            .into_iter()
            .filter(|op| op.status == OpStatus::Pending)
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        for batch in pending.chunks(self.options.batch_size.max(1)) {
            let PushResult {
                synced,
                conflicts,
                errors,
                ..
            } = self.push_with_retry(batch).await?;

            if !synced.is_empty() {
                self.store.remove_from_queue(&synced)?;
                self.state
                    .lock()
                    .pending_ops
                    .retain(|op| !synced.contains(&op.id));
            }

            if !conflicts.is_empty() {
                self.state.lock().conflicts.extend(conflicts);
                self.set_status(SyncStatus::Conflict);
            }

            for op_error in &errors {
                self.store
                    .update_queue_status(&op_error.id, OpStatus::Error, Some(&op_error.error))?;
                let mut state = self.state.lock();
                if let Some(entry) = state.pending_ops.iter_mut().find(|op| op.id == op_error.id) {
                    entry.status = OpStatus::Error;
                    entry.error = Some(op_error.error.clone());
                }
            }
        }
        Ok(())
    }

    async fn push_with_retry(&self, batch: &[Operation]) -> Result<PushResult> {
        let attempts = self.options.retry_attempts.max(1);
        let mut attempt = 0;
        loop {
            match self.transport.push(batch).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_transient() && attempt + 1 < attempts => {
                    attempt += 1;
                    debug!(attempt, error = %e, "retrying push batch");
                    tokio::time::sleep(Duration::from_millis(self.options.retry_delay_ms)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn pull_phase(&self) -> Result<()> {
        let (last_sync, client_id) = {
            let state = self.state.lock();
            (state.last_sync, state.client_id.clone())
        };

        let operations = self.transport.pull(last_sync, &client_id).await?;
        let mut max_ts = last_sync;
        for op in &operations {
            max_ts = max_ts.max(op.timestamp);
            if op.client_id == client_id {
                continue; // echo of our own write
            }
            if let Err(e) = self.apply_authoritative(op) {
                warn!(op = %op.id, table = %op.table, error = %e, "failed to apply pulled operation");
            }
        }

        if max_ts > last_sync {
            self.store.set_last_sync(max_ts)?;
            self.state.lock().last_sync = max_ts;
        }
        Ok(())
    }

    /// Apply one authoritative operation to the client store. Inserts and
    /// updates are both upserts; deletes drop the row (no client-side
    /// tombstones).
    fn apply_authoritative(&self, op: &Operation) -> Result<()> {
        let id = op
            .record_id()
            .ok_or_else(|| SyncError::InvalidOperation("operation payload missing id".to_string()))?;
        match op.kind {
            OpKind::Insert | OpKind::Update => {
                self.store.update(&op.table, id, &op.data)?;
            }
            OpKind::Delete => {
                self.store.delete(&op.table, id)?;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Conflict resolution
    // -----------------------------------------------------------------------

    async fn resolve_conflicts(&self) -> Result<()> {
        let conflicts = std::mem::take(&mut self.state.lock().conflicts);
        let mut unresolved = Vec::new();

        for mut conflict in conflicts {
            let resolved = match self.options.conflict_resolution {
                ConflictStrategy::ClientWins => {
                    conflict.resolution = Some(ConflictOutcome::ClientWins);
                    Some(conflict.operation.clone())
                }
                ConflictStrategy::ServerWins => {
                    conflict.resolution = Some(ConflictOutcome::ServerWins);
                    let mut op = conflict.operation.clone();
                    op.data = conflict.server_data.clone();
                    Some(op)
                }
                ConflictStrategy::LastWriteWins => {
                    let server_ts = value_updated_at(&conflict.server_data).unwrap_or(0);
                    let client_ts = value_updated_at(&conflict.client_data)
                        .unwrap_or(conflict.operation.timestamp);
                    if server_ts > client_ts {
                        conflict.resolution = Some(ConflictOutcome::ServerWins);
                        let mut op = conflict.operation.clone();
                        op.data = conflict.server_data.clone();
                        Some(op)
                    } else {
                        conflict.resolution = Some(ConflictOutcome::ClientWins);
                        Some(conflict.operation.clone())
                    }
                }
                ConflictStrategy::Manual => match self.transport.resolve(&conflict).await {
                    Ok(Some(op)) => {
                        conflict.resolution = Some(ConflictOutcome::Merged);
                        Some(op)
                    }
                    Ok(None) => None,
                    Err(e) => {
                        warn!(error = %e, "manual conflict resolution unavailable");
                        None
                    }
                },
            };

            match resolved {
                Some(op) => {
                    if let Some(id) = op.record_id() {
                        self.store.update(&op.table, id, &op.data)?;
                    }
                    self.store.remove_from_queue(&[conflict.operation.id.clone()])?;
                    self.state
                        .lock()
                        .pending_ops
                        .retain(|pending| pending.id != conflict.operation.id);
                }
                None => unresolved.push(conflict),
            }
        }

        self.state.lock().conflicts = unresolved;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Realtime apply
    // -----------------------------------------------------------------------

    /// Apply a realtime batch. Errors are isolated to the stream — they are
    /// logged and never disturb the sync cycle.
    async fn apply_remote_operations(&self, operations: Vec<Operation>) {
        if self.ensure_initialized().is_err() {
            return;
        }
        let (client_id, last_sync) = {
            let state = self.state.lock();
            (state.client_id.clone(), state.last_sync)
        };

        let mut tables: Vec<String> = Vec::new();
        let mut max_ts = last_sync;
        for op in &operations {
            if op.client_id == client_id {
                continue;
            }
            max_ts = max_ts.max(op.timestamp);
            match self.apply_authoritative(op) {
                Ok(()) => {
                    if !tables.contains(&op.table) {
                        tables.push(op.table.clone());
                    }
                }
                Err(e) => warn!(op = %op.id, error = %e, "failed to apply realtime operation"),
            }
        }

        for table in &tables {
            self.reload_collection(table);
        }
        if max_ts > last_sync {
            if let Err(e) = self.store.set_last_sync(max_ts) {
                warn!(error = %e, "failed to persist last_sync");
            }
            self.state.lock().last_sync = max_ts;
        }
        self.coordinator.broadcast(CoordinatorMessage::SyncComplete);
    }

    // -----------------------------------------------------------------------
    // Collections
    // -----------------------------------------------------------------------

    fn reload_collection(&self, table: &str) {
        let collection = self.collections.lock().get(table).cloned();
        if let Some(collection) = collection {
            if let Err(e) = collection.reload() {
                warn!(table, error = %e, "collection reload failed");
            }
        }
    }

    fn reload_all_collections(&self) {
        let collections: Vec<Collection> = self.collections.lock().values().cloned().collect();
        for collection in collections {
            if let Err(e) = collection.reload() {
                warn!(table = collection.table(), error = %e, "collection reload failed");
            }
        }
    }
}

#[async_trait]
impl CollectionBackend for EngineCore {
    async fn create_record(&self, table: &str, data: Value) -> Result<Value> {
        self.create_local(table, data).await
    }

    async fn update_record(&self, table: &str, id: &str, data: Value) -> Result<Value> {
        self.update_local(table, id, data).await
    }

    async fn delete_record(&self, table: &str, id: &str) -> Result<()> {
        self.delete_local(table, id).await
    }

    fn read_all(&self, table: &str, filter: Option<&Value>) -> Result<Vec<Value>> {
        self.store.find(table, filter)
    }

    fn read_one(&self, table: &str, id: &str) -> Result<Option<Value>> {
        self.store.find_one(table, id)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerOptions;
    use crate::server::{table, ServerSyncEngine, SyncSchema};
    use crate::storage::{MemoryServerStore, ServerStore, SqliteStore};
    use crate::sync::local::LocalTransport;

    fn server() -> Arc<ServerSyncEngine<MemoryServerStore>> {
        Arc::new(ServerSyncEngine::new(
            Arc::new(MemoryServerStore::new()),
            SyncSchema::new([table("todos").build()]),
            ServerOptions::default(),
        ))
    }

    fn engine_options(
        server: &Arc<ServerSyncEngine<MemoryServerStore>>,
        user_id: &str,
    ) -> SyncEngineOptions {
        let store = SqliteStore::open_in_memory().unwrap();
        SyncEngineOptions::new(
            Arc::new(store),
            Arc::new(LocalTransport::new(Arc::clone(server), user_id)),
            SyncOptions {
                sync_interval_ms: -1, // manual sync in tests
                ..Default::default()
            },
        )
    }

    async fn ready_engine(server: &Arc<ServerSyncEngine<MemoryServerStore>>) -> SyncEngine {
        let engine = SyncEngine::new(engine_options(server, "user-1"));
        engine.init().await.unwrap();
        engine
    }

    #[tokio::test]
    async fn mutations_before_init_fail() {
        let server = server();
        let engine = SyncEngine::new(engine_options(&server, "user-1"));
        let err = engine.create("todos", json!({"text": "T"})).await.unwrap_err();
        assert!(matches!(err, SyncError::NotInitialized));
    }

    #[tokio::test]
    async fn init_is_idempotent() {
        let server = server();
        let engine = ready_engine(&server).await;
        engine.init().await.unwrap(); // second call warns and returns
        assert!(!engine.client_id().is_empty());
    }

    #[tokio::test]
    async fn bootstrap_pull_seeds_a_fresh_replica() {
        let server = server();
        server
            .store()
            .insert("todos", "pre-existing", &json!({"text": "seed"}), None)
            .unwrap();

        let engine = ready_engine(&server).await;
        let local = engine.collection("todos");
        local.reload().unwrap();
        assert_eq!(local.count(), 1);
        assert_eq!(local.data()[0]["id"], json!("pre-existing"));
        assert!(engine.last_sync() > 0);
    }

    #[tokio::test]
    async fn create_enqueues_and_sync_pushes() {
        let server = server();
        let engine = ready_engine(&server).await;

        let record = engine.create("todos", json!({"text": "T"})).await.unwrap();
        assert_eq!(record["_version"], json!(1));
        assert_eq!(engine.pending_count(), 1);

        engine.sync().await.unwrap();
        assert_eq!(engine.pending_count(), 0);
        assert_eq!(engine.status(), SyncStatus::Idle);

        let id = record["id"].as_str().unwrap();
        let row = server.store().find_one("todos", id).unwrap().unwrap();
        assert_eq!(row.data["text"], json!("T"));
        assert_eq!(row.version, 1);
    }

    #[tokio::test]
    async fn update_bumps_local_version_and_propagates() {
        let server = server();
        let engine = ready_engine(&server).await;

        let record = engine.create("todos", json!({"text": "a"})).await.unwrap();
        let id = record["id"].as_str().unwrap().to_string();
        engine.sync().await.unwrap();

        let updated = engine.update("todos", &id, json!({"text": "b"})).await.unwrap();
        assert_eq!(updated["_version"], json!(2));
        engine.sync().await.unwrap();

        let row = server.store().find_one("todos", &id).unwrap().unwrap();
        assert_eq!(row.version, 2);
        assert_eq!(row.data["text"], json!("b"));
    }

    #[tokio::test]
    async fn delete_propagates_as_tombstone() {
        let server = server();
        let engine = ready_engine(&server).await;

        let record = engine.create("todos", json!({"text": "x"})).await.unwrap();
        let id = record["id"].as_str().unwrap().to_string();
        engine.sync().await.unwrap();

        engine.delete("todos", &id).await.unwrap();
        engine.sync().await.unwrap();

        let row = server.store().find_one("todos", &id).unwrap().unwrap();
        assert!(row.deleted);
    }

    #[tokio::test]
    async fn pull_applies_other_clients_changes() {
        let server = server();
        let engine = ready_engine(&server).await;

        // Another replica writes directly to the server.
        server
            .store()
            .insert("todos", "remote-1", &json!({"text": "remote"}), Some("other-client"))
            .unwrap();

        engine.sync().await.unwrap();
        let local = engine.collection("todos");
        local.reload().unwrap();
        assert_eq!(local.count(), 1);
        assert_eq!(local.data()[0]["text"], json!("remote"));
    }

    #[tokio::test]
    async fn errored_ops_stay_queued_with_error_status() {
        let server = server();
        let engine = ready_engine(&server).await;

        // "notes" is not in the server schema.
        engine.create("notes", json!({"text": "T"})).await.unwrap();
        engine.sync().await.unwrap();

        let conflicts = engine.conflicts();
        assert!(conflicts.is_empty());
        assert_eq!(engine.pending_count(), 1);
        let state = engine.core.state.lock();
        let queued = &state.pending_ops[0];
        assert_eq!(queued.status, OpStatus::Error);
        assert_eq!(
            queued.error.as_deref(),
            Some("Table notes not configured for sync")
        );
    }

    #[tokio::test]
    async fn conflict_resolved_server_wins_overwrites_local() {
        let server = server();
        server
            .store()
            .insert("todos", "todo-1", &json!({"text": "server"}), None)
            .unwrap();

        let store = SqliteStore::open_in_memory().unwrap();
        let engine = SyncEngine::new(SyncEngineOptions::new(
            Arc::new(store),
            Arc::new(LocalTransport::new(Arc::clone(&server), "user-1")),
            SyncOptions {
                sync_interval_ms: -1,
                conflict_resolution: ConflictStrategy::ServerWins,
                ..Default::default()
            },
        ));
        engine.init().await.unwrap();

        // Local create colliding with the server row (bootstrap already
        // pulled it; overwrite the local copy to force the duplicate).
        engine.core.store.delete("todos", "todo-1").unwrap();
        engine
            .create("todos", json!({"id": "todo-1", "text": "local"}))
            .await
            .unwrap();

        engine.sync().await.unwrap();
        assert_eq!(engine.status(), SyncStatus::Idle);
        assert_eq!(engine.pending_count(), 0, "conflicting op removed from queue");

        let local = engine.core.store.find_one("todos", "todo-1").unwrap().unwrap();
        assert_eq!(local["text"], json!("server"));
    }

    #[tokio::test]
    async fn manual_strategy_leaves_conflicts_pending() {
        let server = server();
        server
            .store()
            .insert("todos", "todo-1", &json!({"text": "server"}), None)
            .unwrap();

        let store = SqliteStore::open_in_memory().unwrap();
        let engine = SyncEngine::new(SyncEngineOptions::new(
            Arc::new(store),
            Arc::new(LocalTransport::new(Arc::clone(&server), "user-1")),
            SyncOptions {
                sync_interval_ms: -1,
                conflict_resolution: ConflictStrategy::Manual,
                ..Default::default()
            },
        ));
        engine.init().await.unwrap();

        engine.core.store.delete("todos", "todo-1").unwrap();
        engine
            .create("todos", json!({"id": "todo-1", "text": "local"}))
            .await
            .unwrap();

        // LocalTransport's resolve() is unavailable; the conflict stays.
        engine.sync().await.unwrap();
        assert_eq!(engine.status(), SyncStatus::Conflict);
        assert_eq!(engine.conflicts().len(), 1);
        assert_eq!(engine.pending_count(), 1, "op stays queued until resolution");
    }

    #[tokio::test]
    async fn synchronous_mode_syncs_after_every_mutation() {
        let server = server();
        let store = SqliteStore::open_in_memory().unwrap();
        let engine = SyncEngine::new(SyncEngineOptions::new(
            Arc::new(store),
            Arc::new(LocalTransport::new(Arc::clone(&server), "user-1")),
            SyncOptions {
                sync_interval_ms: 0,
                ..Default::default()
            },
        ));
        engine.init().await.unwrap();

        let record = engine.create("todos", json!({"text": "T"})).await.unwrap();
        let id = record["id"].as_str().unwrap();
        assert!(server.store().find_one("todos", id).unwrap().is_some());
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn destroy_blocks_further_mutations() {
        let server = server();
        let engine = ready_engine(&server).await;
        engine.destroy();
        let err = engine.create("todos", json!({"text": "T"})).await.unwrap_err();
        assert!(matches!(err, SyncError::NotInitialized));
    }

    #[tokio::test]
    async fn status_callback_sees_transitions() {
        let server = server();
        let store = SqliteStore::open_in_memory().unwrap();
        let seen: Arc<Mutex<Vec<SyncStatus>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);

        let mut options = SyncEngineOptions::new(
            Arc::new(store),
            Arc::new(LocalTransport::new(Arc::clone(&server), "user-1")),
            SyncOptions {
                sync_interval_ms: -1,
                ..Default::default()
            },
        );
        options.on_status = Some(Arc::new(move |status| {
            seen_clone.lock().push(status);
        }));

        let engine = SyncEngine::new(options);
        engine.init().await.unwrap();
        engine.create("todos", json!({"text": "T"})).await.unwrap();
        engine.sync().await.unwrap();

        let transitions = seen.lock().clone();
        assert!(transitions.contains(&SyncStatus::Syncing));
        assert_eq!(*transitions.last().unwrap(), SyncStatus::Idle);
    }
}

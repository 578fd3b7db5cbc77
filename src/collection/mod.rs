//! Reactive collection view: an in-memory, observable projection of one
//! table for UI consumption. Mutations apply optimistically and delegate to
//! the sync engine; authoritative refreshes come through `reload`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::coordinator::Unsubscribe;
use crate::error::{Result, SyncError};
use crate::types::generate_uuid;

// ============================================================================
// CollectionBackend
// ============================================================================

/// What a collection needs from the engine behind it. Implemented by the
/// sync engine; mutations flow local-first through its queue.
#[async_trait]
pub trait CollectionBackend: Send + Sync {
    async fn create_record(&self, table: &str, data: Value) -> Result<Value>;
    async fn update_record(&self, table: &str, id: &str, data: Value) -> Result<Value>;
    async fn delete_record(&self, table: &str, id: &str) -> Result<()>;
    fn read_all(&self, table: &str, filter: Option<&Value>) -> Result<Vec<Value>>;
    fn read_one(&self, table: &str, id: &str) -> Result<Option<Value>>;
}

// ============================================================================
// Collection
// ============================================================================

#[derive(Default)]
struct CollectionState {
    data: Vec<Value>,
    is_loading: bool,
    error: Option<String>,
}

/// Callback fired with the current data snapshot on every change.
pub type CollectionObserver = Arc<dyn Fn(&[Value]) + Send + Sync>;

/// Observable projection of one table.
///
/// Cheap to clone; clones share state and observers. The view never rolls
/// back on error — `error` is populated and the caller is expected to
/// `reload`.
#[derive(Clone)]
pub struct Collection {
    table: String,
    backend: Weak<dyn CollectionBackend>,
    state: Arc<Mutex<CollectionState>>,
    observers: Arc<Mutex<HashMap<u64, CollectionObserver>>>,
    next_observer: Arc<AtomicU64>,
}

impl Collection {
    pub fn new(table: impl Into<String>, backend: Weak<dyn CollectionBackend>) -> Self {
        Self {
            table: table.into(),
            backend,
            state: Arc::new(Mutex::new(CollectionState::default())),
            observers: Arc::new(Mutex::new(HashMap::new())),
            next_observer: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn backend(&self) -> Result<Arc<dyn CollectionBackend>> {
        self.backend.upgrade().ok_or(SyncError::NotInitialized)
    }

    // -----------------------------------------------------------------------
    // Observable state
    // -----------------------------------------------------------------------

    /// Snapshot of the current data.
    pub fn data(&self) -> Vec<Value> {
        self.state.lock().data.clone()
    }

    pub fn count(&self) -> usize {
        self.state.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().data.is_empty()
    }

    pub fn is_loading(&self) -> bool {
        self.state.lock().is_loading
    }

    pub fn error(&self) -> Option<String> {
        self.state.lock().error.clone()
    }

    /// Observe every data change. The callback fires with the new snapshot.
    pub fn subscribe(&self, observer: CollectionObserver) -> Unsubscribe {
        let key = self.next_observer.fetch_add(1, Ordering::Relaxed);
        self.observers.lock().insert(key, observer);
        let observers = Arc::clone(&self.observers);
        Box::new(move || {
            observers.lock().remove(&key);
        })
    }

    fn notify(&self) {
        let snapshot = self.data();
        let observers: Vec<CollectionObserver> = self.observers.lock().values().cloned().collect();
        for observer in observers {
            observer(&snapshot);
        }
    }

    fn set_error(&self, error: &SyncError) {
        self.state.lock().error = Some(error.to_string());
    }

    // -----------------------------------------------------------------------
    // Mutations (optimistic)
    // -----------------------------------------------------------------------

    /// Create a record. The provisional record appears in `data`
    /// immediately and is replaced by the engine's canonical record.
    pub async fn create(&self, mut data: Value) -> Result<Value> {
        let backend = self.backend()?;
        if data.get("id").and_then(Value::as_str).is_none() {
            if let Some(obj) = data.as_object_mut() {
                obj.insert("id".to_string(), Value::String(generate_uuid()));
            }
        }
        let id = data
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| SyncError::InvalidOperation("create payload must be an object".to_string()))?
            .to_string();

        {
            let mut state = self.state.lock();
            state.error = None;
            state.data.push(data.clone());
        }
        self.notify();

        match backend.create_record(&self.table, data).await {
            Ok(record) => {
                self.replace(&id, record.clone());
                self.notify();
                Ok(record)
            }
            Err(e) => {
                self.set_error(&e);
                self.notify();
                Err(e)
            }
        }
    }

    /// Merge `partial` into the record at `id`. The in-memory entry is
    /// merged immediately and replaced by the engine's canonical record.
    pub async fn update(&self, id: &str, partial: Value) -> Result<Value> {
        let backend = self.backend()?;

        {
            let mut state = self.state.lock();
            state.error = None;
            if let Some(entry) = state.data.iter_mut().find(|r| record_id(r) == Some(id)) {
                merge_into(entry, &partial);
            }
        }
        self.notify();

        match backend.update_record(&self.table, id, partial).await {
            Ok(record) => {
                self.replace(id, record.clone());
                self.notify();
                Ok(record)
            }
            Err(e) => {
                self.set_error(&e);
                self.notify();
                Err(e)
            }
        }
    }

    /// Delete the record at `id`; removed from `data` immediately.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let backend = self.backend()?;

        {
            let mut state = self.state.lock();
            state.error = None;
            state.data.retain(|r| record_id(r) != Some(id));
        }
        self.notify();

        match backend.delete_record(&self.table, id).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.set_error(&e);
                self.notify();
                Err(e)
            }
        }
    }

    /// Read one record from the client store.
    pub fn find_one(&self, id: &str) -> Result<Option<Value>> {
        self.backend()?.read_one(&self.table, id)
    }

    // -----------------------------------------------------------------------
    // Bulk convenience
    // -----------------------------------------------------------------------

    pub async fn create_many(&self, items: Vec<Value>) -> Result<Vec<Value>> {
        let mut created = Vec::with_capacity(items.len());
        for item in items {
            created.push(self.create(item).await?);
        }
        Ok(created)
    }

    pub async fn update_many(&self, items: Vec<(String, Value)>) -> Result<Vec<Value>> {
        let mut updated = Vec::with_capacity(items.len());
        for (id, partial) in items {
            updated.push(self.update(&id, partial).await?);
        }
        Ok(updated)
    }

    pub async fn delete_many(&self, ids: &[String]) -> Result<()> {
        for id in ids {
            self.delete(id).await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Loading
    // -----------------------------------------------------------------------

    /// Re-read the table from the client store, optionally filtered.
    pub fn load(&self, filter: Option<&Value>) -> Result<()> {
        let backend = self.backend()?;
        self.state.lock().is_loading = true;
        let result = backend.read_all(&self.table, filter);
        {
            let mut state = self.state.lock();
            state.is_loading = false;
            match &result {
                Ok(rows) => {
                    state.data = rows.clone();
                    state.error = None;
                }
                Err(e) => state.error = Some(e.to_string()),
            }
        }
        self.notify();
        result.map(|_| ())
    }

    pub fn reload(&self) -> Result<()> {
        self.load(None)
    }

    // -----------------------------------------------------------------------
    // Pure accessors over the snapshot
    // -----------------------------------------------------------------------

    pub fn find(&self, predicate: impl Fn(&Value) -> bool) -> Option<Value> {
        self.state.lock().data.iter().find(|r| predicate(r)).cloned()
    }

    pub fn filter(&self, predicate: impl Fn(&Value) -> bool) -> Vec<Value> {
        self.state
            .lock()
            .data
            .iter()
            .filter(|r| predicate(r))
            .cloned()
            .collect()
    }

    pub fn map<T>(&self, f: impl Fn(&Value) -> T) -> Vec<T> {
        self.state.lock().data.iter().map(|r| f(r)).collect()
    }

    pub fn sorted_by(&self, compare: impl Fn(&Value, &Value) -> std::cmp::Ordering) -> Vec<Value> {
        let mut snapshot = self.data();
        snapshot.sort_by(|a, b| compare(a, b));
        snapshot
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn replace(&self, id: &str, record: Value) {
        let mut state = self.state.lock();
        match state.data.iter_mut().find(|r| record_id(r) == Some(id)) {
            Some(entry) => *entry = record,
            None => state.data.push(record),
        }
    }
}

fn record_id(record: &Value) -> Option<&str> {
    record.get("id").and_then(Value::as_str)
}

/// Shallow object merge of `partial` into `target`.
fn merge_into(target: &mut Value, partial: &Value) {
    if let (Value::Object(target), Some(partial)) = (target, partial.as_object()) {
        for (key, value) in partial {
            target.insert(key.clone(), value.clone());
        }
    }
}

/// Shallow object merge returning the combined value.
pub(crate) fn merged(base: &Value, partial: &Value) -> Value {
    let mut out = match base.as_object() {
        Some(obj) => obj.clone(),
        None => Map::new(),
    };
    if let Some(partial) = partial.as_object() {
        for (key, value) in partial {
            out.insert(key.clone(), value.clone());
        }
    }
    Value::Object(out)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Backend over a plain in-memory map; `fail_writes` simulates a broken
    /// engine.
    #[derive(Default)]
    struct MockBackend {
        rows: Mutex<Vec<Value>>,
        fail_writes: bool,
    }

    #[async_trait]
    impl CollectionBackend for MockBackend {
        async fn create_record(&self, _table: &str, data: Value) -> Result<Value> {
            if self.fail_writes {
                return Err(SyncError::Internal("write failed".to_string()));
            }
            let canonical = merged(&data, &json!({"_version": 1}));
            self.rows.lock().push(canonical.clone());
            Ok(canonical)
        }

        async fn update_record(&self, _table: &str, id: &str, data: Value) -> Result<Value> {
            if self.fail_writes {
                return Err(SyncError::Internal("write failed".to_string()));
            }
            let mut rows = self.rows.lock();
            let entry = rows
                .iter_mut()
                .find(|r| record_id(r) == Some(id))
                .ok_or(SyncError::RecordNotFound)?;
            *entry = merged(entry, &data);
            Ok(entry.clone())
        }

        async fn delete_record(&self, _table: &str, id: &str) -> Result<()> {
            self.rows.lock().retain(|r| record_id(r) != Some(id));
            Ok(())
        }

        fn read_all(&self, _table: &str, _filter: Option<&Value>) -> Result<Vec<Value>> {
            Ok(self.rows.lock().clone())
        }

        fn read_one(&self, _table: &str, id: &str) -> Result<Option<Value>> {
            Ok(self.rows.lock().iter().find(|r| record_id(r) == Some(id)).cloned())
        }
    }

    fn setup() -> (Arc<dyn CollectionBackend>, Collection) {
        let backend: Arc<dyn CollectionBackend> = Arc::new(MockBackend::default());
        let collection = Collection::new("todos", Arc::downgrade(&backend));
        (backend, collection)
    }

    #[tokio::test]
    async fn create_is_optimistic_then_canonical() {
        let (_backend, collection) = setup();

        let record = collection.create(json!({"text": "T"})).await.unwrap();
        assert_eq!(record["_version"], json!(1));
        assert!(record["id"].is_string());

        let data = collection.data();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0]["_version"], json!(1), "provisional replaced in place");
    }

    #[tokio::test]
    async fn update_merges_in_place() {
        let (_backend, collection) = setup();
        let record = collection.create(json!({"text": "a", "done": false})).await.unwrap();
        let id = record["id"].as_str().unwrap().to_string();

        let updated = collection.update(&id, json!({"done": true})).await.unwrap();
        assert_eq!(updated["text"], json!("a"));
        assert_eq!(updated["done"], json!(true));
        assert_eq!(collection.count(), 1);
    }

    #[tokio::test]
    async fn delete_removes_immediately() {
        let (_backend, collection) = setup();
        let record = collection.create(json!({"text": "a"})).await.unwrap();
        let id = record["id"].as_str().unwrap().to_string();

        collection.delete(&id).await.unwrap();
        assert!(collection.is_empty());
    }

    #[tokio::test]
    async fn failed_create_keeps_provisional_and_sets_error() {
        let backend: Arc<MockBackend> = Arc::new(MockBackend {
            fail_writes: true,
            ..Default::default()
        });
        let as_trait: Arc<dyn CollectionBackend> = backend.clone();
        let collection = Collection::new("todos", Arc::downgrade(&as_trait));

        let result = collection.create(json!({"text": "T"})).await;
        assert!(result.is_err());
        assert!(collection.error().is_some());
        // No rollback; the caller reloads.
        assert_eq!(collection.count(), 1);

        collection.reload().unwrap();
        assert!(collection.is_empty());
        drop(as_trait);
    }

    #[tokio::test]
    async fn observers_fire_on_every_change() {
        let (_backend, collection) = setup();
        let seen = Arc::new(Mutex::new(Vec::<usize>::new()));
        let seen_clone = Arc::clone(&seen);
        let _unsub = collection.subscribe(Arc::new(move |data| {
            seen_clone.lock().push(data.len());
        }));

        collection.create(json!({"text": "a"})).await.unwrap();
        assert!(!seen.lock().is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_stops_observer() {
        let (_backend, collection) = setup();
        let seen = Arc::new(Mutex::new(0u32));
        let seen_clone = Arc::clone(&seen);
        let unsub = collection.subscribe(Arc::new(move |_| {
            *seen_clone.lock() += 1;
        }));
        unsub();
        collection.create(json!({"text": "a"})).await.unwrap();
        assert_eq!(*seen.lock(), 0);
    }

    #[tokio::test]
    async fn pure_accessors_operate_on_snapshot() {
        let (_backend, collection) = setup();
        collection.create(json!({"text": "b", "rank": 2})).await.unwrap();
        collection.create(json!({"text": "a", "rank": 1})).await.unwrap();

        let found = collection.find(|r| r["text"] == json!("a")).unwrap();
        assert_eq!(found["rank"], json!(1));

        assert_eq!(collection.filter(|r| r["rank"] == json!(2)).len(), 1);

        let texts: Vec<String> =
            collection.map(|r| r["text"].as_str().unwrap_or_default().to_string());
        assert_eq!(texts.len(), 2);

        let sorted = collection.sorted_by(|a, b| {
            a["rank"].as_i64().unwrap_or(0).cmp(&b["rank"].as_i64().unwrap_or(0))
        });
        assert_eq!(sorted[0]["text"], json!("a"));
    }

    #[tokio::test]
    async fn bulk_operations_run_sequentially() {
        let (_backend, collection) = setup();
        let created = collection
            .create_many(vec![json!({"text": "a"}), json!({"text": "b"})])
            .await
            .unwrap();
        assert_eq!(created.len(), 2);
        assert_eq!(collection.count(), 2);

        let ids: Vec<String> = created
            .iter()
            .map(|r| r["id"].as_str().unwrap().to_string())
            .collect();
        collection.delete_many(&ids).await.unwrap();
        assert!(collection.is_empty());
    }

    #[tokio::test]
    async fn dead_backend_surfaces_not_initialized() {
        let backend: Arc<MockBackend> = Arc::new(MockBackend::default());
        let as_trait: Arc<dyn CollectionBackend> = backend.clone();
        let collection = Collection::new("todos", Arc::downgrade(&as_trait));
        drop(as_trait);
        drop(backend);

        let err = collection.create(json!({"text": "a"})).await.unwrap_err();
        assert!(matches!(err, SyncError::NotInitialized));
    }
}

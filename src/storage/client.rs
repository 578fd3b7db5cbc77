//! Client store adapter contract: embedded CRUD, the durable operation
//! queue, and per-replica metadata.

use serde_json::Value;

use crate::error::Result;
use crate::types::{OpStatus, Operation};

/// Storage interface implemented by embedded client backends.
///
/// All methods are synchronous; async orchestration lives in the sync
/// engine above. `update` has upsert semantics (update creates if missing),
/// `find_one` returns `None` on miss, and the queue is durable across
/// process restarts.
pub trait ClientStore: Send + Sync {
    /// Idempotent; creates tables/stores and metadata stores.
    fn init(&self) -> Result<()>;

    // -----------------------------------------------------------------------
    // Records
    // -----------------------------------------------------------------------

    /// Store a new row. The payload must carry an `id` field.
    fn insert(&self, table: &str, data: &Value) -> Result<Value>;

    /// Overwrite the row at `id`, creating it if missing.
    fn update(&self, table: &str, id: &str, data: &Value) -> Result<Value>;

    /// Remove the row at `id`. Missing rows are a no-op; the client store
    /// does not retain tombstones.
    fn delete(&self, table: &str, id: &str) -> Result<()>;

    /// All rows, optionally filtered by field equality against `filter`.
    fn find(&self, table: &str, filter: Option<&Value>) -> Result<Vec<Value>>;

    fn find_one(&self, table: &str, id: &str) -> Result<Option<Value>>;

    // -----------------------------------------------------------------------
    // Operation queue
    // -----------------------------------------------------------------------

    fn add_to_queue(&self, op: &Operation) -> Result<()>;

    /// All queued operations in enqueue order, with current status/error.
    fn get_queue(&self) -> Result<Vec<Operation>>;

    fn remove_from_queue(&self, ids: &[String]) -> Result<()>;

    fn update_queue_status(&self, id: &str, status: OpStatus, error: Option<&str>) -> Result<()>;

    // -----------------------------------------------------------------------
    // Replica metadata
    // -----------------------------------------------------------------------

    fn get_last_sync(&self) -> Result<i64>;

    fn set_last_sync(&self, ts: i64) -> Result<()>;

    /// Generate-and-persist on first call; stable thereafter.
    fn get_client_id(&self) -> Result<String>;

    fn is_initialized(&self) -> Result<bool>;

    fn set_initialized(&self, initialized: bool) -> Result<()>;
}

/// Field-equality match used by `find` implementations.
pub(crate) fn matches_filter(row: &Value, filter: &Value) -> bool {
    match filter.as_object() {
        Some(fields) => fields.iter().all(|(key, expected)| row.get(key) == Some(expected)),
        None => true,
    }
}

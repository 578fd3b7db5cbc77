//! Server store adapter contract: persistent CRUD with sync metadata,
//! the change feed behind delta pull, and per-replica bookkeeping.

use serde_json::Value;

use crate::error::Result;
use crate::types::{ClientState, Operation, StoredRecord};

/// Storage interface implemented by relational/document server backends.
///
/// Every synced table carries the four metadata fields of
/// [`StoredRecord`](crate::types::StoredRecord). `_version` is strictly
/// monotonic per row; deletes are soft and idempotent.
pub trait ServerStore: Send + Sync {
    // -----------------------------------------------------------------------
    // Row CRUD
    // -----------------------------------------------------------------------

    /// Store a new row, stamping `_version = 1` and the server clock.
    /// Fails if a row with this id already exists, tombstoned or not.
    fn insert(&self, table: &str, id: &str, data: &Value, client_id: Option<&str>)
        -> Result<StoredRecord>;

    /// Replace the row's domain payload and bump `_version` to
    /// `expected_version + 1`. Fails with
    /// [`SyncError::VersionMismatch`](crate::error::SyncError::VersionMismatch)
    /// when the stored version is no longer `expected_version` — the caller
    /// lost a race with a concurrent writer.
    fn update(
        &self,
        table: &str,
        id: &str,
        data: &Value,
        expected_version: i64,
        updated_at: i64,
        client_id: Option<&str>,
    ) -> Result<StoredRecord>;

    /// Soft-delete: set `_is_deleted = true` and advance `_updated_at`.
    /// Idempotent; deleting a missing or already-tombstoned row is a no-op.
    fn delete(&self, table: &str, id: &str, updated_at: i64, client_id: Option<&str>)
        -> Result<()>;

    fn find_one(&self, table: &str, id: &str) -> Result<Option<StoredRecord>>;

    /// Live rows matching the optional field-equality filter.
    fn find(&self, table: &str, filter: Option<&Value>) -> Result<Vec<StoredRecord>>;

    // -----------------------------------------------------------------------
    // Change feed
    // -----------------------------------------------------------------------

    /// Rows (tombstones included) with `_updated_at > since`, optionally
    /// restricted by a row filter and excluding rows whose `_client_id`
    /// equals `exclude_client_id`. Rows with a null `_client_id` are never
    /// excluded.
    fn get_changes_since(
        &self,
        table: &str,
        since: i64,
        filter: Option<&Value>,
        exclude_client_id: Option<&str>,
    ) -> Result<Vec<StoredRecord>>;

    /// True when the stored `_version` differs from `expected_version`
    /// (or the row is missing).
    fn check_conflict(&self, table: &str, id: &str, expected_version: i64) -> Result<bool>;

    // -----------------------------------------------------------------------
    // Batches
    // -----------------------------------------------------------------------

    fn batch_insert(
        &self,
        table: &str,
        rows: &[(String, Value)],
        client_id: Option<&str>,
    ) -> Result<Vec<StoredRecord>> {
        rows.iter()
            .map(|(id, data)| self.insert(table, id, data, client_id))
            .collect()
    }

    fn batch_update(
        &self,
        table: &str,
        rows: &[(String, Value, i64)],
        updated_at: i64,
        client_id: Option<&str>,
    ) -> Result<Vec<StoredRecord>> {
        rows.iter()
            .map(|(id, data, expected)| {
                self.update(table, id, data, *expected, updated_at, client_id)
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Sync bookkeeping
    // -----------------------------------------------------------------------

    /// Append an accepted operation to the server sync log.
    fn log_sync_operation(&self, op: &Operation, user_id: &str) -> Result<()>;

    fn update_client_state(&self, client_id: &str, user_id: &str) -> Result<()>;

    fn get_client_state(&self, client_id: &str) -> Result<Option<ClientState>>;

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    /// Run `f` inside a store transaction when the backend offers one.
    /// The default runs `f` directly with no atomicity guarantee.
    fn transaction<T>(&self, f: impl FnOnce(&Self) -> Result<T>) -> Result<T>
    where
        Self: Sized,
    {
        f(self)
    }
}

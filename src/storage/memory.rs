//! In-memory server store.
//!
//! Reference [`ServerStore`] backend: all state in HashMaps behind a
//! `parking_lot::Mutex`, with snapshot/restore transactions so a failed
//! push rolls the whole batch back.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use serde_json::Value;

use crate::error::{Result, SyncError};
use crate::storage::client::matches_filter;
use crate::types::{now_ms, ClientState, Operation, StoredRecord};

use super::server::ServerStore;

/// One entry in the append-only server sync log.
#[derive(Debug, Clone)]
pub struct SyncLogEntry {
    pub operation: Operation,
    pub user_id: String,
    pub logged_at: i64,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    /// table → (record id → record)
    tables: HashMap<String, BTreeMap<String, StoredRecord>>,
    sync_log: Vec<SyncLogEntry>,
    client_states: HashMap<String, ClientState>,
}

/// In-memory [`ServerStore`] implementation.
#[derive(Default)]
pub struct MemoryServerStore {
    state: Mutex<MemoryState>,
}

impl MemoryServerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The server sync log, oldest first.
    pub fn sync_log(&self) -> Vec<SyncLogEntry> {
        self.state.lock().sync_log.clone()
    }

    /// Count of live (non-tombstoned) rows in a table.
    pub fn live_count(&self, table: &str) -> usize {
        self.state
            .lock()
            .tables
            .get(table)
            .map(|rows| rows.values().filter(|r| !r.deleted).count())
            .unwrap_or(0)
    }
}

impl ServerStore for MemoryServerStore {
    fn insert(
        &self,
        table: &str,
        id: &str,
        data: &Value,
        client_id: Option<&str>,
    ) -> Result<StoredRecord> {
        let mut state = self.state.lock();
        let rows = state.tables.entry(table.to_string()).or_default();
        if rows.contains_key(id) {
            return Err(SyncError::Storage(format!(
                "record {table}/{id} already exists"
            )));
        }
        let record = StoredRecord {
            id: id.to_string(),
            data: data.clone(),
            version: 1,
            updated_at: now_ms(),
            client_id: client_id.map(str::to_string),
            deleted: false,
        };
        rows.insert(id.to_string(), record.clone());
        Ok(record)
    }

    fn update(
        &self,
        table: &str,
        id: &str,
        data: &Value,
        expected_version: i64,
        updated_at: i64,
        client_id: Option<&str>,
    ) -> Result<StoredRecord> {
        let mut state = self.state.lock();
        let record = state
            .tables
            .get_mut(table)
            .and_then(|rows| rows.get_mut(id))
            .ok_or(SyncError::RecordNotFound)?;
        if record.version != expected_version {
            return Err(SyncError::VersionMismatch {
                table: table.to_string(),
                id: id.to_string(),
                expected: expected_version,
                found: record.version,
            });
        }
        record.data = data.clone();
        record.version = expected_version + 1;
        record.updated_at = updated_at;
        record.client_id = client_id.map(str::to_string);
        record.deleted = false;
        Ok(record.clone())
    }

    fn delete(
        &self,
        table: &str,
        id: &str,
        updated_at: i64,
        client_id: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let Some(record) = state.tables.get_mut(table).and_then(|rows| rows.get_mut(id)) else {
            return Ok(());
        };
        if record.deleted {
            return Ok(());
        }
        record.deleted = true;
        record.version += 1;
        record.updated_at = updated_at;
        record.client_id = client_id.map(str::to_string);
        Ok(())
    }

    fn find_one(&self, table: &str, id: &str) -> Result<Option<StoredRecord>> {
        Ok(self
            .state
            .lock()
            .tables
            .get(table)
            .and_then(|rows| rows.get(id))
            .cloned())
    }

    fn find(&self, table: &str, filter: Option<&Value>) -> Result<Vec<StoredRecord>> {
        let state = self.state.lock();
        let Some(rows) = state.tables.get(table) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .values()
            .filter(|r| !r.deleted)
            .filter(|r| filter.map_or(true, |f| matches_filter(&r.data, f)))
            .cloned()
            .collect())
    }

    fn get_changes_since(
        &self,
        table: &str,
        since: i64,
        filter: Option<&Value>,
        exclude_client_id: Option<&str>,
    ) -> Result<Vec<StoredRecord>> {
        let state = self.state.lock();
        let Some(rows) = state.tables.get(table) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .values()
            .filter(|r| r.updated_at > since)
            .filter(|r| filter.map_or(true, |f| matches_filter(&r.data, f)))
            .filter(|r| match (&r.client_id, exclude_client_id) {
                // Null _client_id (server-originated) is never excluded.
                (Some(origin), Some(excluded)) => origin != excluded,
                _ => true,
            })
            .cloned()
            .collect())
    }

    fn check_conflict(&self, table: &str, id: &str, expected_version: i64) -> Result<bool> {
        Ok(self
            .find_one(table, id)?
            .map_or(true, |r| r.version != expected_version))
    }

    fn log_sync_operation(&self, op: &Operation, user_id: &str) -> Result<()> {
        self.state.lock().sync_log.push(SyncLogEntry {
            operation: op.clone(),
            user_id: user_id.to_string(),
            logged_at: now_ms(),
        });
        Ok(())
    }

    fn update_client_state(&self, client_id: &str, user_id: &str) -> Result<()> {
        let now = now_ms();
        let mut state = self.state.lock();
        state
            .client_states
            .entry(client_id.to_string())
            .and_modify(|cs| {
                cs.user_id = Some(user_id.to_string());
                cs.last_sync = now;
                cs.last_active = now;
            })
            .or_insert_with(|| ClientState {
                client_id: client_id.to_string(),
                user_id: Some(user_id.to_string()),
                last_sync: now,
                last_active: now,
            });
        Ok(())
    }

    fn get_client_state(&self, client_id: &str) -> Result<Option<ClientState>> {
        Ok(self.state.lock().client_states.get(client_id).cloned())
    }

    fn transaction<T>(&self, f: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        let snapshot = self.state.lock().clone();
        match f(self) {
            Ok(v) => Ok(v),
            Err(e) => {
                *self.state.lock() = snapshot;
                Err(e)
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

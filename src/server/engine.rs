//! Server sync engine: applies client operation batches under per-user
//! authorization and conflict policy, and serves delta pulls.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::config::ServerOptions;
use crate::error::{Result, SyncError};
use crate::realtime::RealtimeServer;
use crate::storage::ServerStore;
use crate::types::{
    generate_uuid, Conflict, ConflictStrategy, OpError, OpKind, OpStatus, Operation, PushResult,
    StoredRecord,
};

use super::schema::{SyncSchema, TableConfig};

// ============================================================================
// ServerSyncEngine
// ============================================================================

/// Authoritative side of the sync protocol.
///
/// `push` processes operations in input order inside a single store
/// transaction; per-op failures are captured into the result and processing
/// continues. `pull` serves per-table deltas merged and sorted by timestamp.
pub struct ServerSyncEngine<S: ServerStore> {
    store: Arc<S>,
    schema: SyncSchema,
    options: ServerOptions,
    realtime: Option<Arc<RealtimeServer>>,
}

enum Applied {
    Ok,
    Conflict(Conflict),
}

impl<S: ServerStore> ServerSyncEngine<S> {
    pub fn new(store: Arc<S>, schema: SyncSchema, options: ServerOptions) -> Self {
        Self {
            store,
            schema,
            options,
            realtime: None,
        }
    }

    /// Attach a realtime server; accepted operations are fanned out to every
    /// other subscribed client after each push commits.
    pub fn with_realtime(mut self, realtime: Arc<RealtimeServer>) -> Self {
        self.realtime = Some(realtime);
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    pub fn schema(&self) -> &SyncSchema {
        &self.schema
    }

    // -----------------------------------------------------------------------
    // push
    // -----------------------------------------------------------------------

    /// Apply a batch of client operations for the authenticated `user_id`.
    ///
    /// Returns `Err` only when the store transaction itself fails; the whole
    /// result is then discarded and the client retries.
    pub fn push(&self, operations: &[Operation], user_id: &str) -> Result<PushResult> {
        let result = self.store.transaction(|tx| {
            let mut result = PushResult::default();

            for op in operations {
                match self.apply_operation(tx, op, user_id) {
                    Ok(Applied::Ok) => result.synced.push(op.id.clone()),
                    Ok(Applied::Conflict(conflict)) => result.conflicts.push(conflict),
                    Err(e) => result.errors.push(OpError {
                        id: op.id.clone(),
                        error: e.to_string(),
                    }),
                }
            }

            if let Some(op) = operations.first() {
                tx.update_client_state(&op.client_id, user_id)?;
            }

            result.success = result.errors.is_empty();
            Ok(result)
        })?;

        debug!(
            synced = result.synced.len(),
            conflicts = result.conflicts.len(),
            errors = result.errors.len(),
            "push applied"
        );

        if let Some(realtime) = &self.realtime {
            let synced: Vec<Operation> = operations
                .iter()
                .filter(|op| result.synced.contains(&op.id))
                .cloned()
                .collect();
            let origin = operations.first().map(|op| op.client_id.as_str());
            realtime.broadcast(&synced, origin);
        }

        Ok(result)
    }

    fn apply_operation(&self, tx: &S, op: &Operation, user_id: &str) -> Result<Applied> {
        let config = self
            .schema
            .get(&op.table)
            .ok_or_else(|| SyncError::TableNotConfigured(op.table.clone()))?;

        match op.kind {
            OpKind::Insert => self.apply_insert(tx, op, config, user_id),
            OpKind::Update => self.apply_update(tx, op, config, user_id),
            OpKind::Delete => self.apply_delete(tx, op, config, user_id),
        }
    }

    fn apply_insert(
        &self,
        tx: &S,
        op: &Operation,
        config: &TableConfig,
        user_id: &str,
    ) -> Result<Applied> {
        if config.scope.is_some() {
            // An ownership claim on the op must match the authenticated
            // principal; an absent claim is allowed.
            if let Some(claimed) = operation_user_id(op) {
                if claimed != user_id {
                    return Err(SyncError::AccessDenied);
                }
            }
        }

        let id = op
            .record_id()
            .ok_or_else(|| SyncError::InvalidOperation("insert payload missing id".to_string()))?;

        // Tombstones count: a row that ever existed conflicts with an insert.
        if let Some(current) = tx.find_one(&config.physical, id)? {
            return Ok(Applied::Conflict(self.make_conflict(op, config, &current)));
        }

        let mut data = domain_fields(&op.data);
        if config.scope.is_some() && operation_user_id(op).is_none() {
            if let Value::Object(obj) = &mut data {
                obj.insert("user_id".to_string(), Value::String(user_id.to_string()));
            }
        }

        tx.insert(&config.physical, id, &data, Some(&op.client_id))?;
        tx.log_sync_operation(op, user_id)?;
        Ok(Applied::Ok)
    }

    fn apply_update(
        &self,
        tx: &S,
        op: &Operation,
        config: &TableConfig,
        user_id: &str,
    ) -> Result<Applied> {
        let id = op
            .record_id()
            .ok_or_else(|| SyncError::InvalidOperation("update payload missing id".to_string()))?;

        let Some(current) = tx.find_one(&config.physical, id)? else {
            return Err(SyncError::RecordNotFound);
        };
        self.authorize_row(config, &current, user_id)?;

        if current.version != op.version - 1 {
            match resolve_version_gap(config.strategy, op, &current) {
                GapOutcome::Conflict => {
                    return Ok(Applied::Conflict(self.make_conflict(op, config, &current)));
                }
                GapOutcome::Resolved => {}
            }
        }

        // The store's versioned update fails if a concurrent writer moved the
        // row under us; that surfaces as an error, not a conflict.
        tx.update(
            &config.physical,
            id,
            &domain_fields(&op.data),
            current.version,
            op.timestamp,
            Some(&op.client_id),
        )?;
        tx.log_sync_operation(op, user_id)?;
        Ok(Applied::Ok)
    }

    fn apply_delete(
        &self,
        tx: &S,
        op: &Operation,
        config: &TableConfig,
        user_id: &str,
    ) -> Result<Applied> {
        let id = op
            .record_id()
            .ok_or_else(|| SyncError::InvalidOperation("delete payload missing id".to_string()))?;

        if let Some(current) = tx.find_one(&config.physical, id)? {
            self.authorize_row(config, &current, user_id)?;
            tx.delete(&config.physical, id, op.timestamp, Some(&op.client_id))?;
        }
        // Deleting a row that never existed is an idempotent success.
        tx.log_sync_operation(op, user_id)?;
        Ok(Applied::Ok)
    }

    fn authorize_row(
        &self,
        config: &TableConfig,
        current: &StoredRecord,
        user_id: &str,
    ) -> Result<()> {
        if config.scope.is_none() {
            return Ok(());
        }
        match row_user_id(&current.data) {
            Some(owner) if owner == user_id => Ok(()),
            _ => Err(SyncError::AccessDenied),
        }
    }

    fn make_conflict(&self, op: &Operation, config: &TableConfig, current: &StoredRecord) -> Conflict {
        Conflict {
            operation: op.clone(),
            server_data: config.outbound(current.to_value()),
            client_data: op.data.clone(),
            resolution: None,
        }
    }

    // -----------------------------------------------------------------------
    // pull
    // -----------------------------------------------------------------------

    /// Changes across all configured tables since `since`, excluding the
    /// caller's own echoes, merged and sorted by timestamp ascending.
    ///
    /// A failing table is logged and skipped; the remaining tables are still
    /// returned.
    pub fn pull(&self, since: i64, client_id: &str, user_id: &str) -> Result<Vec<Operation>> {
        let mut operations = Vec::new();

        for config in self.schema.tables() {
            let filter = config.scope.as_ref().map(|scope| scope(user_id));
            let rows = match self.store.get_changes_since(
                &config.physical,
                since,
                filter.as_ref(),
                Some(client_id),
            ) {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(table = %config.name, error = %e, "pull skipped failing table");
                    continue;
                }
            };

            for row in rows {
                operations.push(Operation {
                    id: generate_uuid(),
                    table: config.name.clone(),
                    kind: if row.deleted { OpKind::Delete } else { OpKind::Update },
                    data: config.outbound(row.to_value()),
                    timestamp: row.updated_at,
                    client_id: row.client_id.clone().unwrap_or_else(|| "server".to_string()),
                    version: row.version,
                    status: OpStatus::Synced,
                    error: None,
                    user_id: None,
                });
            }
        }

        operations.sort_by_key(|op| op.timestamp);
        self.store.update_client_state(client_id, user_id)?;
        Ok(operations)
    }
}

// ============================================================================
// Conflict policy
// ============================================================================

enum GapOutcome {
    /// Client is informed, server state preserved.
    Conflict,
    /// Client update is applied despite the version gap.
    Resolved,
}

/// Decide a version gap per table strategy. Last-write-wins uses strict `>`;
/// equal timestamps favor the server.
fn resolve_version_gap(strategy: ConflictStrategy, op: &Operation, current: &StoredRecord) -> GapOutcome {
    match strategy {
        ConflictStrategy::ServerWins => GapOutcome::Conflict,
        ConflictStrategy::ClientWins => GapOutcome::Resolved,
        ConflictStrategy::LastWriteWins | ConflictStrategy::Manual => {
            if op.timestamp > current.updated_at {
                GapOutcome::Resolved
            } else {
                GapOutcome::Conflict
            }
        }
    }
}

// ============================================================================
// Payload helpers
// ============================================================================

/// The op's ownership claim: top-level `user_id`, else `user_id`/`userId`
/// inside the payload.
fn operation_user_id(op: &Operation) -> Option<&str> {
    op.user_id
        .as_deref()
        .or_else(|| row_user_id(&op.data))
}

fn row_user_id(data: &Value) -> Option<&str> {
    data.get("user_id")
        .or_else(|| data.get("userId"))
        .and_then(Value::as_str)
}

/// Strip sync metadata keys from a client payload before storing it.
fn domain_fields(data: &Value) -> Value {
    match data.as_object() {
        Some(obj) => {
            let mut out = Map::new();
            for (key, value) in obj {
                if !key.starts_with('_') {
                    out.insert(key.clone(), value.clone());
                }
            }
            Value::Object(out)
        }
        None => data.clone(),
    }
}

// ============================================================================
// Tests
// ============================================================================

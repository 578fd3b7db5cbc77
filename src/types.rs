//! Core operation model: the unit of replication and the types that travel
//! between client and server on push/pull.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ============================================================================
// Time & id helpers
// ============================================================================

/// Current wall-clock instant as epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Generate a random UUID (v4).
pub fn generate_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ============================================================================
// Operation
// ============================================================================

/// What an operation does to its target row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Insert,
    Update,
    Delete,
}

/// Local lifecycle marker; only meaningful inside the client queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpStatus {
    Pending,
    Synced,
    Error,
}

/// The unit of replication.
///
/// Produced by a client on every local mutation and replayed by the server.
/// `version` is `1` for inserts and `prior_server_version + 1` for updates;
/// for deletes it is advisory only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Globally unique, assigned by the originating client.
    pub id: String,
    /// Logical table name (must be present in the server sync schema).
    pub table: String,
    #[serde(rename = "operation")]
    pub kind: OpKind,
    /// Row payload. Deletes only need `id`; inserts/updates carry the full
    /// intended post-state.
    pub data: Value,
    /// Wall-clock instant of origination (epoch ms). Trusted only for
    /// last-write-wins tie-breaks, never for authorization.
    pub timestamp: i64,
    pub client_id: String,
    pub version: i64,
    #[serde(default = "default_status")]
    pub status: OpStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When present the server verifies it matches the authenticated
    /// principal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

fn default_status() -> OpStatus {
    OpStatus::Pending
}

impl Operation {
    /// Build a pending operation with a fresh id and the current instant.
    pub fn new(table: impl Into<String>, kind: OpKind, data: Value, client_id: impl Into<String>, version: i64) -> Self {
        Self {
            id: generate_uuid(),
            table: table.into(),
            kind,
            data,
            timestamp: now_ms(),
            client_id: client_id.into(),
            version,
            status: OpStatus::Pending,
            error: None,
            user_id: None,
        }
    }

    /// Target record id (`data.id`), if the payload carries one.
    pub fn record_id(&self) -> Option<&str> {
        self.data.get("id").and_then(Value::as_str)
    }
}

// ============================================================================
// StoredRecord — server-side row with sync metadata
// ============================================================================

/// A server-side row: domain fields plus the four sync metadata fields.
///
/// `version` is strictly monotonic per row and never decremented. A delete
/// sets `deleted = true`; the row is retained for delta pull.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: String,
    /// Domain fields (metadata keys are kept out of this object).
    pub data: Value,
    pub version: i64,
    /// Server-assigned instant of the last accepted write (epoch ms).
    pub updated_at: i64,
    /// Replica whose write produced this row version; `None` for
    /// server-originated writes.
    pub client_id: Option<String>,
    pub deleted: bool,
}

/// Metadata key for the row version on wire payloads.
pub const META_VERSION: &str = "_version";
/// Metadata key for the last-write instant on wire payloads.
pub const META_UPDATED_AT: &str = "_updated_at";
/// Metadata key for the originating replica on wire payloads.
pub const META_CLIENT_ID: &str = "_client_id";
/// Metadata key for the soft-delete marker on wire payloads.
pub const META_IS_DELETED: &str = "_is_deleted";

impl StoredRecord {
    /// Flatten into the wire shape: domain fields merged with `_version`,
    /// `_updated_at`, `_client_id` and `_is_deleted`.
    pub fn to_value(&self) -> Value {
        let mut obj = match &self.data {
            Value::Object(m) => m.clone(),
            _ => Map::new(),
        };
        obj.insert("id".to_string(), Value::String(self.id.clone()));
        obj.insert(META_VERSION.to_string(), Value::from(self.version));
        obj.insert(META_UPDATED_AT.to_string(), Value::from(self.updated_at));
        obj.insert(
            META_CLIENT_ID.to_string(),
            match &self.client_id {
                Some(c) => Value::String(c.clone()),
                None => Value::Null,
            },
        );
        obj.insert(META_IS_DELETED.to_string(), Value::Bool(self.deleted));
        Value::Object(obj)
    }
}

/// Read `_updated_at` from a wire payload, if present.
pub fn value_updated_at(value: &Value) -> Option<i64> {
    value.get(META_UPDATED_AT).and_then(Value::as_i64)
}

/// Read `_version` from a wire payload, if present.
pub fn value_version(value: &Value) -> Option<i64> {
    value.get(META_VERSION).and_then(Value::as_i64)
}

// ============================================================================
// Conflict
// ============================================================================

/// How a conflict was ultimately settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictOutcome {
    ClientWins,
    ServerWins,
    Merged,
}

/// Produced by the server when it refuses to apply an operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    /// The offending client operation.
    pub operation: Operation,
    /// Current server row state (wire shape, metadata included).
    pub server_data: Value,
    /// The operation's payload.
    pub client_data: Value,
    /// Set by whichever side resolves the conflict.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ConflictOutcome>,
}

/// Conflict resolution strategy. Servers never use `Manual`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    ClientWins,
    ServerWins,
    #[default]
    LastWriteWins,
    Manual,
}

// ============================================================================
// PushResult
// ============================================================================

/// Per-operation failure inside a push.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpError {
    pub id: String,
    pub error: String,
}

/// Outcome of one `push` call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushResult {
    pub success: bool,
    /// Ids of operations the server accepted, in input order.
    pub synced: Vec<String>,
    pub conflicts: Vec<Conflict>,
    pub errors: Vec<OpError>,
}

// ============================================================================
// ClientState
// ============================================================================

/// Per-replica bookkeeping on the server, updated on every push and pull.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientState {
    pub client_id: String,
    pub user_id: Option<String>,
    pub last_sync: i64,
    pub last_active: i64,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn operation_serde_round_trip() {
        let op = Operation::new(
            "todos",
            OpKind::Insert,
            json!({"id": "todo-1", "text": "T"}),
            "client-1",
            1,
        );
        let encoded = serde_json::to_value(&op).unwrap();
        assert_eq!(encoded["operation"], json!("insert"));
        assert_eq!(encoded["clientId"], json!("client-1"));
        assert_eq!(encoded["status"], json!("pending"));

        let decoded: Operation = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded.id, op.id);
        assert_eq!(decoded.kind, OpKind::Insert);
        assert_eq!(decoded.record_id(), Some("todo-1"));
    }

    #[test]
    fn stored_record_to_value_merges_metadata() {
        let record = StoredRecord {
            id: "todo-1".to_string(),
            data: json!({"text": "T", "userId": "user-1"}),
            version: 3,
            updated_at: 1234,
            client_id: Some("client-1".to_string()),
            deleted: false,
        };
        let value = record.to_value();
        assert_eq!(value["id"], json!("todo-1"));
        assert_eq!(value["text"], json!("T"));
        assert_eq!(value[META_VERSION], json!(3));
        assert_eq!(value[META_UPDATED_AT], json!(1234));
        assert_eq!(value[META_CLIENT_ID], json!("client-1"));
        assert_eq!(value[META_IS_DELETED], json!(false));

        assert_eq!(value_version(&value), Some(3));
        assert_eq!(value_updated_at(&value), Some(1234));
    }

    #[test]
    fn server_originated_record_has_null_client_id() {
        let record = StoredRecord {
            id: "r".to_string(),
            data: json!({}),
            version: 1,
            updated_at: 0,
            client_id: None,
            deleted: true,
        };
        let value = record.to_value();
        assert!(value[META_CLIENT_ID].is_null());
        assert_eq!(value[META_IS_DELETED], json!(true));
    }

    #[test]
    fn conflict_strategy_default_is_last_write_wins() {
        assert_eq!(ConflictStrategy::default(), ConflictStrategy::LastWriteWins);
    }
}

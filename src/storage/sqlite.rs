//! SQLite-backed client store.
//!
//! One database file per replica: row data, the durable operation queue,
//! and replica metadata (client id, last-sync cursor, bootstrap flag).

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::error::{Result, SyncError};
use crate::types::{generate_uuid, OpStatus, Operation};

use super::client::{matches_filter, ClientStore};

const META_CLIENT_ID: &str = "client_id";
const META_LAST_SYNC: &str = "last_sync";
const META_INITIALIZED: &str = "initialized";

/// Durable [`ClientStore`] on rusqlite.
///
/// The connection sits behind a `parking_lot::Mutex`; callers from async
/// contexts should expect these calls to block the current thread briefly.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row("SELECT value FROM sync_meta WHERE key = ?1", params![key], |row| {
                row.get::<_, String>(0)
            })
            .optional()?;
        Ok(value)
    }

    fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO sync_meta (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }
}

fn status_str(status: OpStatus) -> &'static str {
    match status {
        OpStatus::Pending => "pending",
        OpStatus::Synced => "synced",
        OpStatus::Error => "error",
    }
}

fn parse_status(s: &str) -> OpStatus {
    match s {
        "synced" => OpStatus::Synced,
        "error" => OpStatus::Error,
        _ => OpStatus::Pending,
    }
}

impl ClientStore for SqliteStore {
    fn init(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS records (
                collection TEXT NOT NULL,
                id         TEXT NOT NULL,
                data       TEXT NOT NULL,
                PRIMARY KEY (collection, id)
            );
            CREATE TABLE IF NOT EXISTS sync_queue (
                id         TEXT PRIMARY KEY,
                operation  TEXT NOT NULL,
                status     TEXT NOT NULL DEFAULT 'pending',
                error      TEXT,
                created_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS sync_meta (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    fn insert(&self, table: &str, data: &Value) -> Result<Value> {
        let id = data
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| SyncError::InvalidOperation("insert payload missing id".to_string()))?
            .to_string();
        self.update(table, &id, data)
    }

    fn update(&self, table: &str, id: &str, data: &Value) -> Result<Value> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO records (collection, id, data) VALUES (?1, ?2, ?3)",
            params![table, id, serde_json::to_string(data)?],
        )?;
        Ok(data.clone())
    }

    fn delete(&self, table: &str, id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM records WHERE collection = ?1 AND id = ?2",
            params![table, id],
        )?;
        Ok(())
    }

    fn find(&self, table: &str, filter: Option<&Value>) -> Result<Vec<Value>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT data FROM records WHERE collection = ?1 ORDER BY rowid")?;
        let rows = stmt.query_map(params![table], |row| row.get::<_, String>(0))?;

        let mut results = Vec::new();
        for raw in rows {
            let value: Value = serde_json::from_str(&raw?)?;
            if filter.map_or(true, |f| matches_filter(&value, f)) {
                results.push(value);
            }
        }
        Ok(results)
    }

    fn find_one(&self, table: &str, id: &str) -> Result<Option<Value>> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(
                "SELECT data FROM records WHERE collection = ?1 AND id = ?2",
                params![table, id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn add_to_queue(&self, op: &Operation) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO sync_queue (id, operation, status, error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                op.id,
                serde_json::to_string(op)?,
                status_str(op.status),
                op.error,
                op.timestamp
            ],
        )?;
        Ok(())
    }

    fn get_queue(&self) -> Result<Vec<Operation>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT operation, status, error FROM sync_queue ORDER BY rowid")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?;

        let mut queue = Vec::new();
        for entry in rows {
            let (raw, status, error) = entry?;
            let mut op: Operation = serde_json::from_str(&raw)?;
            op.status = parse_status(&status);
            op.error = error;
            queue.push(op);
        }
        Ok(queue)
    }

    fn remove_from_queue(&self, ids: &[String]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for id in ids {
            tx.execute("DELETE FROM sync_queue WHERE id = ?1", params![id])?;
        }
        tx.commit()?;
        Ok(())
    }

    fn update_queue_status(&self, id: &str, status: OpStatus, error: Option<&str>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE sync_queue SET status = ?1, error = ?2 WHERE id = ?3",
            params![status_str(status), error, id],
        )?;
        Ok(())
    }

    fn get_last_sync(&self) -> Result<i64> {
        Ok(self
            .get_meta(META_LAST_SYNC)?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    fn set_last_sync(&self, ts: i64) -> Result<()> {
        self.set_meta(META_LAST_SYNC, &ts.to_string())
    }

    fn get_client_id(&self) -> Result<String> {
        if let Some(id) = self.get_meta(META_CLIENT_ID)? {
            return Ok(id);
        }
        let id = generate_uuid();
        self.set_meta(META_CLIENT_ID, &id)?;
        Ok(id)
    }

    fn is_initialized(&self) -> Result<bool> {
        Ok(self.get_meta(META_INITIALIZED)?.as_deref() == Some("true"))
    }

    fn set_initialized(&self, initialized: bool) -> Result<()> {
        self.set_meta(META_INITIALIZED, if initialized { "true" } else { "false" })
    }
}

// ============================================================================
// Tests
// ============================================================================

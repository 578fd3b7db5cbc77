//! Server sync schema: which logical tables sync, how rows are scoped to
//! users, and how conflicts on them are resolved.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::types::ConflictStrategy;

/// Row-level access filter: maps a user id to a find-filter for that user's
/// rows. Presence of a scope means the table enforces per-user ownership.
pub type RowScope = Arc<dyn Fn(&str) -> Value + Send + Sync>;

/// Projection/redaction applied to every record leaving the server.
pub type RowTransform = Arc<dyn Fn(Value) -> Value + Send + Sync>;

// ============================================================================
// TableConfig
// ============================================================================

/// Per-table sync configuration.
pub struct TableConfig {
    /// Logical table name as clients see it.
    pub name: String,
    /// Physical table in the backing store.
    pub physical: String,
    /// Fields visible to clients; `None` means all. `id` always survives.
    pub columns: Option<Vec<String>>,
    pub scope: Option<RowScope>,
    pub transform: Option<RowTransform>,
    pub strategy: ConflictStrategy,
}

impl fmt::Debug for TableConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableConfig")
            .field("name", &self.name)
            .field("physical", &self.physical)
            .field("columns", &self.columns)
            .field("scoped", &self.scope.is_some())
            .field("transformed", &self.transform.is_some())
            .field("strategy", &self.strategy)
            .finish()
    }
}

impl TableConfig {
    /// Apply the column projection, then the transform, to a wire payload.
    /// Metadata keys (`_`-prefixed) and `id` always survive projection.
    pub fn outbound(&self, value: Value) -> Value {
        let projected = match (&self.columns, value) {
            (Some(columns), Value::Object(obj)) => {
                let mut out = Map::new();
                for (key, val) in obj {
                    if key == "id" || key.starts_with('_') || columns.iter().any(|c| *c == key) {
                        out.insert(key, val);
                    }
                }
                Value::Object(out)
            }
            (_, value) => value,
        };
        match &self.transform {
            Some(transform) => transform(projected),
            None => projected,
        }
    }
}

/// Start building a table configuration. Logical and physical names start
/// out equal; override the physical name with [`TableBuilder::physical`].
pub fn table(name: impl Into<String>) -> TableBuilder {
    let name = name.into();
    TableBuilder {
        config: TableConfig {
            physical: name.clone(),
            name,
            columns: None,
            scope: None,
            transform: None,
            strategy: ConflictStrategy::default(),
        },
    }
}

/// Builder for [`TableConfig`].
pub struct TableBuilder {
    config: TableConfig,
}

impl TableBuilder {
    pub fn physical(mut self, physical: impl Into<String>) -> Self {
        self.config.physical = physical.into();
        self
    }

    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Restrict rows to their owning user. The closure builds the row filter
    /// for a given user id, e.g. `|uid| json!({ "user_id": uid })`.
    pub fn scope(mut self, scope: impl Fn(&str) -> Value + Send + Sync + 'static) -> Self {
        self.config.scope = Some(Arc::new(scope));
        self
    }

    pub fn transform(mut self, transform: impl Fn(Value) -> Value + Send + Sync + 'static) -> Self {
        self.config.transform = Some(Arc::new(transform));
        self
    }

    pub fn strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.config.strategy = strategy;
        self
    }

    pub fn build(self) -> TableConfig {
        self.config
    }
}

// ============================================================================
// SyncSchema
// ============================================================================

/// The set of logical tables a server syncs, keyed by logical name.
#[derive(Debug, Default)]
pub struct SyncSchema {
    tables: BTreeMap<String, Arc<TableConfig>>,
}

impl SyncSchema {
    pub fn new(tables: impl IntoIterator<Item = TableConfig>) -> Self {
        Self {
            tables: tables
                .into_iter()
                .map(|t| (t.name.clone(), Arc::new(t)))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<TableConfig>> {
        self.tables.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    /// Configured tables in name order.
    pub fn tables(&self) -> impl Iterator<Item = &Arc<TableConfig>> {
        self.tables.values()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builder_defaults() {
        let config = table("todos").build();
        assert_eq!(config.name, "todos");
        assert_eq!(config.physical, "todos");
        assert!(config.columns.is_none());
        assert!(config.scope.is_none());
        assert_eq!(config.strategy, ConflictStrategy::LastWriteWins);
    }

    #[test]
    fn physical_name_override() {
        let config = table("todos").physical("app_todos").build();
        assert_eq!(config.name, "todos");
        assert_eq!(config.physical, "app_todos");
    }

    #[test]
    fn outbound_projects_columns_but_keeps_id_and_metadata() {
        let config = table("todos").columns(["text"]).build();
        let out = config.outbound(json!({
            "id": "t1",
            "text": "T",
            "secret": "x",
            "_version": 2,
        }));
        assert_eq!(out["id"], json!("t1"));
        assert_eq!(out["text"], json!("T"));
        assert_eq!(out["_version"], json!(2));
        assert!(out.get("secret").is_none());
    }

    #[test]
    fn outbound_applies_transform_after_projection() {
        let config = table("todos")
            .columns(["text"])
            .transform(|mut v| {
                if let Some(obj) = v.as_object_mut() {
                    obj.insert("redacted".to_string(), json!(true));
                }
                v
            })
            .build();
        let out = config.outbound(json!({"id": "t1", "text": "T", "secret": "x"}));
        assert_eq!(out["redacted"], json!(true));
        assert!(out.get("secret").is_none());
    }

    #[test]
    fn schema_lookup() {
        let schema = SyncSchema::new([table("todos").build(), table("notes").build()]);
        assert!(schema.contains("todos"));
        assert!(schema.get("missing").is_none());
        let names: Vec<_> = schema.tables().map(|t| t.name.clone()).collect();
        assert_eq!(names, ["notes", "todos"]);
    }

    #[test]
    fn scope_builds_user_filter() {
        let config = table("todos").scope(|uid| json!({ "user_id": uid })).build();
        let filter = (config.scope.as_ref().unwrap())("user-1");
        assert_eq!(filter, json!({ "user_id": "user-1" }));
    }
}

pub mod engine;
pub mod schema;

pub use engine::ServerSyncEngine;
pub use schema::{table, SyncSchema, TableConfig};

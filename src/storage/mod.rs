pub mod client;
pub mod memory;
pub mod server;
pub mod sqlite;

pub use client::ClientStore;
pub use memory::MemoryServerStore;
pub use server::ServerStore;
pub use sqlite::SqliteStore;

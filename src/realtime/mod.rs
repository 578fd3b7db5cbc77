pub mod client;
pub mod events;
pub mod local;
pub mod server;

pub use client::{RealtimeClient, RealtimeStatus, StreamParams, StreamTransport};
pub use events::{EventPayload, StreamEvent};
pub use local::LocalStreamTransport;
pub use server::RealtimeServer;

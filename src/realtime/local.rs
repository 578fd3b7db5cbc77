//! In-process stream transport: wires a [`RealtimeClient`] directly to a
//! [`RealtimeServer`] in the same process. The test and demo wire; real
//! deployments substitute an SSE/WebSocket transport.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{TransportError, TransportErrorKind};
use crate::types::generate_uuid;

use super::client::{EventStream, StreamParams, StreamTransport};
use super::server::RealtimeServer;

pub struct LocalStreamTransport {
    server: Arc<RealtimeServer>,
    user_id: String,
}

impl LocalStreamTransport {
    /// `user_id` stands in for the authenticated principal an outer HTTP
    /// layer would resolve.
    pub fn new(server: Arc<RealtimeServer>, user_id: impl Into<String>) -> Self {
        Self {
            server,
            user_id: user_id.into(),
        }
    }
}

#[async_trait]
impl StreamTransport for LocalStreamTransport {
    async fn open(&self, params: &StreamParams) -> Result<EventStream, TransportError> {
        self.server
            .create_connection(
                generate_uuid(),
                &self.user_id,
                &params.client_id,
                params.tables.clone(),
            )
            .map_err(|e| TransportError::with_kind(e.to_string(), TransportErrorKind::Permanent))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RealtimeServerOptions;

    #[tokio::test]
    async fn open_registers_a_connection() {
        let server = Arc::new(RealtimeServer::new(RealtimeServerOptions {
            heartbeat_interval_ms: 0,
            ..Default::default()
        }));
        let transport = LocalStreamTransport::new(Arc::clone(&server), "user-1");

        let mut stream = transport
            .open(&StreamParams {
                endpoint: String::new(),
                client_id: "client-1".to_string(),
                tables: vec!["todos".to_string()],
                last_event_id: None,
            })
            .await
            .unwrap();

        assert_eq!(server.connection_count(), 1);
        let first = stream.recv().await.unwrap();
        assert!(matches!(
            first.payload,
            crate::realtime::EventPayload::Connected { .. }
        ));
    }

    #[tokio::test]
    async fn open_against_disabled_server_fails_permanently() {
        let server = Arc::new(RealtimeServer::new(RealtimeServerOptions {
            enabled: false,
            ..Default::default()
        }));
        let transport = LocalStreamTransport::new(server, "user-1");

        let err = transport
            .open(&StreamParams {
                endpoint: String::new(),
                client_id: "client-1".to_string(),
                tables: vec![],
                last_event_id: None,
            })
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }
}

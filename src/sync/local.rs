//! In-process sync transport: wires a client engine directly to a
//! [`ServerSyncEngine`] in the same process. The test and demo wire; real
//! deployments substitute an HTTP transport.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{TransportError, TransportErrorKind};
use crate::server::ServerSyncEngine;
use crate::storage::ServerStore;
use crate::types::{Conflict, Operation, PushResult};

use super::types::SyncTransport;

pub struct LocalTransport<S: ServerStore> {
    engine: Arc<ServerSyncEngine<S>>,
    user_id: String,
}

impl<S: ServerStore> LocalTransport<S> {
    /// `user_id` stands in for the authenticated principal an outer HTTP
    /// layer would resolve.
    pub fn new(engine: Arc<ServerSyncEngine<S>>, user_id: impl Into<String>) -> Self {
        Self {
            engine,
            user_id: user_id.into(),
        }
    }
}

#[async_trait]
impl<S: ServerStore + 'static> SyncTransport for LocalTransport<S> {
    async fn push(&self, operations: &[Operation]) -> Result<PushResult, TransportError> {
        self.engine
            .push(operations, &self.user_id)
            .map_err(|e| TransportError::with_kind(e.to_string(), TransportErrorKind::Permanent))
    }

    async fn pull(&self, since: i64, client_id: &str) -> Result<Vec<Operation>, TransportError> {
        self.engine
            .pull(since, client_id, &self.user_id)
            .map_err(|e| TransportError::with_kind(e.to_string(), TransportErrorKind::Permanent))
    }

    async fn resolve(&self, _conflict: &Conflict) -> Result<Option<Operation>, TransportError> {
        Ok(None)
    }
}

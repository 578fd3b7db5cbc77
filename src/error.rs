//! Crate-wide error type and Result alias.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Table {0} not configured for sync")]
    TableNotConfigured(String),

    #[error("Record not found")]
    RecordNotFound,

    #[error("Access denied")]
    AccessDenied,

    #[error("Version mismatch for {table}/{id}: expected {expected}, found {found}")]
    VersionMismatch {
        table: String,
        id: String,
        expected: i64,
        found: i64,
    },

    #[error("SyncEngine not initialized")]
    NotInitialized,

    #[error("Realtime service unavailable")]
    RealtimeUnavailable,

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<rusqlite::Error> for SyncError {
    fn from(e: rusqlite::Error) -> Self {
        SyncError::Storage(e.to_string())
    }
}

// ============================================================================
// TransportError — network-layer failures
// ============================================================================

/// Classification of transport failures, used to decide retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Retriable (network, temporary failures)
    Transient,
    /// Not retriable (bad request, protocol violation)
    Permanent,
    /// Authentication failed
    Auth,
}

/// Error produced by a [`SyncTransport`](crate::sync::SyncTransport) or
/// [`StreamTransport`](crate::realtime::StreamTransport) implementation.
///
/// Wraps arbitrary error strings from the network layer so the engines never
/// depend on a concrete HTTP client.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
    pub kind: TransportErrorKind,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: TransportErrorKind::Transient,
        }
    }

    pub fn with_kind(message: impl Into<String>, kind: TransportErrorKind) -> Self {
        Self {
            message: message.into(),
            kind,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == TransportErrorKind::Transient
    }
}

//! Wire form of the server-to-client event stream.

use serde::{Deserialize, Serialize};

use crate::types::Operation;

/// One event on a realtime stream. Ids are assigned monotonically per
/// server; clients echo the highest seen id back on reconnect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    pub id: u64,
    #[serde(flatten)]
    pub payload: EventPayload,
    pub timestamp: i64,
}

/// Event payloads, serialized as `{"type": ..., "data": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum EventPayload {
    /// First event on every stream.
    #[serde(rename_all = "camelCase")]
    Connected {
        connection_id: String,
        tables: Vec<String>,
    },
    /// Authoritative operations fanned out to this subscriber.
    Operations {
        operations: Vec<Operation>,
        tables: Vec<String>,
    },
    /// Liveness signal; resets the client watchdog.
    Heartbeat { timestamp: i64 },
    /// Server-requested reconnection (reserved).
    Reconnect,
    /// Out-of-band diagnostic.
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_wire_shape() {
        let event = StreamEvent {
            id: 7,
            payload: EventPayload::Heartbeat { timestamp: 123 },
            timestamp: 123,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["id"], json!(7));
        assert_eq!(value["type"], json!("heartbeat"));
        assert_eq!(value["data"]["timestamp"], json!(123));
    }

    #[test]
    fn connected_event_round_trip() {
        let event = StreamEvent {
            id: 1,
            payload: EventPayload::Connected {
                connection_id: "conn-1".to_string(),
                tables: vec!["todos".to_string()],
            },
            timestamp: 0,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], json!("connected"));
        assert_eq!(value["data"]["connectionId"], json!("conn-1"));

        let decoded: StreamEvent = serde_json::from_value(value).unwrap();
        assert!(matches!(decoded.payload, EventPayload::Connected { .. }));
    }
}

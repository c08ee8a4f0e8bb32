//! Message types for the RPC client

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use super::error::RpcError;
use crate::broker::{ConnectionEvent, Delivery};

/// Outcome delivered to the caller of a request/reply call
pub type CallOutcome = Result<Value, RpcError>;

/// Envelope published to the work queue
///
/// Reply routing (`correlationId`, `replyTo`) travels as message properties,
/// never inside this body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    /// Task kind discriminator
    #[serde(rename = "type")]
    pub task_type: String,

    pub payload: Value,

    /// When the request was issued
    pub timestamp: DateTime<Utc>,
}

impl TaskMessage {
    pub fn new(task_type: impl Into<String>, payload: Value) -> Self {
        Self {
            task_type: task_type.into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Encode as a UTF-8 JSON body
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// Connection lifecycle as seen by the client
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// Requests processed by the client task
#[derive(Debug)]
pub enum ClientRequest {
    /// Issue a request/reply call
    ///
    /// `accepted_tx` learns whether the request was published; `reply_tx`
    /// later receives the settlement.
    Call {
        task_type: String,
        payload: Value,
        timeout: Duration,
        accepted_tx: oneshot::Sender<Result<String, RpcError>>,
        reply_tx: oneshot::Sender<CallOutcome>,
    },

    /// Publish a task without expecting a reply
    Send {
        task_type: String,
        payload: Value,
        reply_tx: oneshot::Sender<Result<(), RpcError>>,
    },

    /// A delivery from the reply queue (internal)
    Reply { generation: u64, delivery: Delivery },

    /// Timeout expiry for a pending call (internal)
    CallTimeout { correlation_id: String },

    /// Event from a broker connection (internal)
    Connection { generation: u64, event: ConnectionEvent },

    /// Get current metrics
    GetMetrics {
        reply_tx: oneshot::Sender<ClientMetrics>,
    },

    /// Close the broker connection; the client reconnects on next use
    Close { reply_tx: oneshot::Sender<()> },

    /// Close the connection, fail outstanding calls and stop the client
    Shutdown { reply_tx: oneshot::Sender<()> },
}

/// Client metrics for observability
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClientMetrics {
    pub state: ConnectionState,
    /// Increments on every successful connect
    pub generation: u64,
    pub reply_queue: Option<String>,
    pub pending_calls: usize,
    pub calls_issued: u64,
    pub replies_settled: u64,
    pub malformed_replies: u64,
    /// Replies with no matching pending call (late, foreign or uncorrelated)
    pub orphan_replies: u64,
    pub timeouts: u64,
    pub tasks_sent: u64,
    pub connect_failures: u64,
    pub publish_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_message_serialization() {
        let msg = TaskMessage::new("process_debtor_register", json!({"community_name": "Lviv"}));

        let value: Value = serde_json::from_slice(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(value["type"], "process_debtor_register");
        assert_eq!(value["payload"]["community_name"], "Lviv");
        assert!(value["timestamp"].is_string());
        assert!(value.get("correlationId").is_none());
        assert!(value.get("replyTo").is_none());

        let decoded: TaskMessage = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_timestamp_is_rfc3339() {
        let msg = TaskMessage::new("send_email", json!({}));
        let value = serde_json::to_value(&msg).unwrap();
        let ts = value["timestamp"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(ts).is_ok());
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(serde_json::to_string(&ConnectionState::Connecting).unwrap(), "\"connecting\"");
    }
}

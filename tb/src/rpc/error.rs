//! RPC client error types

use std::time::Duration;
use thiserror::Error;

use crate::broker::BrokerError;

/// Errors surfaced to callers of the RPC client
#[derive(Debug, Error)]
pub enum RpcError {
    /// Broker unreachable, credentials rejected, or connect timed out
    #[error("Broker connection failed: {0}")]
    Connection(#[source] BrokerError),

    /// The channel rejected the outbound message
    #[error("Publish failed: {0}")]
    Publish(#[source] BrokerError),

    #[error("Timeout: worker did not reply to {correlation_id} within {timeout:?}")]
    Timeout { correlation_id: String, timeout: Duration },

    #[error("Malformed reply for {correlation_id}: {source}")]
    MalformedReply {
        correlation_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode task message: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The client was shut down, or stopped before settling the call
    #[error("RPC client closed")]
    ClientClosed,
}

impl RpcError {
    /// Check if this is a reply timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout { .. })
    }

    /// Check if re-issuing the same call could succeed
    ///
    /// Nothing is retried automatically; this is advice for the caller.
    pub fn is_retryable(&self) -> bool {
        match self {
            RpcError::Connection(_) => true,
            RpcError::Publish(_) => true,
            RpcError::Timeout { .. } => true,
            RpcError::MalformedReply { .. } => false,
            RpcError::Serialization(_) => false,
            RpcError::ClientClosed => false,
        }
    }

    /// Correlation id of the call this error settled, if it got that far
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            RpcError::Timeout { correlation_id, .. } | RpcError::MalformedReply { correlation_id, .. } => {
                Some(correlation_id)
            }
            _ => None,
        }
    }
}

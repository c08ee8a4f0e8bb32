//! Task service error types

use thiserror::Error;

use crate::rpc::RpcError;

/// Errors from the task service
#[derive(Debug, Error)]
pub enum TaskError {
    /// The request was rejected before anything was published
    #[error("{0}")]
    InvalidInput(String),

    /// The worker replied but reported failure
    #[error("{message}")]
    Worker { task_type: String, message: String },

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl TaskError {
    /// Check if the worker did not answer in time
    pub fn is_timeout(&self) -> bool {
        matches!(self, TaskError::Rpc(e) if e.is_timeout())
    }

    /// HTTP-style status for this error
    pub fn status_code(&self) -> u16 {
        match self {
            TaskError::InvalidInput(_) => 400,
            TaskError::Rpc(e) if e.is_timeout() => 408,
            TaskError::Worker { .. } | TaskError::Rpc(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn timeout() -> TaskError {
        TaskError::Rpc(RpcError::Timeout {
            correlation_id: "c1".to_string(),
            timeout: Duration::from_secs(60),
        })
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(TaskError::InvalidInput("community_name is required".to_string()).status_code(), 400);
        assert_eq!(timeout().status_code(), 408);
        assert_eq!(
            TaskError::Worker {
                task_type: "send_email".to_string(),
                message: "SMTP down".to_string()
            }
            .status_code(),
            500
        );
        assert_eq!(TaskError::Rpc(RpcError::ClientClosed).status_code(), 500);
    }

    #[test]
    fn test_is_timeout() {
        assert!(timeout().is_timeout());
        assert!(!TaskError::Rpc(RpcError::ClientClosed).is_timeout());
        assert!(!TaskError::InvalidInput("x".to_string()).is_timeout());
    }

    #[test]
    fn test_display_passes_through() {
        let err = TaskError::Worker {
            task_type: "process_debtor_register".to_string(),
            message: "Community not found".to_string(),
        };
        assert_eq!(err.to_string(), "Community not found");
        assert!(timeout().to_string().starts_with("Timeout"));
    }
}

//! Debtor-registry and email tasks on top of the RPC client

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{error, info};

use super::error::TaskError;
use crate::config::TasksConfig;
use crate::rpc::RpcHandle;

/// The tasks the worker understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    ProcessDebtorRegister,
    SendEmail,
}

impl TaskKind {
    /// Wire name carried in the message `type` field
    pub fn task_type(&self) -> &'static str {
        match self {
            TaskKind::ProcessDebtorRegister => "process_debtor_register",
            TaskKind::SendEmail => "send_email",
        }
    }

    pub fn timeout(&self, config: &TasksConfig) -> Duration {
        match self {
            TaskKind::ProcessDebtorRegister => config.register_timeout(),
            TaskKind::SendEmail => config.email_timeout(),
        }
    }

    /// Message shown to a user whose call timed out
    pub fn timeout_message(&self) -> &'static str {
        match self {
            TaskKind::ProcessDebtorRegister => "Timed out waiting for the worker. Please try again.",
            TaskKind::SendEmail => "Timed out waiting for the worker. The email may still be sent later.",
        }
    }

    fn default_failure(&self) -> &'static str {
        match self {
            TaskKind::ProcessDebtorRegister => "Worker failed to process the debtor register",
            TaskKind::SendEmail => "Worker failed to send the email",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.task_type())
    }
}

/// Response body at the HTTP boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResponse {
    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }

    /// Map a task outcome to a status code and response body
    pub fn from_outcome(kind: TaskKind, outcome: Result<Value, TaskError>) -> (u16, Self) {
        match outcome {
            Ok(data) => (200, Self::ok(data)),
            Err(e) if e.is_timeout() => (e.status_code(), Self::failed(kind.timeout_message())),
            Err(e) => (e.status_code(), Self::failed(e.to_string())),
        }
    }
}

/// Issues the worker's tasks with their configured timeouts
#[derive(Clone)]
pub struct TaskService {
    rpc: RpcHandle,
    timeouts: TasksConfig,
}

impl TaskService {
    pub fn new(rpc: RpcHandle, timeouts: TasksConfig) -> Self {
        Self { rpc, timeouts }
    }

    /// Process a community's debtor register and wait for the totals
    pub async fn process_debtor_register(&self, community_name: &str) -> Result<Value, TaskError> {
        self.run(TaskKind::ProcessDebtorRegister, community_name).await
    }

    /// Send a community's results email and wait for confirmation
    pub async fn send_email(&self, community_name: &str) -> Result<Value, TaskError> {
        self.run(TaskKind::SendEmail, community_name).await
    }

    /// Queue the results email without waiting for the worker
    pub async fn queue_email(&self, community_name: &str) -> Result<(), TaskError> {
        validate_community(community_name)?;
        info!(task_type = %TaskKind::SendEmail, %community_name, "Queueing task");
        self.rpc
            .send(TaskKind::SendEmail.task_type(), payload(community_name))
            .await?;
        Ok(())
    }

    async fn run(&self, kind: TaskKind, community_name: &str) -> Result<Value, TaskError> {
        validate_community(community_name)?;
        info!(task_type = %kind, %community_name, "Submitting task");

        let result = self
            .rpc
            .call(kind.task_type(), payload(community_name), kind.timeout(&self.timeouts))
            .await
            .map_err(TaskError::from)
            .and_then(|reply| check_reply(kind, reply));

        match &result {
            Ok(reply) => match kind {
                TaskKind::ProcessDebtorRegister => {
                    info!(task_type = %kind, %community_name, total_records = %field(reply, "total_records"), "Task completed");
                }
                TaskKind::SendEmail => {
                    info!(task_type = %kind, %community_name, recipient_email = %field(reply, "recipient_email"), "Task completed");
                }
            },
            Err(e) => error!(task_type = %kind, %community_name, error = %e, "Task failed"),
        }
        result
    }
}

fn payload(community_name: &str) -> Value {
    json!({ "community_name": community_name })
}

fn validate_community(community_name: &str) -> Result<(), TaskError> {
    if community_name.trim().is_empty() {
        return Err(TaskError::InvalidInput("community_name is required".to_string()));
    }
    Ok(())
}

/// Treat anything but `"success": true` as a worker-side failure
fn check_reply(kind: TaskKind, reply: Value) -> Result<Value, TaskError> {
    if reply.get("success").and_then(Value::as_bool) == Some(true) {
        return Ok(reply);
    }
    let message = reply
        .get("error")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .unwrap_or(kind.default_failure())
        .to_string();
    Err(TaskError::Worker {
        task_type: kind.task_type().to_string(),
        message,
    })
}

fn field<'a>(reply: &'a Value, name: &str) -> &'a Value {
    reply.get(name).unwrap_or(&Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::rpc::{ClientConfig, RpcClient, RpcError};
    use std::sync::Arc;

    fn service(broker: &MemoryBroker, timeouts: TasksConfig) -> TaskService {
        let (handle, _task) =
            RpcClient::new(&ClientConfig::default(), "debtor_tasks", Arc::new(broker.clone())).spawn();
        TaskService::new(handle, timeouts)
    }

    /// Reply to every request with `reply`, checking the task type
    fn spawn_worker(broker: &MemoryBroker, expected_type: &'static str, reply: Value) {
        let mut work = broker.subscribe("debtor_tasks").unwrap();
        let broker = broker.clone();
        tokio::spawn(async move {
            while let Some(request) = work.recv().await {
                let message: Value = serde_json::from_slice(&request.body).unwrap();
                assert_eq!(message["type"], expected_type);
                assert_eq!(message["payload"]["community_name"], "Lviv");
                if let Some(reply_to) = request.reply_to {
                    let body = serde_json::to_vec(&reply).unwrap();
                    broker.deliver(&reply_to, request.correlation_id.as_deref(), &body);
                }
            }
        });
    }

    #[tokio::test]
    async fn test_process_debtor_register_success() {
        let broker = MemoryBroker::new();
        spawn_worker(
            &broker,
            "process_debtor_register",
            json!({"success": true, "total_records": 42}),
        );
        let service = service(&broker, TasksConfig::default());

        let result = service.process_debtor_register("Lviv").await.unwrap();
        assert_eq!(result["total_records"], 42);
    }

    #[tokio::test]
    async fn test_send_email_worker_failure() {
        let broker = MemoryBroker::new();
        spawn_worker(&broker, "send_email", json!({"success": false, "error": "SMTP down"}));
        let service = service(&broker, TasksConfig::default());

        let err = service.send_email("Lviv").await.unwrap_err();
        assert!(matches!(&err, TaskError::Worker { task_type, message } if task_type == "send_email" && message == "SMTP down"));
        assert_eq!(err.status_code(), 500);
    }

    #[tokio::test]
    async fn test_missing_success_uses_default_message() {
        let broker = MemoryBroker::new();
        spawn_worker(&broker, "process_debtor_register", json!({"total_records": 1}));
        let service = service(&broker, TasksConfig::default());

        let err = service.process_debtor_register("Lviv").await.unwrap_err();
        assert_eq!(err.to_string(), "Worker failed to process the debtor register");
    }

    #[tokio::test]
    async fn test_invalid_input_publishes_nothing() {
        let broker = MemoryBroker::new();
        let service = service(&broker, TasksConfig::default());

        let err = service.process_debtor_register("  ").await.unwrap_err();
        assert!(matches!(err, TaskError::InvalidInput(_)));
        assert_eq!(err.status_code(), 400);
        assert!(matches!(service.queue_email("").await, Err(TaskError::InvalidInput(_))));
        assert_eq!(broker.connect_attempts(), 0);
        assert_eq!(broker.published_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_maps_to_408() {
        let broker = MemoryBroker::new();
        let timeouts = TasksConfig {
            register_timeout_ms: 60_000,
            email_timeout_ms: 50,
        };
        let service = service(&broker, timeouts);

        let outcome = service.send_email("Lviv").await;
        assert!(matches!(&outcome, Err(TaskError::Rpc(RpcError::Timeout { .. }))));

        let (status, body) = TaskResponse::from_outcome(TaskKind::SendEmail, outcome);
        assert_eq!(status, 408);
        assert!(!body.success);
        assert_eq!(body.error.as_deref(), Some(TaskKind::SendEmail.timeout_message()));
    }

    #[tokio::test]
    async fn test_queue_email_without_worker() {
        let broker = MemoryBroker::new();
        broker.declare_queue("debtor_tasks");
        let service = service(&broker, TasksConfig::default());

        service.queue_email("Lviv").await.unwrap();
        assert_eq!(broker.published_count(), 1);
    }

    #[test]
    fn test_response_serialization() {
        let (status, body) = TaskResponse::from_outcome(TaskKind::ProcessDebtorRegister, Ok(json!({"total_records": 3})));
        assert_eq!(status, 200);
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({"success": true, "data": {"total_records": 3}})
        );

        let (status, body) = TaskResponse::from_outcome(
            TaskKind::ProcessDebtorRegister,
            Err(TaskError::InvalidInput("community_name is required".to_string())),
        );
        assert_eq!(status, 400);
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({"success": false, "error": "community_name is required"})
        );
    }

    #[test]
    fn test_task_kind_defaults() {
        let config = TasksConfig::default();
        assert_eq!(TaskKind::ProcessDebtorRegister.timeout(&config), Duration::from_secs(60));
        assert_eq!(TaskKind::SendEmail.timeout(&config), Duration::from_secs(120));
        assert_eq!(TaskKind::SendEmail.to_string(), "send_email");
    }
}

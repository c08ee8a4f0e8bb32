//! RpcHandle - Client interface to the RPC client task

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::error::RpcError;
use super::messages::{CallOutcome, ClientMetrics, ClientRequest};

/// Handle for issuing tasks through the RPC client
///
/// Cloneable; every clone talks to the same client task and shares its
/// connection and reply queue.
#[derive(Clone)]
pub struct RpcHandle {
    tx: mpsc::Sender<ClientRequest>,
}

impl RpcHandle {
    pub(crate) fn new(tx: mpsc::Sender<ClientRequest>) -> Self {
        debug!("RpcHandle::new: called");
        Self { tx }
    }

    /// Publish a request/reply call and return its pending reply
    ///
    /// Resolves once the request is on the broker. Connection and publish
    /// failures surface here; the reply, timeout or shutdown outcome is
    /// delivered by awaiting the returned [`PendingReply`].
    pub async fn submit(
        &self,
        task_type: impl Into<String>,
        payload: Value,
        timeout: Duration,
    ) -> Result<PendingReply, RpcError> {
        let task_type = task_type.into();
        debug!(%task_type, ?timeout, "RpcHandle::submit: called");
        let (accepted_tx, accepted_rx) = oneshot::channel();
        let (reply_tx, reply_rx) = oneshot::channel();

        self.tx
            .send(ClientRequest::Call {
                task_type: task_type.clone(),
                payload,
                timeout,
                accepted_tx,
                reply_tx,
            })
            .await
            .map_err(|_| RpcError::ClientClosed)?;

        let correlation_id = accepted_rx.await.map_err(|_| RpcError::ClientClosed)??;
        debug!(%correlation_id, "RpcHandle::submit: published");

        Ok(PendingReply {
            correlation_id,
            task_type,
            rx: reply_rx,
            _client: self.tx.clone(),
        })
    }

    /// Publish a task and wait for the worker's reply
    ///
    /// Fails with [`RpcError::Timeout`] if no reply arrives within `timeout`.
    pub async fn call(&self, task_type: impl Into<String>, payload: Value, timeout: Duration) -> Result<Value, RpcError> {
        self.submit(task_type, payload, timeout).await?.await
    }

    /// Publish a task without waiting for any reply
    pub async fn send(&self, task_type: impl Into<String>, payload: Value) -> Result<(), RpcError> {
        let task_type = task_type.into();
        debug!(%task_type, "RpcHandle::send: called");
        let (reply_tx, reply_rx) = oneshot::channel();

        self.tx
            .send(ClientRequest::Send {
                task_type,
                payload,
                reply_tx,
            })
            .await
            .map_err(|_| RpcError::ClientClosed)?;

        reply_rx.await.map_err(|_| RpcError::ClientClosed)?
    }

    /// Get current client metrics
    pub async fn metrics(&self) -> Result<ClientMetrics, RpcError> {
        debug!("RpcHandle::metrics: called");
        let (reply_tx, reply_rx) = oneshot::channel();

        self.tx
            .send(ClientRequest::GetMetrics { reply_tx })
            .await
            .map_err(|_| RpcError::ClientClosed)?;

        reply_rx.await.map_err(|_| RpcError::ClientClosed)
    }

    /// Close the broker connection
    ///
    /// Pending calls are left to time out; the next call reconnects.
    pub async fn close(&self) -> Result<(), RpcError> {
        debug!("RpcHandle::close: called");
        let (reply_tx, reply_rx) = oneshot::channel();

        self.tx
            .send(ClientRequest::Close { reply_tx })
            .await
            .map_err(|_| RpcError::ClientClosed)?;

        reply_rx.await.map_err(|_| RpcError::ClientClosed)
    }

    /// Close the connection, fail outstanding calls with [`RpcError::ClientClosed`]
    /// and stop the client task
    pub async fn shutdown(&self) -> Result<(), RpcError> {
        debug!("RpcHandle::shutdown: called");
        let (reply_tx, reply_rx) = oneshot::channel();

        self.tx
            .send(ClientRequest::Shutdown { reply_tx })
            .await
            .map_err(|_| RpcError::ClientClosed)?;

        reply_rx.await.map_err(|_| RpcError::ClientClosed)
    }
}

/// A published call awaiting its reply
///
/// Keeps the client task alive until it settles.
#[derive(Debug)]
pub struct PendingReply {
    correlation_id: String,
    task_type: String,
    rx: oneshot::Receiver<CallOutcome>,
    _client: mpsc::Sender<ClientRequest>,
}

impl PendingReply {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn task_type(&self) -> &str {
        &self.task_type
    }
}

impl Future for PendingReply {
    type Output = CallOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(RpcError::ClientClosed)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_handle_reports_closed_client() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let handle = RpcHandle::new(tx);

        assert!(matches!(
            handle.call("t", json!({}), Duration::from_secs(1)).await,
            Err(RpcError::ClientClosed)
        ));
        assert!(matches!(handle.send("t", json!({})).await, Err(RpcError::ClientClosed)));
        assert!(matches!(handle.metrics().await, Err(RpcError::ClientClosed)));
        assert!(matches!(handle.shutdown().await, Err(RpcError::ClientClosed)));
    }

    #[tokio::test]
    async fn test_pending_reply_resolves_from_settlement() {
        let (tx, mut rx) = mpsc::channel(4);
        let handle = RpcHandle::new(tx);

        let client = tokio::spawn(async move {
            match rx.recv().await.unwrap() {
                ClientRequest::Call {
                    task_type,
                    accepted_tx,
                    reply_tx,
                    ..
                } => {
                    assert_eq!(task_type, "send_email");
                    accepted_tx.send(Ok("corr-7".to_string())).unwrap();
                    reply_tx.send(Ok(json!({"success": true}))).unwrap();
                }
                other => panic!("Expected Call, got {:?}", other),
            }
        });

        let pending = handle
            .submit("send_email", json!({"to": "a@b.c"}), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(pending.correlation_id(), "corr-7");
        assert_eq!(pending.task_type(), "send_email");
        assert_eq!(pending.await.unwrap(), json!({"success": true}));
        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_pending_reply_dropped_sender_is_client_closed() {
        let (tx, mut rx) = mpsc::channel(4);
        let handle = RpcHandle::new(tx);

        tokio::spawn(async move {
            if let Some(ClientRequest::Call {
                accepted_tx, reply_tx, ..
            }) = rx.recv().await
            {
                accepted_tx.send(Ok("corr-1".to_string())).unwrap();
                drop(reply_tx);
            }
        });

        let pending = handle.submit("t", json!({}), Duration::from_secs(1)).await.unwrap();
        assert!(matches!(pending.await, Err(RpcError::ClientClosed)));
    }
}

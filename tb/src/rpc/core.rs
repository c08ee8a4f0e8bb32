//! Main RPC client task implementation

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::config::ClientConfig;
use super::connection::ConnectionManager;
use super::dispatcher::{self, Disposition};
use super::error::RpcError;
use super::handle::RpcHandle;
use super::messages::{CallOutcome, ClientMetrics, ClientRequest, TaskMessage};
use super::registry::{CorrelationRegistry, PendingCall};
use crate::broker::{BrokerError, ConnectionEvent, Connector, Delivery, OutboundMessage};

/// The RPC client task
///
/// Owns the broker connection and the correlation registry. Callers talk to
/// it through [`RpcHandle`]; replies, timer expiries and connection events
/// arrive on the same inbox, so every pending call is settled by one writer.
pub struct RpcClient {
    tx: mpsc::Sender<ClientRequest>,
    rx: mpsc::Receiver<ClientRequest>,
    connector: Arc<dyn Connector>,
    work_queue: String,
    connect_timeout: Duration,
}

impl RpcClient {
    /// Create a client that publishes tasks to `work_queue`
    pub fn new(config: &ClientConfig, work_queue: impl Into<String>, connector: Arc<dyn Connector>) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_buffer);
        Self {
            tx,
            rx,
            connector,
            work_queue: work_queue.into(),
            connect_timeout: config.connect_timeout(),
        }
    }

    /// Get a sender for creating handles
    pub fn sender(&self) -> mpsc::Sender<ClientRequest> {
        self.tx.clone()
    }

    pub fn handle(&self) -> RpcHandle {
        RpcHandle::new(self.tx.clone())
    }

    /// Spawn the client task and return a handle to it
    pub fn spawn(self) -> (RpcHandle, JoinHandle<()>) {
        let handle = self.handle();
        (handle, tokio::spawn(self.run()))
    }

    /// Run the client task
    ///
    /// Runs until shutdown is requested or every handle (and every
    /// outstanding [`super::PendingReply`]) has been dropped.
    pub async fn run(self) {
        let RpcClient {
            tx,
            mut rx,
            connector,
            work_queue,
            connect_timeout,
        } = self;

        // Internal tasks hold weak senders so they never keep the client alive
        let inbox = tx.downgrade();
        drop(tx);

        let mut state = ClientState {
            conn: ConnectionManager::new(connector, work_queue, connect_timeout, inbox.clone()),
            registry: CorrelationRegistry::new(),
            metrics: ClientMetrics::default(),
            inbox,
        };

        info!(queue = %state.conn.work_queue(), "RPC client started");

        while let Some(req) = rx.recv().await {
            match req {
                ClientRequest::Call {
                    task_type,
                    payload,
                    timeout,
                    accepted_tx,
                    reply_tx,
                } => {
                    let result = state.issue_call(task_type, payload, timeout, reply_tx).await;
                    if accepted_tx.send(result).is_err() {
                        debug!("Caller stopped waiting for call acceptance");
                    }
                }

                ClientRequest::Send {
                    task_type,
                    payload,
                    reply_tx,
                } => {
                    let result = state.send_task(task_type, payload).await;
                    let _ = reply_tx.send(result);
                }

                ClientRequest::Reply { generation, delivery } => {
                    state.on_reply(generation, delivery).await;
                }

                ClientRequest::CallTimeout { correlation_id } => {
                    state.on_timeout(&correlation_id);
                }

                ClientRequest::Connection { generation, event } => {
                    state.on_connection_event(generation, event).await;
                }

                ClientRequest::GetMetrics { reply_tx } => {
                    let _ = reply_tx.send(state.snapshot());
                }

                ClientRequest::Close { reply_tx } => {
                    info!("Closing broker connection");
                    state.conn.close().await;
                    let _ = reply_tx.send(());
                }

                ClientRequest::Shutdown { reply_tx } => {
                    info!("RPC client shutting down");
                    state.stop().await;
                    let _ = reply_tx.send(());
                    break;
                }
            }
        }

        // Every handle dropped without an explicit shutdown
        if state.conn.generation() > 0 || !state.registry.is_empty() {
            state.stop().await;
        }
        info!(
            calls = state.metrics.calls_issued,
            timeouts = state.metrics.timeouts,
            "RPC client stopped"
        );
    }
}

/// State owned by the running client task
struct ClientState {
    conn: ConnectionManager,
    registry: CorrelationRegistry,
    metrics: ClientMetrics,
    inbox: mpsc::WeakSender<ClientRequest>,
}

impl ClientState {
    /// Register and publish a request/reply call, returning its correlation id
    async fn issue_call(
        &mut self,
        task_type: String,
        payload: Value,
        timeout: Duration,
        reply_tx: oneshot::Sender<CallOutcome>,
    ) -> Result<String, RpcError> {
        if let Err(e) = self.conn.ensure_connected().await {
            self.metrics.connect_failures += 1;
            return Err(RpcError::Connection(e));
        }
        let reply_queue = match self.conn.reply_queue() {
            Some(queue) => queue.to_string(),
            None => return Err(RpcError::Connection(BrokerError::ChannelClosed)),
        };

        let body = TaskMessage::new(task_type.as_str(), payload).to_bytes()?;

        let mut call = PendingCall::new(task_type.as_str(), timeout, reply_tx);
        let correlation_id = loop {
            let candidate = Uuid::new_v4().to_string();
            match self.registry.insert(candidate.clone(), call) {
                Ok(()) => break candidate,
                Err(rejected) => {
                    warn!(correlation_id = %candidate, "Correlation id already in flight, drawing another");
                    call = rejected;
                }
            }
        };
        let timer = spawn_timer(correlation_id.clone(), timeout, self.inbox.clone());
        self.registry.arm(&correlation_id, timer);

        let message = OutboundMessage::json(body).with_reply(correlation_id.as_str(), reply_queue.as_str());
        if let Err(e) = self.conn.publish(message).await {
            // Never published, so no reply can arrive; the caller hears about it
            // through the returned error instead of a settlement
            self.registry.remove(&correlation_id);
            self.metrics.publish_failures += 1;
            error!(%correlation_id, %task_type, error = %e, "Failed to publish task");
            self.drop_if_closed(&e).await;
            return Err(RpcError::Publish(e));
        }

        self.metrics.calls_issued += 1;
        debug!(%correlation_id, %task_type, ?timeout, %reply_queue, "Call published");
        Ok(correlation_id)
    }

    /// Publish a task with no reply expected
    async fn send_task(&mut self, task_type: String, payload: Value) -> Result<(), RpcError> {
        if let Err(e) = self.conn.ensure_connected().await {
            self.metrics.connect_failures += 1;
            return Err(RpcError::Connection(e));
        }

        let body = TaskMessage::new(task_type.as_str(), payload).to_bytes()?;
        if let Err(e) = self.conn.publish(OutboundMessage::json(body)).await {
            self.metrics.publish_failures += 1;
            error!(%task_type, error = %e, "Failed to send task");
            self.drop_if_closed(&e).await;
            return Err(RpcError::Publish(e));
        }

        self.metrics.tasks_sent += 1;
        info!(%task_type, queue = %self.conn.work_queue(), "Task sent");
        Ok(())
    }

    async fn on_reply(&mut self, generation: u64, delivery: Delivery) {
        match dispatcher::dispatch(&mut self.registry, &delivery) {
            Disposition::Resolved => self.metrics.replies_settled += 1,
            Disposition::Malformed => {
                self.metrics.replies_settled += 1;
                self.metrics.malformed_replies += 1;
            }
            Disposition::Orphan | Disposition::Uncorrelated => self.metrics.orphan_replies += 1,
        }

        // Acked whatever the outcome; a reply is never redelivered
        if let Err(e) = self.conn.ack(generation, delivery.delivery_tag).await {
            debug!(generation, delivery_tag = delivery.delivery_tag, error = %e, "Reply ack skipped");
        }
    }

    fn on_timeout(&mut self, correlation_id: &str) {
        let Some(call) = self.registry.get(correlation_id) else {
            // Already settled by a reply that raced the timer
            return;
        };
        let timeout = call.timeout();
        warn!(
            %correlation_id,
            task_type = %call.task_type(),
            ?timeout,
            elapsed = ?call.elapsed(),
            "Call timed out"
        );

        self.registry.settle(
            correlation_id,
            Err(RpcError::Timeout {
                correlation_id: correlation_id.to_string(),
                timeout,
            }),
        );
        self.metrics.timeouts += 1;
    }

    async fn on_connection_event(&mut self, generation: u64, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Error(message) => {
                error!(generation, error = %message, "Broker connection error");
            }
            ConnectionEvent::Closed => {
                if self.conn.teardown(generation).await {
                    warn!(
                        generation,
                        pending = self.registry.len(),
                        "Broker connection closed, pending calls will time out"
                    );
                } else {
                    debug!(generation, "Ignoring closure of a stale connection");
                }
            }
        }
    }

    /// Forget a connection whose channel is gone so the next call reconnects
    async fn drop_if_closed(&mut self, err: &BrokerError) {
        if err.is_closed() {
            let generation = self.conn.generation();
            self.conn.teardown(generation).await;
        }
    }

    fn snapshot(&self) -> ClientMetrics {
        ClientMetrics {
            state: self.conn.state(),
            generation: self.conn.generation(),
            reply_queue: self.conn.reply_queue().map(str::to_string),
            pending_calls: self.registry.len(),
            ..self.metrics.clone()
        }
    }

    /// Close the connection and fail every outstanding call
    async fn stop(&mut self) {
        self.conn.close().await;
        let failed = self.registry.settle_all(|_, _| Err(RpcError::ClientClosed));
        if failed > 0 {
            warn!(count = failed, "Failed outstanding calls on shutdown");
        }
    }
}

/// Report a call's expiry to the client task after `timeout`
fn spawn_timer(correlation_id: String, timeout: Duration, inbox: mpsc::WeakSender<ClientRequest>) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        if let Some(tx) = inbox.upgrade() {
            let _ = tx.send(ClientRequest::CallTimeout { correlation_id }).await;
        }
    })
}

//! In-process broker with AMQP-like queue semantics
//!
//! Queues are routed through the default exchange by name. Durable queues
//! outlive connections; exclusive queues are deleted when their owning
//! connection is closed by the client or dropped by the broker, which ends any
//! consumer on them. A connection handle dropped without `close` stays open,
//! as an AMQP socket would, and is counted by
//! [`MemoryBroker::abandoned_connections`]. Messages
//! published to an unknown queue are dropped, as the default exchange does
//! without the `mandatory` flag.
//!
//! Besides the [`Connector`] implementation, [`MemoryBroker`] exposes the
//! worker side (`subscribe`, `deliver`) and fault injection
//! (`refuse_connections`, `reject_publishes`, `drop_connections`).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::{
    BrokerChannel, BrokerConnection, BrokerError, ConnectionEvent, ConnectionEvents, Connector, Delivery,
    DeliveryStream, OutboundMessage,
};

struct MemoryQueue {
    /// Connection that owns an exclusive queue
    owner: Option<u64>,
    tx: mpsc::UnboundedSender<Delivery>,
    /// Taken by the first consumer
    rx: Option<mpsc::UnboundedReceiver<Delivery>>,
}

impl MemoryQueue {
    fn new(owner: Option<u64>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { owner, tx, rx: Some(rx) }
    }
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, MemoryQueue>,
    /// Open connections and their event listeners
    connections: HashMap<u64, ConnectionEvents>,
    next_connection_id: u64,
    next_delivery_tag: u64,
    connect_attempts: u64,
    refuse_connections: Option<String>,
    reject_publishes: Option<String>,
    published: u64,
    unroutable: u64,
    /// Connection handles dropped while still open
    abandoned: u64,
    acked: Vec<u64>,
}

impl BrokerState {
    fn next_tag(&mut self) -> u64 {
        self.next_delivery_tag += 1;
        self.next_delivery_tag
    }

    fn enqueue(
        &mut self,
        queue: &str,
        correlation_id: Option<String>,
        reply_to: Option<String>,
        persistent: bool,
        body: Vec<u8>,
    ) -> bool {
        let delivery_tag = self.next_tag();
        let Some(target) = self.queues.get(queue) else {
            self.unroutable += 1;
            return false;
        };
        let delivery = Delivery {
            delivery_tag,
            correlation_id,
            reply_to,
            persistent,
            body,
        };
        // A closed receiver means the consumer went away; the message is lost
        // exactly as it would be for a deleted queue.
        target.tx.send(delivery).is_ok()
    }

    /// Remove a connection and every exclusive queue it owns
    fn disconnect(&mut self, connection_id: u64) -> Option<ConnectionEvents> {
        self.queues.retain(|_, q| q.owner != Some(connection_id));
        self.connections.remove(&connection_id)
    }
}

/// Shared in-process broker; clones refer to the same broker
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // Every mutation is a single-step update, so a poisoned lock still
        // guards consistent state.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Declare a durable queue (idempotent), as a worker asserting its queue would
    pub fn declare_queue(&self, name: &str) {
        self.lock()
            .queues
            .entry(name.to_string())
            .or_insert_with(|| MemoryQueue::new(None));
    }

    /// Take the consumer side of a queue, declaring it durable if needed
    ///
    /// Fails if the queue already has a consumer.
    pub fn subscribe(&self, name: &str) -> Result<mpsc::UnboundedReceiver<Delivery>, BrokerError> {
        debug!(%name, "MemoryBroker::subscribe: called");
        let mut state = self.lock();
        let queue = state
            .queues
            .entry(name.to_string())
            .or_insert_with(|| MemoryQueue::new(None));
        queue
            .rx
            .take()
            .ok_or_else(|| BrokerError::Channel(format!("queue '{}' already has a consumer", name)))
    }

    /// Publish a message to `queue` directly, as a worker replying would
    ///
    /// Returns false when the queue does not exist (or lost its consumer).
    pub fn deliver(&self, queue: &str, correlation_id: Option<&str>, body: &[u8]) -> bool {
        debug!(%queue, ?correlation_id, "MemoryBroker::deliver: called");
        self.lock()
            .enqueue(queue, correlation_id.map(str::to_string), None, false, body.to_vec())
    }

    /// Refuse new connections with `reason` until [`MemoryBroker::accept_connections`]
    pub fn refuse_connections(&self, reason: &str) {
        self.lock().refuse_connections = Some(reason.to_string());
    }

    pub fn accept_connections(&self) {
        self.lock().refuse_connections = None;
    }

    /// Reject publishes with `reason` until [`MemoryBroker::accept_publishes`]
    pub fn reject_publishes(&self, reason: &str) {
        self.lock().reject_publishes = Some(reason.to_string());
    }

    pub fn accept_publishes(&self) {
        self.lock().reject_publishes = None;
    }

    /// Simulate the broker dropping every open connection
    ///
    /// Exclusive queues are deleted (ending their consumers) and each
    /// connection's listener receives [`ConnectionEvent::Closed`].
    pub fn drop_connections(&self) {
        let listeners: Vec<ConnectionEvents> = {
            let mut state = self.lock();
            let ids: Vec<u64> = state.connections.keys().copied().collect();
            ids.into_iter().filter_map(|id| state.disconnect(id)).collect()
        };
        debug!(count = listeners.len(), "MemoryBroker::drop_connections: dropping");
        for events in listeners {
            let _ = events.send(ConnectionEvent::Closed);
        }
    }

    /// Report a connection-level error on every open connection without closing it
    pub fn raise_connection_error(&self, message: &str) {
        for events in self.lock().connections.values() {
            let _ = events.send(ConnectionEvent::Error(message.to_string()));
        }
    }

    pub fn open_connections(&self) -> usize {
        self.lock().connections.len()
    }

    /// Connections whose handle was dropped without being closed
    pub fn abandoned_connections(&self) -> u64 {
        self.lock().abandoned
    }

    pub fn connect_attempts(&self) -> u64 {
        self.lock().connect_attempts
    }

    /// Messages accepted through a channel's publish
    pub fn published_count(&self) -> u64 {
        self.lock().published
    }

    /// Messages dropped because their queue did not exist
    pub fn unroutable_count(&self) -> u64 {
        self.lock().unroutable
    }

    pub fn acked_tags(&self) -> Vec<u64> {
        self.lock().acked.clone()
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    /// Names of the exclusive queues currently alive
    pub fn exclusive_queues(&self) -> HashSet<String> {
        self.lock()
            .queues
            .iter()
            .filter(|(_, q)| q.owner.is_some())
            .map(|(name, _)| name.clone())
            .collect()
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self, events: ConnectionEvents) -> Result<Box<dyn BrokerConnection>, BrokerError> {
        let mut state = self.lock();
        state.connect_attempts += 1;
        if let Some(reason) = &state.refuse_connections {
            debug!(%reason, "MemoryBroker::connect: refused");
            return Err(BrokerError::Connect(reason.clone()));
        }

        state.next_connection_id += 1;
        let id = state.next_connection_id;
        state.connections.insert(id, events);
        debug!(connection_id = id, "MemoryBroker::connect: opened");

        Ok(Box::new(MemoryConnection {
            broker: self.clone(),
            id,
        }))
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Box<dyn BrokerChannel>, BrokerError> {
        if !self.broker.lock().connections.contains_key(&self.id) {
            return Err(BrokerError::ChannelClosed);
        }
        Ok(Box::new(MemoryChannel {
            broker: self.broker.clone(),
            connection_id: self.id,
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        // Client-initiated close: no Closed event, the client already knows
        self.broker.lock().disconnect(self.id);
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        let mut state = self.broker.lock();
        if state.connections.contains_key(&self.id) {
            debug!(connection_id = self.id, "MemoryConnection dropped while open");
            state.abandoned += 1;
        }
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    connection_id: u64,
}

impl MemoryChannel {
    fn open_state(&self) -> Result<MutexGuard<'_, BrokerState>, BrokerError> {
        let state = self.broker.lock();
        if state.connections.contains_key(&self.connection_id) {
            Ok(state)
        } else {
            Err(BrokerError::ChannelClosed)
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_durable_queue(&self, name: &str) -> Result<(), BrokerError> {
        let mut state = self.open_state()?;
        state
            .queues
            .entry(name.to_string())
            .or_insert_with(|| MemoryQueue::new(None));
        Ok(())
    }

    async fn declare_reply_queue(&self) -> Result<String, BrokerError> {
        let mut state = self.open_state()?;
        let name = format!("amq.gen-{}", Uuid::new_v4().simple());
        state
            .queues
            .insert(name.clone(), MemoryQueue::new(Some(self.connection_id)));
        Ok(name)
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream, BrokerError> {
        let mut state = self.open_state()?;
        let target = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::Channel(format!("no queue '{}'", queue)))?;
        let rx = target
            .rx
            .take()
            .ok_or_else(|| BrokerError::Channel(format!("queue '{}' already has a consumer", queue)))?;

        let stream = futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|d| (Ok(d), rx)) });
        Ok(stream.boxed())
    }

    async fn publish(&self, queue: &str, message: OutboundMessage) -> Result<(), BrokerError> {
        let mut state = self.open_state()?;
        if let Some(reason) = &state.reject_publishes {
            return Err(BrokerError::Channel(reason.clone()));
        }
        state.published += 1;
        state.enqueue(
            queue,
            message.correlation_id,
            message.reply_to,
            message.persistent,
            message.body,
        );
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        let mut state = self.open_state()?;
        state.acked.push(delivery_tag);
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.open_state().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open(broker: &MemoryBroker) -> (Box<dyn BrokerConnection>, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = broker.connect(tx).await.unwrap();
        (conn, rx)
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let broker = MemoryBroker::new();
        let mut work = broker.subscribe("work").unwrap();

        let (conn, _events) = open(&broker).await;
        let channel = conn.create_channel().await.unwrap();
        channel.declare_durable_queue("work").await.unwrap();
        channel
            .publish("work", OutboundMessage::json(b"{\"a\":1}".to_vec()).with_reply("c1", "r1"))
            .await
            .unwrap();

        let delivery = work.recv().await.unwrap();
        assert_eq!(delivery.correlation_id.as_deref(), Some("c1"));
        assert_eq!(delivery.reply_to.as_deref(), Some("r1"));
        assert!(delivery.persistent);
        assert_eq!(delivery.body, b"{\"a\":1}");
        assert_eq!(broker.published_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_queue_is_dropped() {
        let broker = MemoryBroker::new();
        let (conn, _events) = open(&broker).await;
        let channel = conn.create_channel().await.unwrap();

        channel
            .publish("nowhere", OutboundMessage::json(b"{}".to_vec()))
            .await
            .unwrap();
        assert_eq!(broker.unroutable_count(), 1);
        assert!(!broker.deliver("nowhere", None, b"{}"));
    }

    #[tokio::test]
    async fn test_reply_queue_consumer_and_ack() {
        let broker = MemoryBroker::new();
        let (conn, _events) = open(&broker).await;
        let channel = conn.create_channel().await.unwrap();

        let reply_queue = channel.declare_reply_queue().await.unwrap();
        assert!(reply_queue.starts_with("amq.gen-"));
        let mut stream = channel.consume(&reply_queue).await.unwrap();

        assert!(broker.deliver(&reply_queue, Some("c9"), b"{}"));
        let delivery = stream.next().await.unwrap().unwrap();
        assert_eq!(delivery.correlation_id.as_deref(), Some("c9"));

        channel.ack(delivery.delivery_tag).await.unwrap();
        assert_eq!(broker.acked_tags(), vec![delivery.delivery_tag]);
    }

    #[tokio::test]
    async fn test_second_consumer_rejected() {
        let broker = MemoryBroker::new();
        let (conn, _events) = open(&broker).await;
        let channel = conn.create_channel().await.unwrap();
        let reply_queue = channel.declare_reply_queue().await.unwrap();

        let _first = channel.consume(&reply_queue).await.unwrap();
        assert!(channel.consume(&reply_queue).await.is_err());
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let broker = MemoryBroker::new();
        broker.refuse_connections("ACCESS_REFUSED");

        let (tx, _rx) = mpsc::unbounded_channel();
        let result = broker.connect(tx).await;
        assert!(matches!(result, Err(BrokerError::Connect(reason)) if reason == "ACCESS_REFUSED"));
        assert_eq!(broker.connect_attempts(), 1);
        assert_eq!(broker.open_connections(), 0);

        broker.accept_connections();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(broker.connect(tx).await.is_ok());
    }

    #[tokio::test]
    async fn test_drop_connections_ends_reply_consumer() {
        let broker = MemoryBroker::new();
        let (conn, mut events) = open(&broker).await;
        let channel = conn.create_channel().await.unwrap();
        channel.declare_durable_queue("work").await.unwrap();
        let reply_queue = channel.declare_reply_queue().await.unwrap();
        let mut stream = channel.consume(&reply_queue).await.unwrap();

        broker.drop_connections();

        assert_eq!(events.recv().await, Some(ConnectionEvent::Closed));
        assert!(stream.next().await.is_none());
        assert!(!broker.queue_exists(&reply_queue));
        assert!(broker.queue_exists("work"));
        assert!(matches!(
            channel.publish("work", OutboundMessage::json(b"{}".to_vec())).await,
            Err(BrokerError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_client_close_removes_exclusive_queues() {
        let broker = MemoryBroker::new();
        let (conn, mut events) = open(&broker).await;
        let channel = conn.create_channel().await.unwrap();
        channel.declare_reply_queue().await.unwrap();
        assert_eq!(broker.exclusive_queues().len(), 1);

        conn.close().await.unwrap();
        assert!(broker.exclusive_queues().is_empty());
        assert_eq!(broker.open_connections(), 0);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dropped_handle_leaves_connection_open() {
        let broker = MemoryBroker::new();
        let (conn, _events) = open(&broker).await;
        let channel = conn.create_channel().await.unwrap();
        let reply_queue = channel.declare_reply_queue().await.unwrap();

        drop(channel);
        drop(conn);
        assert_eq!(broker.abandoned_connections(), 1);
        assert_eq!(broker.open_connections(), 1);
        assert!(broker.queue_exists(&reply_queue));

        // Closed or broker-dropped connections are not abandoned
        let (conn, _events) = open(&broker).await;
        conn.close().await.unwrap();
        drop(conn);
        let (conn, _events) = open(&broker).await;
        broker.drop_connections();
        drop(conn);
        assert_eq!(broker.abandoned_connections(), 1);
    }

    #[tokio::test]
    async fn test_rejected_publish() {
        let broker = MemoryBroker::new();
        broker.reject_publishes("PRECONDITION_FAILED");
        let (conn, _events) = open(&broker).await;
        let channel = conn.create_channel().await.unwrap();

        let result = channel.publish("work", OutboundMessage::json(b"{}".to_vec())).await;
        assert!(matches!(result, Err(BrokerError::Channel(_))));
        assert_eq!(broker.published_count(), 0);
    }
}

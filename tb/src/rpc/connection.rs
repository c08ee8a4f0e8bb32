//! Broker connection manager
//!
//! Owns the connection, channel and reply-queue name for the client. The
//! connection is opened lazily by [`ConnectionManager::ensure_connected`];
//! every successful connect gets a new generation so that events from an
//! older connection can be told apart from the current one.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::dispatcher;
use super::messages::{ClientRequest, ConnectionState};
use crate::broker::{BrokerChannel, BrokerConnection, BrokerError, ConnectionEvent, Connector, OutboundMessage};

/// Everything that exists only while connected
struct Live {
    generation: u64,
    connection: Box<dyn BrokerConnection>,
    channel: Box<dyn BrokerChannel>,
    reply_queue: String,
    consumer: JoinHandle<()>,
    listener: JoinHandle<()>,
}

impl Live {
    fn stop_tasks(&self) {
        self.consumer.abort();
        self.listener.abort();
    }
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    work_queue: String,
    connect_timeout: Duration,
    inbox: mpsc::WeakSender<ClientRequest>,
    state: ConnectionState,
    generation: u64,
    live: Option<Live>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        work_queue: impl Into<String>,
        connect_timeout: Duration,
        inbox: mpsc::WeakSender<ClientRequest>,
    ) -> Self {
        Self {
            connector,
            work_queue: work_queue.into(),
            connect_timeout,
            inbox,
            state: ConnectionState::Disconnected,
            generation: 0,
            live: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Generation of the current (or most recent) connection
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn reply_queue(&self) -> Option<&str> {
        self.live.as_ref().map(|live| live.reply_queue.as_str())
    }

    pub fn work_queue(&self) -> &str {
        &self.work_queue
    }

    /// Connect if not already connected
    ///
    /// Opens the connection and channel, declares the durable work queue and
    /// an exclusive reply queue, and starts the reply consumer. On failure the
    /// state is left `Disconnected` and nothing is kept.
    pub async fn ensure_connected(&mut self) -> Result<(), BrokerError> {
        if self.state == ConnectionState::Connected && self.live.is_some() {
            return Ok(());
        }

        let generation = self.generation + 1;
        self.state = ConnectionState::Connecting;
        info!(broker = %self.connector.describe(), generation, "Connecting to broker");

        match self.open(generation).await {
            Ok(live) => {
                info!(
                    generation,
                    queue = %self.work_queue,
                    reply_queue = %live.reply_queue,
                    "Connected to broker"
                );
                self.generation = generation;
                self.live = Some(live);
                self.state = ConnectionState::Connected;
                Ok(())
            }
            Err(e) => {
                error!(broker = %self.connector.describe(), error = %e, "Failed to connect to broker");
                self.state = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    /// Open and prepare a connection, all within the connect timeout
    ///
    /// A connection that was opened but could not be prepared in time is
    /// closed before the error is returned.
    async fn open(&self, generation: u64) -> Result<Live, BrokerError> {
        let deadline = Instant::now() + self.connect_timeout;
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let connection = tokio::time::timeout_at(deadline, self.connector.connect(event_tx))
            .await
            .map_err(|_| self.connect_timed_out())??;

        let setup = async {
            let channel = connection.create_channel().await?;
            channel.declare_durable_queue(&self.work_queue).await?;
            let reply_queue = channel.declare_reply_queue().await?;
            let deliveries = channel.consume(&reply_queue).await?;
            Ok::<_, BrokerError>((channel, reply_queue, deliveries))
        };
        let prepared = match tokio::time::timeout_at(deadline, setup).await {
            Ok(result) => result,
            Err(_) => Err(self.connect_timed_out()),
        };

        let (channel, reply_queue, deliveries) = match prepared {
            Ok(parts) => parts,
            Err(e) => {
                self.close_connection(generation, &*connection).await;
                return Err(e);
            }
        };

        let consumer = dispatcher::spawn_consumer(generation, deliveries, self.inbox.clone());
        let listener = spawn_listener(generation, event_rx, self.inbox.clone());

        Ok(Live {
            generation,
            connection,
            channel,
            reply_queue,
            consumer,
            listener,
        })
    }

    fn connect_timed_out(&self) -> BrokerError {
        BrokerError::Timeout(format!("connect did not complete within {:?}", self.connect_timeout))
    }

    /// Close a connection whose channel may already be gone, logging failures
    ///
    /// Bounded by the connect timeout.
    async fn close_connection(&self, generation: u64, connection: &dyn BrokerConnection) {
        match tokio::time::timeout(self.connect_timeout, connection.close()).await {
            Ok(Ok(())) => debug!(generation, "Broker connection closed"),
            Ok(Err(e)) => debug!(generation, error = %e, "Closing broker connection failed"),
            Err(_) => warn!(generation, timeout = ?self.connect_timeout, "Closing broker connection timed out"),
        }
    }

    /// Publish to the work queue; only valid while connected
    pub async fn publish(&self, message: OutboundMessage) -> Result<(), BrokerError> {
        match (&self.state, &self.live) {
            (ConnectionState::Connected, Some(live)) => live.channel.publish(&self.work_queue, message).await,
            _ => Err(BrokerError::ChannelClosed),
        }
    }

    /// Acknowledge a reply received on connection `generation`
    ///
    /// Delivery tags are channel-scoped, so a tag from an older connection is
    /// never acked on the current one.
    pub async fn ack(&self, generation: u64, delivery_tag: u64) -> Result<(), BrokerError> {
        match &self.live {
            Some(live) if live.generation == generation => live.channel.ack(delivery_tag).await,
            _ => Err(BrokerError::ChannelClosed),
        }
    }

    /// Drop the connection after its channel or consumer went away
    ///
    /// The connection itself is closed best-effort, since it can outlive its
    /// channel. Returns false when `generation` is not the live connection (a
    /// stale or repeated closure), in which case nothing changes.
    pub async fn teardown(&mut self, generation: u64) -> bool {
        let live = match self.live.take() {
            Some(live) if live.generation == generation => live,
            other => {
                self.live = other;
                return false;
            }
        };
        self.state = ConnectionState::Disconnected;
        live.stop_tasks();
        self.close_connection(generation, &*live.connection).await;
        true
    }

    /// Best-effort shutdown: close channel, then connection, logging failures
    pub async fn close(&mut self) {
        if let Some(live) = self.live.take() {
            debug!(generation = live.generation, "ConnectionManager::close: closing");
            live.stop_tasks();
            if let Err(e) = live.channel.close().await {
                error!(error = %e, "Failed to close broker channel");
            }
            if let Err(e) = live.connection.close().await {
                error!(error = %e, "Failed to close broker connection");
            }
            info!(generation = live.generation, "Broker connection closed");
        }
        self.state = ConnectionState::Disconnected;
    }
}

/// Forward connection events to the client task, tagged with their generation
fn spawn_listener(
    generation: u64,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    inbox: mpsc::WeakSender<ClientRequest>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(tx) = inbox.upgrade() else {
                return;
            };
            if tx.send(ClientRequest::Connection { generation, event }).await.is_err() {
                return;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;

    fn manager(broker: &MemoryBroker, inbox: &mpsc::Sender<ClientRequest>) -> ConnectionManager {
        ConnectionManager::new(
            Arc::new(broker.clone()),
            "debtor_tasks",
            Duration::from_secs(5),
            inbox.downgrade(),
        )
    }

    #[tokio::test]
    async fn test_ensure_connected_is_idempotent() {
        let broker = MemoryBroker::new();
        let (tx, _rx) = mpsc::channel(16);
        let mut mgr = manager(&broker, &tx);
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        assert!(mgr.reply_queue().is_none());

        mgr.ensure_connected().await.unwrap();
        let reply_queue = mgr.reply_queue().unwrap().to_string();
        assert_eq!(mgr.state(), ConnectionState::Connected);
        assert_eq!(mgr.generation(), 1);
        assert!(broker.queue_exists("debtor_tasks"));
        assert!(broker.queue_exists(&reply_queue));

        mgr.ensure_connected().await.unwrap();
        assert_eq!(broker.connect_attempts(), 1);
        assert_eq!(mgr.reply_queue(), Some(reply_queue.as_str()));
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_disconnected() {
        let broker = MemoryBroker::new();
        broker.refuse_connections("ACCESS_REFUSED");
        let (tx, _rx) = mpsc::channel(16);
        let mut mgr = manager(&broker, &tx);

        let err = mgr.ensure_connected().await.unwrap_err();
        assert!(matches!(err, BrokerError::Connect(_)));
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        assert_eq!(mgr.generation(), 0);
        assert!(mgr.reply_queue().is_none());
        assert!(matches!(
            mgr.publish(OutboundMessage::json(b"{}".to_vec())).await,
            Err(BrokerError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_teardown_ignores_stale_generation() {
        let broker = MemoryBroker::new();
        let (tx, _rx) = mpsc::channel(16);
        let mut mgr = manager(&broker, &tx);
        mgr.ensure_connected().await.unwrap();

        assert!(!mgr.teardown(0).await);
        assert_eq!(mgr.state(), ConnectionState::Connected);

        assert!(mgr.teardown(1).await);
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        assert!(mgr.reply_queue().is_none());
        assert_eq!(broker.open_connections(), 0);
        assert_eq!(broker.abandoned_connections(), 0);
        assert!(!mgr.teardown(1).await);

        mgr.ensure_connected().await.unwrap();
        assert_eq!(mgr.generation(), 2);
    }

    #[tokio::test]
    async fn test_broker_closure_reaches_inbox() {
        let broker = MemoryBroker::new();
        let (tx, mut rx) = mpsc::channel(16);
        let mut mgr = manager(&broker, &tx);
        mgr.ensure_connected().await.unwrap();

        broker.drop_connections();

        // Both the listener and the ended consumer report the closure
        for _ in 0..2 {
            match rx.recv().await.unwrap() {
                ClientRequest::Connection { generation, event } => {
                    assert_eq!(generation, 1);
                    assert_eq!(event, ConnectionEvent::Closed);
                }
                other => panic!("Expected Connection, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_close_is_best_effort_and_resets() {
        let broker = MemoryBroker::new();
        let (tx, _rx) = mpsc::channel(16);
        let mut mgr = manager(&broker, &tx);

        // Closing while disconnected is a no-op
        mgr.close().await;
        assert_eq!(mgr.state(), ConnectionState::Disconnected);

        mgr.ensure_connected().await.unwrap();
        broker.drop_connections();
        // Channel and connection are already gone; close still succeeds
        mgr.close().await;
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        assert!(mgr.reply_queue().is_none());
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_ack_rejects_other_generation() {
        let broker = MemoryBroker::new();
        let (tx, _rx) = mpsc::channel(16);
        let mut mgr = manager(&broker, &tx);
        mgr.ensure_connected().await.unwrap();

        assert!(mgr.ack(1, 7).await.is_ok());
        assert!(mgr.ack(2, 8).await.is_err());
        assert_eq!(broker.acked_tags(), vec![7]);
    }
}

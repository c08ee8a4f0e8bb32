//! Broker transport abstraction
//!
//! The RPC client never talks to a wire protocol directly. It goes through
//! three traits that mirror the AMQP object model:
//! - **[`Connector`]:** opens a connection and wires up its event listener
//! - **[`BrokerConnection`]:** a live connection that hands out channels
//! - **[`BrokerChannel`]:** queue declaration, publish, consume and ack
//!
//! [`AmqpConnector`] speaks AMQP 0-9-1 through lapin. [`MemoryBroker`] is an
//! in-process broker with the same queue semantics, used by tests and local runs.

mod amqp;
mod error;
pub mod memory;

pub use amqp::AmqpConnector;
pub use error::BrokerError;
pub use memory::MemoryBroker;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::mpsc;

/// Content type carried by every task and reply message
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Connection-level events surfaced by a broker connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The connection reported an error; it may or may not survive it
    Error(String),

    /// The connection is gone
    Closed,
}

/// Listener half handed to [`Connector::connect`]
pub type ConnectionEvents = mpsc::UnboundedSender<ConnectionEvent>;

/// Stream of deliveries from a consumer; ends when the channel goes away
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// A message published through the default exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub persistent: bool,
    pub content_type: String,
}

impl OutboundMessage {
    /// Persistent JSON message with no reply metadata
    pub fn json(body: Vec<u8>) -> Self {
        Self {
            body,
            correlation_id: None,
            reply_to: None,
            persistent: true,
            content_type: JSON_CONTENT_TYPE.to_string(),
        }
    }

    /// Attach request/reply metadata
    pub fn with_reply(mut self, correlation_id: impl Into<String>, reply_to: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self.reply_to = Some(reply_to.into());
        self
    }
}

/// A message delivered to a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Channel-scoped tag used for acknowledgment
    pub delivery_tag: u64,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub persistent: bool,
    pub body: Vec<u8>,
}

/// Opens connections to a broker
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection; connection errors and closure are reported on `events`
    async fn connect(&self, events: ConnectionEvents) -> Result<Box<dyn BrokerConnection>, BrokerError>;

    /// Human-readable broker address for logs (never includes the password)
    fn describe(&self) -> String;
}

/// A live broker connection
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Box<dyn BrokerChannel>, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// A channel on a broker connection
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare a durable, named queue (idempotent)
    async fn declare_durable_queue(&self, name: &str) -> Result<(), BrokerError>;

    /// Declare an exclusive queue with a broker-generated name and return that name
    async fn declare_reply_queue(&self) -> Result<String, BrokerError>;

    /// Start a manual-ack consumer on `queue`
    async fn consume(&self, queue: &str) -> Result<DeliveryStream, BrokerError>;

    /// Publish to `queue` through the default exchange
    async fn publish(&self, queue: &str, message: OutboundMessage) -> Result<(), BrokerError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbound_json_is_persistent() {
        let msg = OutboundMessage::json(b"{}".to_vec());
        assert!(msg.persistent);
        assert_eq!(msg.content_type, JSON_CONTENT_TYPE);
        assert!(msg.correlation_id.is_none());
        assert!(msg.reply_to.is_none());
    }

    #[test]
    fn test_outbound_with_reply() {
        let msg = OutboundMessage::json(b"{}".to_vec()).with_reply("corr-1", "amq.gen-abc");
        assert_eq!(msg.correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(msg.reply_to.as_deref(), Some("amq.gen-abc"));
    }
}

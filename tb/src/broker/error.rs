//! Broker transport errors

use thiserror::Error;

/// Errors raised by a broker connection or channel
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Connection refused: {0}")]
    Connect(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),
}

impl BrokerError {
    /// Check if this error means the channel or connection is no longer usable
    pub fn is_closed(&self) -> bool {
        match self {
            BrokerError::ChannelClosed => true,
            BrokerError::Amqp(lapin::Error::InvalidChannelState(_))
            | BrokerError::Amqp(lapin::Error::InvalidConnectionState(_)) => true,
            _ => false,
        }
    }
}

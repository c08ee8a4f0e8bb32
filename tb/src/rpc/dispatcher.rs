//! Reply dispatcher
//!
//! One consumer per connection reads the private reply queue and forwards
//! each delivery, in order, to the client task. The client task resolves the
//! delivery against the registry with [`dispatch`] and then acks it whatever
//! the outcome. Replies are single-use, so nothing is ever requeued.

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::error::RpcError;
use super::messages::ClientRequest;
use super::registry::CorrelationRegistry;
use crate::broker::{ConnectionEvent, Delivery, DeliveryStream};

/// What happened to a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Settled a pending call with the parsed body
    Resolved,
    /// Settled a pending call with a malformed-reply error
    Malformed,
    /// No pending call had this correlation id
    Orphan,
    /// The delivery carried no correlation id
    Uncorrelated,
}

/// Settle the pending call a reply belongs to, if there is one
pub fn dispatch(registry: &mut CorrelationRegistry, delivery: &Delivery) -> Disposition {
    let Some(correlation_id) = delivery.correlation_id.as_deref() else {
        debug!(delivery_tag = delivery.delivery_tag, "dispatch: reply without correlation id");
        return Disposition::Uncorrelated;
    };

    if !registry.contains(correlation_id) {
        debug!(%correlation_id, "dispatch: no pending call, discarding reply");
        return Disposition::Orphan;
    }

    match serde_json::from_slice::<Value>(&delivery.body) {
        Ok(value) => {
            registry.settle(correlation_id, Ok(value));
            Disposition::Resolved
        }
        Err(source) => {
            warn!(%correlation_id, error = %source, "Reply body is not valid JSON");
            registry.settle(
                correlation_id,
                Err(RpcError::MalformedReply {
                    correlation_id: correlation_id.to_string(),
                    source,
                }),
            );
            Disposition::Malformed
        }
    }
}

/// Spawn the consumer loop for one connection generation
///
/// Forwards deliveries to the client task; when the stream ends or fails it
/// reports the connection as closed. Exits quietly once the client is gone.
pub(crate) fn spawn_consumer(
    generation: u64,
    mut deliveries: DeliveryStream,
    inbox: mpsc::WeakSender<ClientRequest>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!(generation, "Reply consumer started");
        loop {
            let next = deliveries.next().await;
            let Some(tx) = inbox.upgrade() else {
                debug!(generation, "Client gone, reply consumer exiting");
                return;
            };

            match next {
                Some(Ok(delivery)) => {
                    if tx.send(ClientRequest::Reply { generation, delivery }).await.is_err() {
                        return;
                    }
                }
                Some(Err(e)) => {
                    warn!(generation, error = %e, "Reply consumer failed");
                    let _ = tx
                        .send(ClientRequest::Connection {
                            generation,
                            event: ConnectionEvent::Closed,
                        })
                        .await;
                    return;
                }
                None => {
                    debug!(generation, "Reply consumer stream ended");
                    let _ = tx
                        .send(ClientRequest::Connection {
                            generation,
                            event: ConnectionEvent::Closed,
                        })
                        .await;
                    return;
                }
            }
        }
    })
}

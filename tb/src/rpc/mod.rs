//! Request/reply client over a message broker
//!
//! A single client task owns the broker connection and the table of pending
//! calls. Callers hold an [`RpcHandle`] and use two primitives:
//! - **call:** publish a task with a reply address and wait for the correlated reply
//! - **send:** publish a task and return once the broker has it
//!
//! Replies come back on a private, exclusive queue created per connection and
//! are matched to their call by correlation id. Each call carries its own
//! timeout; a connection loss does not fail calls in flight, they time out.

mod config;
mod connection;
mod core;
mod dispatcher;
mod error;
mod handle;
mod messages;
mod registry;

pub use config::ClientConfig;
pub use connection::ConnectionManager;
pub use core::RpcClient;
pub use dispatcher::{Disposition, dispatch};
pub use error::RpcError;
pub use handle::{PendingReply, RpcHandle};
pub use messages::{CallOutcome, ClientMetrics, ClientRequest, ConnectionState, TaskMessage};
pub use registry::{CorrelationRegistry, PendingCall};

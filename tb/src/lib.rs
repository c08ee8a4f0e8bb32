//! TaskBroker - request/reply task client over a message broker
//!
//! TaskBroker offloads long-running work (debtor-registry processing, email
//! dispatch) to an external worker through an AMQP 0-9-1 broker and brings the
//! worker's answer back to the caller.
//!
//! # Core Concepts
//!
//! - **One Client Task**: A single tokio task owns the connection and every pending call
//! - **Correlated Replies**: Each call gets a fresh id; replies arrive out of order on a private queue
//! - **Per-call Timeouts**: A call that hears nothing fails with a timeout; late replies are dropped
//! - **Lazy Connection**: Connects on first use and again after the broker drops it
//!
//! # Modules
//!
//! - [`broker`] - Transport traits, AMQP (lapin) and in-memory implementations
//! - [`rpc`] - Client task, handle, correlation registry and reply dispatch
//! - [`tasks`] - Debtor-registry and email tasks with status mapping
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod broker;
pub mod cli;
pub mod config;
pub mod rpc;
pub mod tasks;

// Re-export commonly used types
pub use broker::{AmqpConnector, BrokerError, Connector, MemoryBroker};
pub use config::{BrokerConfig, Config, TasksConfig};
pub use rpc::{ClientConfig, ClientMetrics, ConnectionState, PendingReply, RpcClient, RpcError, RpcHandle};
pub use tasks::{TaskError, TaskKind, TaskResponse, TaskService};

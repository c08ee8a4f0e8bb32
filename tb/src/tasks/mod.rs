//! Worker tasks exposed to the backend
//!
//! Wraps the RPC client with the two tasks the worker handles, their default
//! timeouts and the `success`/`error` reply convention, and maps outcomes to
//! HTTP-style status codes.

mod error;
mod service;

pub use error::TaskError;
pub use service::{TaskKind, TaskResponse, TaskService};

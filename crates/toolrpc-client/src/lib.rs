//! Resilient client for tool processes speaking JSON-RPC over stdio.
//!
//! Each [`RpcClient`] spawns one child process and correlates concurrent
//! requests with newline-delimited JSON-RPC 2.0 responses by id. A
//! [`ClientPool`] runs several of them behind a bounded-wait queue, and a
//! [`RetryCoordinator`] retries calls that failed at the process/pipe level.
//! Every call yields a [`ToolCallEnvelope`] with an explicit status.

pub mod client;
pub mod config;
pub mod envelope;
pub mod error;
pub mod jsonrpc;
pub mod pending;
pub mod pool;
pub mod reader;
pub mod retry;
pub mod stats;
pub mod transport;

pub use client::{
    ClientState, HealthReport, HealthStatus, ResourceInfo, RpcClient, ServerInfo, ToolInfo,
};
pub use config::{PoolConfig, RetrySettings, ServerConfig};
pub use envelope::{CallStatus, ToolCallEnvelope};
pub use error::{ErrorKind, ToolRpcError};
pub use pool::ClientPool;
pub use retry::{RetryCoordinator, RetryPolicy, ToolExecutor};
pub use stats::PoolStats;

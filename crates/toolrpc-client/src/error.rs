//! Error types for tool-process communication.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from a tool process, its client session, or the pool in front of it.
#[derive(Debug, Error)]
pub enum ToolRpcError {
    #[error("Failed to spawn tool process '{command}': {source}")]
    SpawnFailed {
        command: String,
        source: std::io::Error,
    },

    #[error("Tool process '{command}' exited on startup: {stderr}")]
    ExitedOnStartup { command: String, stderr: String },

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Request '{method}' timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Tool error (code {code}): {message}")]
    JsonRpc { code: i64, message: String },

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Client is not connected")]
    NotConnected,

    #[error("No pooled client became available within {timeout_ms}ms")]
    PoolTimeout { timeout_ms: u64 },

    #[error("Client pool is shut down")]
    PoolClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Coarse classification of a [`ToolRpcError`], carried in result envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The process could not be started.
    Spawn,
    /// The process started but `initialize` did not complete.
    Handshake,
    /// No response arrived within the request window.
    Timeout,
    /// Malformed message from the process.
    Protocol,
    /// Well-formed JSON-RPC error returned by the tool.
    ToolExecution,
    /// The process or its pipes went away.
    ConnectionLost,
    /// The client had no live session.
    NotConnected,
    /// No pool slot was free within the acquire window.
    PoolExhausted,
    /// The pool was shut down.
    PoolClosed,
}

impl ErrorKind {
    /// Returns `true` for process/pipe-level failures, where the tool call
    /// never reached a live process and another attempt is safe.
    ///
    /// Request timeouts are excluded: the tool may have run anyway.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Spawn
                | ErrorKind::Handshake
                | ErrorKind::ConnectionLost
                | ErrorKind::NotConnected
        )
    }
}

impl ToolRpcError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ToolRpcError::SpawnFailed { .. } | ToolRpcError::ExitedOnStartup { .. } => {
                ErrorKind::Spawn
            }
            ToolRpcError::Handshake(_) => ErrorKind::Handshake,
            ToolRpcError::Timeout { .. } => ErrorKind::Timeout,
            ToolRpcError::Protocol(_) | ToolRpcError::Json(_) => ErrorKind::Protocol,
            ToolRpcError::JsonRpc { .. } => ErrorKind::ToolExecution,
            ToolRpcError::ConnectionLost(_) | ToolRpcError::Io(_) => ErrorKind::ConnectionLost,
            ToolRpcError::NotConnected => ErrorKind::NotConnected,
            ToolRpcError::PoolTimeout { .. } => ErrorKind::PoolExhausted,
            ToolRpcError::PoolClosed => ErrorKind::PoolClosed,
        }
    }
}

//! Background task draining a tool process's stdout.
//!
//! Decodes each line as JSON-RPC and resolves the matching pending request.
//! Undecodable or unmatched lines are logged and skipped; EOF, a read
//! error, or the process exiting ends the task and fails everything still
//! pending.

use crate::error::ToolRpcError;
use crate::jsonrpc::JsonRpcResponse;
use crate::pending::{Outcome, PendingTable};
use crate::transport::{ReadEvent, TransportReader};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;

/// After the process exits, how long to keep reading lines it already
/// wrote. A grandchild holding stdout open would otherwise stall the drain.
const EXIT_DRAIN: Duration = Duration::from_millis(200);

/// Response reader for one connected client.
pub struct ResponseReader {
    label: String,
    reader: TransportReader,
    pending: Arc<PendingTable>,
    alive: Arc<AtomicBool>,
}

impl ResponseReader {
    pub fn new(
        label: impl Into<String>,
        reader: TransportReader,
        pending: Arc<PendingTable>,
        alive: Arc<AtomicBool>,
    ) -> Self {
        Self {
            label: label.into(),
            reader,
            pending,
            alive,
        }
    }

    /// Run the loop on its own task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let reason = loop {
            match self.reader.next_event().await {
                ReadEvent::Line(Ok(Some(line))) => self.dispatch(&line).await,
                ReadEvent::Line(Ok(None)) => break "tool process closed its stdout".to_string(),
                ReadEvent::Line(Err(e)) => break format!("read from tool process failed: {e}"),
                ReadEvent::Exited(status) => {
                    self.drain().await;
                    break match status {
                        Some(status) => format!("tool process exited with {status}"),
                        None => "tool process exited".to_string(),
                    };
                }
            }
        };

        // Flip the flag first so callers registering from now on fail fast
        self.alive.store(false, Ordering::SeqCst);
        let rejected = self
            .pending
            .reject_all(|| ToolRpcError::ConnectionLost(reason.clone()))
            .await;
        tracing::warn!(
            "[{}] Connection lost ({}); rejected {} pending request(s)",
            self.label,
            reason,
            rejected
        );
    }

    /// Dispatch lines the exited process left in the pipe.
    async fn drain(&mut self) {
        while let Ok(Ok(Some(line))) =
            tokio::time::timeout(EXIT_DRAIN, self.reader.read_line()).await
        {
            self.dispatch(&line).await;
        }
    }

    async fn dispatch(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        let value: serde_json::Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("[{}] Skipping undecodable message: {e}: {line}", self.label);
                return;
            }
        };
        let raw_id = value.get("id").and_then(serde_json::Value::as_u64);
        let is_server_request = value.get("method").is_some();

        let message: JsonRpcResponse = match serde_json::from_value(value) {
            Ok(m) => m,
            Err(e) if is_server_request => {
                tracing::debug!("[{}] Ignoring malformed server message: {e}", self.label);
                return;
            }
            Err(e) => {
                // Fail the waiting caller now rather than at its timeout
                match raw_id {
                    Some(id) => {
                        let err = ToolRpcError::Protocol(format!("malformed response: {e}"));
                        if !self.pending.resolve(id, Err(err)).await {
                            tracing::warn!(
                                "[{}] Dropping malformed response for unknown request {}",
                                self.label,
                                id
                            );
                        }
                    }
                    None => {
                        tracing::warn!("[{}] Skipping malformed message: {e}: {line}", self.label)
                    }
                }
                return;
            }
        };

        if let Some(method) = &message.method {
            tracing::debug!("[{}] Ignoring server-initiated '{}'", self.label, method);
            return;
        }

        let Some(id) = message.request_id() else {
            tracing::warn!("[{}] Skipping message without a usable id: {line}", self.label);
            return;
        };

        if !self.pending.resolve(id, outcome_of(message)).await {
            tracing::warn!(
                "[{}] Dropping response for unknown or expired request {}",
                self.label,
                id
            );
        }
    }
}

fn outcome_of(message: JsonRpcResponse) -> Outcome {
    match (message.result, message.error) {
        (_, Some(err)) => Err(ToolRpcError::JsonRpc {
            code: err.code,
            message: err.message,
        }),
        (Some(result), None) => Ok(result),
        // `"result": null` decodes to None; treat it as an empty result
        (None, None) => Ok(serde_json::Value::Null),
    }
}

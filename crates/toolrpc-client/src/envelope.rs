//! Uniform result envelope returned by every tool call.

use crate::error::{ErrorKind, ToolRpcError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Outcome of a tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Success,
    Error,
}

/// `{tool, result|error, status, latency_ms}` as seen by downstream callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallEnvelope {
    pub tool: String,
    pub status: CallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub latency_ms: u64,
    /// Number of attempts made; set by the retry coordinator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
}

impl ToolCallEnvelope {
    pub fn success(tool: impl Into<String>, result: serde_json::Value, latency: Duration) -> Self {
        Self {
            tool: tool.into(),
            status: CallStatus::Success,
            result: Some(result),
            error: None,
            error_kind: None,
            latency_ms: latency.as_millis() as u64,
            attempts: None,
        }
    }

    pub fn failure(tool: impl Into<String>, error: &ToolRpcError, latency: Duration) -> Self {
        Self {
            tool: tool.into(),
            status: CallStatus::Error,
            result: None,
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
            latency_ms: latency.as_millis() as u64,
            attempts: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == CallStatus::Success
    }

    /// Whether this envelope reports a connection-class failure.
    pub fn is_retryable(&self) -> bool {
        self.error_kind.is_some_and(ErrorKind::is_retryable)
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }
}

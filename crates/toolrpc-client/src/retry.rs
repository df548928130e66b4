//! Retry with linear backoff around pooled tool calls.
//!
//! Only connection-class failures are retried. Tool errors and request
//! timeouts come back on the first attempt, since the tool may already
//! have run.

use crate::config::RetrySettings;
use crate::envelope::ToolCallEnvelope;
use rand::Rng;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Anything that can run one tool call and report it as an envelope.
pub trait ToolExecutor: Send + Sync {
    fn execute_tool<'a>(
        &'a self,
        name: &'a str,
        arguments: serde_json::Value,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = ToolCallEnvelope> + Send + 'a>>;
}

/// When and how long to wait between attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_retries: u32,
    /// Attempt `n` is followed by a wait of `base_delay * n`.
    pub base_delay: Duration,
    /// Cap on any single wait.
    pub max_delay: Duration,
    /// Apply ±25% jitter to each wait.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            jitter: settings.jitter,
        }
    }
}

impl RetryPolicy {
    /// Whether a failed call may be tried again.
    pub fn should_retry(&self, envelope: &ToolCallEnvelope) -> bool {
        !envelope.is_success() && envelope.is_retryable()
    }

    /// Wait after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let linear = self.base_delay.saturating_mul(attempt).min(self.max_delay);
        if !self.jitter {
            return linear;
        }
        let jitter_factor = rand::rng().random_range(0.75..=1.25);
        linear.mul_f64(jitter_factor).min(self.max_delay)
    }
}

/// Applies a [`RetryPolicy`] around an executor, usually a `ClientPool`.
pub struct RetryCoordinator<E> {
    executor: Arc<E>,
    policy: RetryPolicy,
    acquire_timeout: Duration,
}

impl<E: ToolExecutor> RetryCoordinator<E> {
    pub fn new(executor: Arc<E>, policy: RetryPolicy, acquire_timeout: Duration) -> Self {
        Self {
            executor,
            policy,
            acquire_timeout,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// [`execute_with_retry`](Self::execute_with_retry) with the policy's attempt limit.
    pub async fn execute(&self, name: &str, arguments: serde_json::Value) -> ToolCallEnvelope {
        self.execute_with_retry(name, arguments, self.policy.max_retries)
            .await
    }

    /// Call `name`, retrying connection-class failures up to `max_retries`
    /// attempts in total. The returned envelope always carries `attempts`.
    pub async fn execute_with_retry(
        &self,
        name: &str,
        arguments: serde_json::Value,
        max_retries: u32,
    ) -> ToolCallEnvelope {
        let max_attempts = max_retries.max(1);
        let mut attempt = 1;
        loop {
            let envelope = self
                .executor
                .execute_tool(name, arguments.clone(), self.acquire_timeout)
                .await;

            if !self.policy.should_retry(&envelope) {
                return envelope.with_attempts(attempt);
            }

            if attempt >= max_attempts {
                tracing::warn!(
                    "Tool '{}' still failing after {} attempt(s): {}",
                    name,
                    attempt,
                    envelope.error.as_deref().unwrap_or("unknown error")
                );
                return envelope.with_attempts(attempt);
            }

            let delay = self.policy.delay_for(attempt);
            tracing::warn!(
                "Tool '{}' hit a connection error (attempt {}/{}), retrying in {}ms: {}",
                name,
                attempt,
                max_attempts,
                delay.as_millis(),
                envelope.error.as_deref().unwrap_or("unknown error")
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, ToolRpcError};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Replays scripted envelopes; repeats the last one when exhausted.
    struct ScriptedExecutor {
        script: Mutex<VecDeque<ToolCallEnvelope>>,
        calls: AtomicU32,
    }

    impl ScriptedExecutor {
        fn new(script: Vec<ToolCallEnvelope>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicU32::new(0),
            })
        }
    }

    impl ToolExecutor for ScriptedExecutor {
        fn execute_tool<'a>(
            &'a self,
            _name: &'a str,
            _arguments: serde_json::Value,
            _timeout: Duration,
        ) -> Pin<Box<dyn Future<Output = ToolCallEnvelope> + Send + 'a>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().unwrap();
            let next = if script.len() > 1 {
                script.pop_front().unwrap()
            } else {
                script.front().cloned().unwrap()
            };
            Box::pin(async move { next })
        }
    }

    fn ok() -> ToolCallEnvelope {
        ToolCallEnvelope::success("echo", serde_json::json!({"x": 1}), Duration::ZERO)
    }

    fn err(error: ToolRpcError) -> ToolCallEnvelope {
        ToolCallEnvelope::failure("echo", &error, Duration::ZERO)
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            jitter: false,
        }
    }

    fn coordinator(executor: &Arc<ScriptedExecutor>) -> RetryCoordinator<ScriptedExecutor> {
        RetryCoordinator::new(Arc::clone(executor), fast_policy(), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn succeeds_after_two_connection_failures() {
        let executor = ScriptedExecutor::new(vec![
            err(ToolRpcError::ConnectionLost("pipe closed".into())),
            err(ToolRpcError::NotConnected),
            ok(),
        ]);
        let env = coordinator(&executor)
            .execute_with_retry("echo", serde_json::json!({"x": 1}), 3)
            .await;
        assert!(env.is_success());
        assert_eq!(env.attempts, Some(3));
        assert_eq!(env.result, Some(serde_json::json!({"x": 1})));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn tool_errors_are_returned_immediately() {
        let executor = ScriptedExecutor::new(vec![
            err(ToolRpcError::JsonRpc {
                code: -32000,
                message: "connection to database refused".into(),
            }),
            ok(),
        ]);
        let env = coordinator(&executor)
            .execute_with_retry("echo", serde_json::json!({}), 3)
            .await;
        assert_eq!(env.error_kind, Some(ErrorKind::ToolExecution));
        assert_eq!(env.attempts, Some(1));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn request_timeouts_are_not_retried() {
        let executor = ScriptedExecutor::new(vec![
            err(ToolRpcError::Timeout {
                method: "tools/call".into(),
                timeout_ms: 10,
            }),
            ok(),
        ]);
        let env = coordinator(&executor).execute("echo", serde_json::json!({})).await;
        assert_eq!(env.error_kind, Some(ErrorKind::Timeout));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let executor = ScriptedExecutor::new(vec![err(ToolRpcError::NotConnected)]);
        let env = coordinator(&executor)
            .execute_with_retry("echo", serde_json::json!({}), 2)
            .await;
        assert!(!env.is_success());
        assert_eq!(env.attempts, Some(2));
        assert_eq!(env.error_kind, Some(ErrorKind::NotConnected));
        assert!(env.error.is_some());
        assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn zero_retries_still_attempts_once() {
        let executor = ScriptedExecutor::new(vec![ok()]);
        let env = coordinator(&executor)
            .execute_with_retry("echo", serde_json::json!({}), 0)
            .await;
        assert_eq!(env.attempts, Some(1));
    }

    #[test]
    fn delay_is_linear_and_capped() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
            jitter: false,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(250));
    }

    #[test]
    fn jittered_delay_stays_in_range() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(60),
            jitter: true,
        };
        for _ in 0..20 {
            let delay = policy.delay_for(2).as_millis();
            assert!((1500..=2500).contains(&delay), "delay={delay}");
        }
    }

    #[test]
    fn policy_from_settings() {
        let settings = RetrySettings {
            max_retries: 5,
            base_delay_ms: 200,
            max_delay_ms: 1000,
            jitter: true,
        };
        let policy = RetryPolicy::from(&settings);
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.base_delay, Duration::from_millis(200));
        assert!(policy.jitter);
    }
}

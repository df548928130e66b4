//! Configuration types for tool processes, the client pool, and retries.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

fn default_client_name() -> String {
    "toolrpc".to_string()
}

fn default_request_timeout() -> u64 {
    30_000
}

fn default_handshake_timeout() -> u64 {
    10_000
}

fn default_connect_attempts() -> u32 {
    3
}

fn default_connect_retry_delay() -> u64 {
    1000
}

fn default_shutdown_grace() -> u64 {
    5000
}

/// How to launch and talk to one tool process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Executable to run.
    pub command: String,
    /// Arguments to pass to the command.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables to set for the process.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Name reported in `clientInfo` during the handshake.
    #[serde(default = "default_client_name")]
    pub client_name: String,
    /// Per-request timeout in milliseconds (default: 30000).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    /// Timeout for the `initialize` handshake in milliseconds (default: 10000).
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
    /// Connect attempts per client before giving up (default: 3).
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    /// Base delay between connect attempts; grows linearly per attempt.
    #[serde(default = "default_connect_retry_delay")]
    pub connect_retry_delay_ms: u64,
    /// Time a process gets to exit after stdin closes before it is killed.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
}

impl ServerConfig {
    /// Config for `command` with all other fields at their defaults.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            client_name: default_client_name(),
            request_timeout_ms: default_request_timeout(),
            handshake_timeout_ms: default_handshake_timeout(),
            connect_attempts: default_connect_attempts(),
            connect_retry_delay_ms: default_connect_retry_delay(),
            shutdown_grace_ms: default_shutdown_grace(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

fn default_pool_size() -> usize {
    3
}

fn default_acquire_timeout() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

/// Client pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Target number of tool processes (default: 3).
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Default wait for a free client in milliseconds (default: 5000).
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_ms: u64,
    /// Reconnect a client whose process died when it is next checked out.
    #[serde(default = "default_true")]
    pub reconnect_on_acquire: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            acquire_timeout_ms: default_acquire_timeout(),
            reconnect_on_acquire: true,
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    1000
}

fn default_max_delay() -> u64 {
    30_000
}

/// Retry settings for connection-class failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Maximum number of attempts, including the first (default: 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay unit; attempt `n` waits `base_delay_ms * n` (default: 1000).
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    /// Upper bound on any single delay (default: 30000).
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    /// Apply ±25% jitter to each delay.
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            jitter: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_server() {
        let toml_str = r#"command = "python3""#;
        let config: ServerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.command, "python3");
        assert!(config.args.is_empty());
        assert_eq!(config.request_timeout_ms, 30_000);
        assert_eq!(config.handshake_timeout_ms, 10_000);
        assert_eq!(config.connect_attempts, 3);
        assert_eq!(config.shutdown_grace_ms, 5000);
        assert_eq!(config.client_name, "toolrpc");
    }

    #[test]
    fn parse_full_server() {
        let toml_str = r#"
command = "node"
args = ["server.js", "--stdio"]
env = { API_TOKEN = "xyz" }
request_timeout_ms = 60000
connect_attempts = 5
"#;
        let config: ServerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.args, vec!["server.js", "--stdio"]);
        assert_eq!(config.env["API_TOKEN"], "xyz");
        assert_eq!(config.request_timeout(), Duration::from_secs(60));
        assert_eq!(config.connect_attempts, 5);
    }

    #[test]
    fn new_matches_serde_defaults() {
        let built = ServerConfig::new("cat");
        let parsed: ServerConfig = toml::from_str(r#"command = "cat""#).unwrap();
        assert_eq!(built.request_timeout_ms, parsed.request_timeout_ms);
        assert_eq!(built.connect_retry_delay_ms, parsed.connect_retry_delay_ms);
        assert_eq!(built.client_name, parsed.client_name);
    }

    #[test]
    fn pool_defaults() {
        let config: PoolConfig = toml::from_str("").unwrap();
        assert_eq!(config.pool_size, 3);
        assert_eq!(config.acquire_timeout(), Duration::from_secs(5));
        assert!(config.reconnect_on_acquire);
    }

    #[test]
    fn retry_defaults() {
        let config = RetrySettings::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.base_delay_ms, 1000);
        assert!(!config.jitter);
    }
}

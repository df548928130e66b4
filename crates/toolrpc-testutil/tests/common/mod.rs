//! Shared helpers for end-to-end tests against `mock-tool-server`.

#![allow(dead_code)]

use std::sync::Arc;
use toolrpc_client::{PoolConfig, RpcClient, ServerConfig};

/// Config launching the mock server with `flags`.
pub fn mock_server(flags: &[&str]) -> ServerConfig {
    let mut config =
        ServerConfig::new(env!("CARGO_BIN_EXE_mock-tool-server")).with_args(flags.iter().copied());
    config.request_timeout_ms = 5000;
    config.handshake_timeout_ms = 2000;
    config.connect_attempts = 1;
    config.connect_retry_delay_ms = 10;
    config.shutdown_grace_ms = 1000;
    config
}

/// Config running `prelude` in a shell that then execs the mock server.
pub fn wrapped_mock_server(prelude: &str, flags: &[&str]) -> ServerConfig {
    let script = format!(
        "{prelude} exec '{}' {}",
        env!("CARGO_BIN_EXE_mock-tool-server"),
        flags.join(" ")
    );
    let mut config = mock_server(&[]);
    config.command = "sh".to_string();
    config.args = vec!["-c".to_string(), script];
    config
}

pub fn pool_config(pool_size: usize) -> PoolConfig {
    PoolConfig {
        pool_size,
        acquire_timeout_ms: 2000,
        reconnect_on_acquire: true,
    }
}

/// A connected client for the mock server.
pub async fn connected_client(config: ServerConfig) -> Arc<RpcClient> {
    let client = Arc::new(RpcClient::new("test", Arc::new(config)));
    assert!(client.connect(1).await, "mock server failed to connect");
    client
}

/// Whether a process with `pid` still exists.
pub fn process_exists(pid: u64) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

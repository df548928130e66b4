//! RPC client: one session with one tool process.
//!
//! Handles the handshake (initialize + initialized notification), tool and
//! resource discovery, request correlation, and tool invocation. Every call
//! made through [`RpcClient::call_tool`] comes back as a [`ToolCallEnvelope`].

use crate::config::ServerConfig;
use crate::envelope::ToolCallEnvelope;
use crate::error::ToolRpcError;
use crate::jsonrpc::{JsonRpcNotification, JsonRpcRequest};
use crate::pending::PendingTable;
use crate::reader::ResponseReader;
use crate::transport::ProcessTransport;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// Protocol version sent in the handshake.
const PROTOCOL_VERSION: &str = "2024-11-05";

/// How long a failed handshake waits to learn whether the process died.
const STARTUP_EXIT_PROBE: Duration = Duration::from_millis(100);

/// Upper bound on `tools/list` / `resources/list` pages followed per discovery.
const MAX_LIST_PAGES: usize = 64;

/// Whether a client has a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientState {
    Unconnected,
    Connected,
}

/// `serverInfo` reported by the tool process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// A tool exposed by the process.
#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// A resource exposed by the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub uri: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// Result of a liveness probe against one client.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub client: String,
    pub status: HealthStatus,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Deserialization helpers for protocol messages.
#[derive(Deserialize)]
struct InitializeResult {
    #[serde(rename = "serverInfo")]
    server_info: ServerInfo,
    #[serde(default, rename = "protocolVersion")]
    protocol_version: Option<String>,
}

#[derive(Deserialize)]
struct ToolsListResult {
    tools: Vec<ToolEntry>,
    #[serde(default, rename = "nextCursor")]
    next_cursor: Option<String>,
}

#[derive(Deserialize)]
struct ToolEntry {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default = "default_schema", rename = "inputSchema")]
    input_schema: serde_json::Value,
}

fn default_schema() -> serde_json::Value {
    serde_json::json!({"type": "object", "properties": {}})
}

#[derive(Deserialize)]
struct ResourcesListResult {
    resources: Vec<ResourceInfo>,
    #[serde(default, rename = "nextCursor")]
    next_cursor: Option<String>,
}

/// Pipes, reader task, and correlation table of one spawned process.
struct Connection {
    transport: ProcessTransport,
    pending: Arc<PendingTable>,
    alive: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Connection {
    fn is_live(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
            && self.transport.is_alive()
            && !self.reader.is_finished()
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let rejected = self
            .pending
            .reject_all(|| ToolRpcError::ConnectionLost("client disconnected".to_string()))
            .await;
        if rejected > 0 {
            tracing::debug!("Rejected {} pending request(s) on disconnect", rejected);
        }
        self.transport.terminate().await;
        self.reader.abort();
    }
}

/// A connected session and the discovery results cached at connect time.
struct Session {
    conn: Arc<Connection>,
    server_info: ServerInfo,
    tools: Vec<ToolInfo>,
    resources: Vec<ResourceInfo>,
}

/// Client for a single tool process.
///
/// Safe to share: concurrent calls on one client are correlated by id.
pub struct RpcClient {
    label: String,
    config: Arc<ServerConfig>,
    next_id: AtomicU64,
    session: RwLock<Option<Session>>,
}

impl RpcClient {
    /// Create an unconnected client. `label` tags its log lines.
    pub fn new(label: impl Into<String>, config: Arc<ServerConfig>) -> Self {
        Self {
            label: label.into(),
            config,
            next_id: AtomicU64::new(1),
            session: RwLock::new(None),
        }
    }

    /// Spawn, handshake, and discover, retrying up to `max_attempts` times.
    ///
    /// Returns `false` once every attempt has failed. Any previous session
    /// is torn down first.
    pub async fn connect(&self, max_attempts: u32) -> bool {
        self.disconnect().await;

        let attempts = max_attempts.max(1);
        let delay = Duration::from_millis(self.config.connect_retry_delay_ms);
        for attempt in 1..=attempts {
            match self.open_session().await {
                Ok(session) => {
                    tracing::info!(
                        "[{}] Connected to '{}' {} ({} tools, {} resources)",
                        self.label,
                        session.server_info.name,
                        session.server_info.version,
                        session.tools.len(),
                        session.resources.len()
                    );
                    *self.session.write().await = Some(session);
                    return true;
                }
                Err(e) => {
                    tracing::warn!(
                        "[{}] Connect attempt {}/{} failed: {}",
                        self.label,
                        attempt,
                        attempts,
                        e
                    );
                    if attempt < attempts {
                        tokio::time::sleep(delay * attempt).await;
                    }
                }
            }
        }

        tracing::warn!(
            "[{}] Giving up on '{}' after {} attempt(s)",
            self.label,
            self.config.command,
            attempts
        );
        false
    }

    /// Terminate the process and fail all pending requests. Idempotent.
    pub async fn disconnect(&self) {
        let session = self.session.write().await.take();
        if let Some(session) = session {
            session.conn.close().await;
            tracing::info!("[{}] Disconnected", self.label);
        }
    }

    /// Call a tool and wrap the outcome in an envelope.
    ///
    /// Never fails: errors come back as `status: "error"` envelopes.
    pub async fn call_tool(&self, name: &str, arguments: serde_json::Value) -> ToolCallEnvelope {
        let start = Instant::now();
        let Some(conn) = self.live_connection().await else {
            return ToolCallEnvelope::failure(name, &ToolRpcError::NotConnected, start.elapsed());
        };

        let params = serde_json::json!({
            "name": name,
            "arguments": arguments,
        });
        let outcome = self
            .request_via(
                &conn,
                "tools/call",
                Some(params),
                self.config.request_timeout(),
            )
            .await;

        match outcome {
            Ok(result) => ToolCallEnvelope::success(name, result, start.elapsed()),
            Err(e) => {
                tracing::debug!("[{}] Tool '{}' failed: {}", self.label, name, e);
                ToolCallEnvelope::failure(name, &e, start.elapsed())
            }
        }
    }

    /// Send an arbitrary request on the current session and await its result.
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, ToolRpcError> {
        let conn = self
            .live_connection()
            .await
            .ok_or(ToolRpcError::NotConnected)?;
        self.request_via(&conn, method, params, self.config.request_timeout())
            .await
    }

    /// Read one resource by URI.
    pub async fn read_resource(&self, uri: &str) -> Result<serde_json::Value, ToolRpcError> {
        self.send_request("resources/read", Some(serde_json::json!({ "uri": uri })))
            .await
    }

    /// Probe the process with a `tools/list` round trip.
    ///
    /// The cached tool list is left untouched.
    pub async fn health_check(&self) -> HealthReport {
        let start = Instant::now();
        let outcome = match self.live_connection().await {
            Some(conn) => self.list_tools_page(&conn, None).await,
            None => Err(ToolRpcError::NotConnected),
        };

        match outcome {
            Ok(page) => HealthReport {
                client: self.label.clone(),
                status: HealthStatus::Healthy,
                latency_ms: start.elapsed().as_millis() as u64,
                tool_count: Some(page.tools.len()),
                error: None,
            },
            Err(e) => HealthReport {
                client: self.label.clone(),
                status: HealthStatus::Unhealthy,
                latency_ms: start.elapsed().as_millis() as u64,
                tool_count: None,
                error: Some(e.to_string()),
            },
        }
    }

    pub async fn state(&self) -> ClientState {
        if self.is_connected().await {
            ClientState::Connected
        } else {
            ClientState::Unconnected
        }
    }

    /// Connected and the process has not exited.
    pub async fn is_connected(&self) -> bool {
        self.live_connection().await.is_some()
    }

    /// Tools discovered at connect time.
    pub async fn tools(&self) -> Vec<ToolInfo> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|s| s.tools.clone())
            .unwrap_or_default()
    }

    /// Resources discovered at connect time.
    pub async fn resources(&self) -> Vec<ResourceInfo> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|s| s.resources.clone())
            .unwrap_or_default()
    }

    pub async fn server_info(&self) -> Option<ServerInfo> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|s| s.server_info.clone())
    }

    /// Number of requests awaiting a response on the current session.
    pub async fn pending_count(&self) -> usize {
        match self.current_connection().await {
            Some(conn) => conn.pending.len().await,
            None => 0,
        }
    }

    /// Whether request `id` is still awaiting a response.
    pub async fn is_pending(&self, id: u64) -> bool {
        match self.current_connection().await {
            Some(conn) => conn.pending.contains(id).await,
            None => false,
        }
    }

    /// Id the next request will use.
    pub fn peek_next_id(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    async fn current_connection(&self) -> Option<Arc<Connection>> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|s| Arc::clone(&s.conn))
    }

    async fn live_connection(&self) -> Option<Arc<Connection>> {
        self.current_connection().await.filter(|c| c.is_live())
    }

    /// Spawn a process and run the handshake on it.
    async fn open_session(&self) -> Result<Session, ToolRpcError> {
        let (transport, stdout) = ProcessTransport::spawn(&self.config)?;
        let pending = Arc::new(PendingTable::new());
        let alive = Arc::new(AtomicBool::new(true));
        let reader = ResponseReader::new(
            self.label.clone(),
            stdout,
            Arc::clone(&pending),
            Arc::clone(&alive),
        )
        .spawn();
        let conn = Arc::new(Connection {
            transport,
            pending,
            alive,
            reader,
        });

        match self.handshake(&conn).await {
            Ok(session) => Ok(session),
            Err(e) => {
                let exited = conn
                    .transport
                    .exited_within(STARTUP_EXIT_PROBE)
                    .await
                    .is_some();
                let stderr = conn.transport.stderr_tail();
                conn.close().await;
                if exited {
                    Err(ToolRpcError::ExitedOnStartup {
                        command: self.config.command.clone(),
                        stderr: if stderr.is_empty() { e.to_string() } else { stderr },
                    })
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn handshake(&self, conn: &Arc<Connection>) -> Result<Session, ToolRpcError> {
        let init_params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": self.config.client_name,
                "version": env!("CARGO_PKG_VERSION")
            }
        });

        let result = self
            .request_via(
                conn,
                "initialize",
                Some(init_params),
                self.config.handshake_timeout(),
            )
            .await
            .map_err(|e| ToolRpcError::Handshake(format!("initialize failed: {e}")))?;

        let init: InitializeResult = serde_json::from_value(result)
            .map_err(|e| ToolRpcError::Handshake(format!("malformed initialize result: {e}")))?;
        if let Some(version) = init
            .protocol_version
            .as_deref()
            .filter(|v| *v != PROTOCOL_VERSION)
        {
            tracing::debug!(
                "[{}] Server negotiated protocol {} (requested {})",
                self.label,
                version,
                PROTOCOL_VERSION
            );
        }

        let notification = JsonRpcNotification::new("notifications/initialized", None);
        conn.transport
            .write_line(&serde_json::to_string(&notification)?)
            .await?;

        let tools = self
            .discover_tools(conn)
            .await
            .map_err(|e| ToolRpcError::Handshake(format!("tools/list failed: {e}")))?;

        let resources = match self.discover_resources(conn).await {
            Ok(resources) => resources,
            Err(ToolRpcError::JsonRpc { code, message }) => {
                // Servers without resources answer with an error
                tracing::debug!(
                    "[{}] resources/list unsupported (code {}): {}",
                    self.label,
                    code,
                    message
                );
                Vec::new()
            }
            Err(e) => {
                return Err(ToolRpcError::Handshake(format!(
                    "resources/list failed: {e}"
                )));
            }
        };

        Ok(Session {
            conn: Arc::clone(conn),
            server_info: init.server_info,
            tools,
            resources,
        })
    }

    async fn discover_tools(&self, conn: &Arc<Connection>) -> Result<Vec<ToolInfo>, ToolRpcError> {
        let mut tools = Vec::new();
        let mut cursor = None;
        for _ in 0..MAX_LIST_PAGES {
            let page = self.list_tools_page(conn, cursor.take()).await?;
            tools.extend(page.tools.into_iter().map(|t| ToolInfo {
                name: t.name,
                description: t.description.unwrap_or_default(),
                input_schema: t.input_schema,
            }));
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(tools)
    }

    async fn list_tools_page(
        &self,
        conn: &Arc<Connection>,
        cursor: Option<String>,
    ) -> Result<ToolsListResult, ToolRpcError> {
        let params = cursor.map(|c| serde_json::json!({ "cursor": c }));
        let result = self
            .request_via(conn, "tools/list", params, self.config.request_timeout())
            .await?;
        serde_json::from_value(result)
            .map_err(|e| ToolRpcError::Protocol(format!("Failed to parse tools/list result: {e}")))
    }

    async fn discover_resources(
        &self,
        conn: &Arc<Connection>,
    ) -> Result<Vec<ResourceInfo>, ToolRpcError> {
        let mut resources = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.take().map(|c| serde_json::json!({ "cursor": c }));
            let result = self
                .request_via(conn, "resources/list", params, self.config.request_timeout())
                .await?;
            let page: ResourcesListResult = serde_json::from_value(result).map_err(|e| {
                ToolRpcError::Protocol(format!("Failed to parse resources/list result: {e}"))
            })?;
            resources.extend(page.resources);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(resources)
    }

    /// Issue one request on `conn` and wait for its correlated response.
    ///
    /// The pending entry for the request id is gone when this returns,
    /// whatever the outcome.
    async fn request_via(
        &self,
        conn: &Connection,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value, ToolRpcError> {
        if !conn.is_live() {
            return Err(ToolRpcError::ConnectionLost(
                "tool process is not running".to_string(),
            ));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest::new(id, method, params);
        let serialized = serde_json::to_string(&request)?;

        let rx = conn.pending.register(id, method, Some(timeout)).await;

        // The reader may have exited between the check above and registration
        if !conn.is_live() {
            conn.pending.remove(id).await;
            return Err(ToolRpcError::ConnectionLost(
                "tool process is not running".to_string(),
            ));
        }

        if let Err(e) = conn.transport.write_line(&serialized).await {
            conn.pending.remove(id).await;
            return Err(e);
        }
        tracing::debug!("[{}] -> {} #{}", self.label, method, id);

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ToolRpcError::ConnectionLost(
                "response channel dropped".to_string(),
            )),
            Err(_) => {
                conn.pending.remove(id).await;
                Err(ToolRpcError::Timeout {
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(command: &str, args: &[&str]) -> Arc<ServerConfig> {
        let mut config = ServerConfig::new(command).with_args(args.iter().copied());
        config.handshake_timeout_ms = 300;
        config.request_timeout_ms = 300;
        config.connect_retry_delay_ms = 10;
        config.shutdown_grace_ms = 200;
        Arc::new(config)
    }

    /// A shell server that answers the handshake by position: initialize is
    /// id 1, tools/list id 2, resources/list id 3 (which it rejects).
    const SCRIPTED_SERVER: &str = r#"
read _
echo '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","serverInfo":{"name":"scripted","version":"0.1"},"capabilities":{}}}'
read _
read _
echo '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"echo","description":"Echo input"},{"name":"noop"}]}}'
read _
echo '{"jsonrpc":"2.0","id":3,"error":{"code":-32601,"message":"Method not found"}}'
cat > /dev/null
"#;

    #[tokio::test]
    async fn call_tool_on_unconnected_client_fails_fast() {
        let client = RpcClient::new("t", config("cat", &[]));
        let env = client.call_tool("echo", serde_json::json!({})).await;
        assert!(!env.is_success());
        assert_eq!(env.error_kind, Some(crate::error::ErrorKind::NotConnected));
        assert!(env.is_retryable());
        assert_eq!(client.state().await, ClientState::Unconnected);
    }

    #[tokio::test]
    async fn disconnect_twice_is_harmless() {
        let client = RpcClient::new("t", config("cat", &[]));
        client.disconnect().await;
        client.disconnect().await;
        assert_eq!(client.state().await, ClientState::Unconnected);
    }

    #[tokio::test]
    async fn connect_to_missing_executable_returns_false() {
        let client = RpcClient::new("t", config("this_command_does_not_exist_xyz123", &[]));
        assert!(!client.connect(2).await);
        assert_eq!(client.state().await, ClientState::Unconnected);
    }

    #[tokio::test]
    async fn connect_to_silent_process_times_out() {
        // `cat` echoes our requests back; those carry a method and are ignored
        let client = RpcClient::new("t", config("cat", &[]));
        let start = Instant::now();
        assert!(!client.connect(1).await);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(client.pending_count().await, 0);
    }

    #[tokio::test]
    async fn connect_with_scripted_server() {
        let client = RpcClient::new("t", config("sh", &["-c", SCRIPTED_SERVER]));
        assert!(client.connect(1).await);
        assert_eq!(client.state().await, ClientState::Connected);

        let info = client.server_info().await.unwrap();
        assert_eq!(info.name, "scripted");
        assert_eq!(info.version, "0.1");

        let tools = client.tools().await;
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, "echo");
        assert_eq!(tools[1].description, "");
        assert_eq!(tools[1].input_schema["type"], "object");
        assert!(client.resources().await.is_empty());
        assert_eq!(client.peek_next_id(), 4);

        client.disconnect().await;
        client.disconnect().await;
        assert_eq!(client.state().await, ClientState::Unconnected);
    }

    #[tokio::test]
    async fn request_timeout_purges_pending_entry() {
        let client = RpcClient::new("t", config("sh", &["-c", SCRIPTED_SERVER]));
        assert!(client.connect(1).await);

        let id = client.peek_next_id();
        let env = client.call_tool("echo", serde_json::json!({"x": 1})).await;
        assert_eq!(env.error_kind, Some(crate::error::ErrorKind::Timeout));
        assert!(!env.is_retryable());
        assert!(!client.is_pending(id).await);
        assert_eq!(client.pending_count().await, 0);

        client.disconnect().await;
    }

    #[tokio::test]
    async fn health_check_reports_unhealthy_when_unconnected() {
        let client = RpcClient::new("worker-0", config("cat", &[]));
        let report = client.health_check().await;
        assert_eq!(report.client, "worker-0");
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert!(report.error.is_some());
    }

    #[test]
    fn deserialize_tool_entry() {
        let json = r#"{
            "name": "read_file",
            "description": "Read a file",
            "inputSchema": {
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"]
            }
        }"#;
        let entry: ToolEntry = serde_json::from_str(json).unwrap();
        assert_eq!(entry.name, "read_file");
        assert_eq!(entry.description.as_deref(), Some("Read a file"));
        assert_eq!(entry.input_schema["required"][0], "path");
    }

    #[test]
    fn deserialize_tools_list_with_cursor() {
        let json = r#"{"tools": [{"name": "a"}], "nextCursor": "page-2"}"#;
        let page: ToolsListResult = serde_json::from_str(json).unwrap();
        assert_eq!(page.tools.len(), 1);
        assert_eq!(page.next_cursor.as_deref(), Some("page-2"));
    }

    #[test]
    fn deserialize_initialize_result() {
        let json = r#"{"serverInfo": {"name": "srv"}, "capabilities": {"tools": {}}}"#;
        let init: InitializeResult = serde_json::from_str(json).unwrap();
        assert_eq!(init.server_info.name, "srv");
        assert_eq!(init.server_info.version, "");
        assert!(init.protocol_version.is_none());
    }

    #[test]
    fn initialize_result_requires_server_info() {
        let json = r#"{"capabilities": {}}"#;
        assert!(serde_json::from_str::<InitializeResult>(json).is_err());
    }

    #[test]
    fn deserialize_resource_info() {
        let json = r#"{"uri": "file:///a.txt", "name": "a", "mimeType": "text/plain"}"#;
        let res: ResourceInfo = serde_json::from_str(json).unwrap();
        assert_eq!(res.uri, "file:///a.txt");
        assert_eq!(res.mime_type.as_deref(), Some("text/plain"));
        assert!(res.description.is_none());
    }

    #[test]
    fn rpc_client_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RpcClient>();
    }
}

//! Client pool: N tool processes behind an availability queue.
//!
//! A client is either in the queue or checked out by exactly one caller.
//! Callers wait a bounded time for a free client and get a `PoolTimeout`
//! error when none frees up, instead of queueing forever.

use crate::client::{HealthReport, ResourceInfo, RpcClient, ToolInfo};
use crate::config::{PoolConfig, ServerConfig};
use crate::envelope::ToolCallEnvelope;
use crate::error::ToolRpcError;
use crate::retry::ToolExecutor;
use crate::stats::{PoolStats, StatsRecorder};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// A checked-out client. Dropping it puts the client back in the queue.
struct PooledClient<'a> {
    client: Arc<RpcClient>,
    pool: &'a ClientPool,
}

impl PooledClient<'_> {
    fn client(&self) -> &RpcClient {
        &self.client
    }
}

impl Drop for PooledClient<'_> {
    fn drop(&mut self) {
        self.pool.release(Arc::clone(&self.client));
    }
}

/// Counts one call in the pool stats, as a failure if it is dropped
/// before finishing.
struct CallRecord<'a> {
    stats: &'a StatsRecorder,
    start: Instant,
    finished: bool,
}

impl CallRecord<'_> {
    fn finish(mut self, envelope: &ToolCallEnvelope) {
        self.finished = true;
        self.stats.record(envelope.is_success(), envelope.latency_ms);
    }
}

impl Drop for CallRecord<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.stats.record(false, self.start.elapsed().as_millis() as u64);
        }
    }
}

/// Pool of [`RpcClient`]s speaking to the same tool executable.
pub struct ClientPool {
    server: Arc<ServerConfig>,
    config: PoolConfig,
    members: Mutex<Vec<Arc<RpcClient>>>,
    queue_tx: mpsc::UnboundedSender<Arc<RpcClient>>,
    queue_rx: Mutex<mpsc::UnboundedReceiver<Arc<RpcClient>>>,
    available: AtomicUsize,
    closed: AtomicBool,
    shutdown: CancellationToken,
    stats: StatsRecorder,
}

impl ClientPool {
    /// Create an empty pool. Nothing is spawned until [`initialize`](Self::initialize).
    pub fn new(server: ServerConfig, config: PoolConfig) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            server: Arc::new(server),
            config,
            members: Mutex::new(Vec::new()),
            queue_tx,
            queue_rx: Mutex::new(queue_rx),
            available: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            stats: StatsRecorder::default(),
        }
    }

    /// Connect up to `pool_size` clients concurrently and queue the ones
    /// that succeed. Returns how many joined the pool.
    ///
    /// Falling short of `pool_size` is not an error; the pool runs with
    /// whatever connected.
    pub async fn initialize(&self, pool_size: usize) -> usize {
        if self.closed.load(Ordering::SeqCst) {
            tracing::warn!("Ignoring initialize on a shut down pool");
            return 0;
        }

        let first_index = self.members.lock().await.len();
        let mut connects = JoinSet::new();
        for i in 0..pool_size {
            let server = Arc::clone(&self.server);
            let label = format!("client-{}", first_index + i);
            connects.spawn(async move {
                let attempts = server.connect_attempts;
                let client = Arc::new(RpcClient::new(label, server));
                let connected = client.connect(attempts).await;
                (client, connected)
            });
        }

        let mut connected = 0;
        while let Some(joined) = connects.join_next().await {
            match joined {
                Ok((client, true)) => {
                    // Checked under the members lock: shutdown closes the
                    // pool before taking the members
                    let mut members = self.members.lock().await;
                    if self.closed.load(Ordering::SeqCst) {
                        drop(members);
                        tracing::debug!("[{}] Pool shut down while connecting", client.label());
                        client.disconnect().await;
                        continue;
                    }
                    members.push(Arc::clone(&client));
                    drop(members);
                    self.release(client);
                    connected += 1;
                }
                Ok((client, false)) => {
                    tracing::debug!("[{}] Not added to pool", client.label());
                }
                Err(e) => tracing::warn!("Pool connect task failed: {}", e),
            }
        }

        if self.closed.load(Ordering::SeqCst) {
            tracing::debug!("Pool initialize finished after shutdown");
        } else if connected < pool_size {
            tracing::warn!(
                "Client pool for '{}' running at reduced capacity: {}/{} connected",
                self.server.command,
                connected,
                pool_size
            );
        } else {
            tracing::info!(
                "Client pool for '{}' ready with {} client(s)",
                self.server.command,
                connected
            );
        }
        connected
    }

    /// Run one tool call on a free client, waiting at most `timeout` for one.
    pub async fn execute_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
        timeout: Duration,
    ) -> ToolCallEnvelope {
        let start = Instant::now();
        let pooled = match self.acquire(timeout).await {
            Ok(pooled) => pooled,
            Err(e) => {
                tracing::debug!("No client for '{}': {}", name, e);
                return ToolCallEnvelope::failure(name, &e, start.elapsed());
            }
        };

        let record = CallRecord {
            stats: &self.stats,
            start,
            finished: false,
        };
        let client = pooled.client();
        if self.config.reconnect_on_acquire && !client.is_connected().await {
            tracing::warn!("[{}] Tool process is gone, reconnecting", client.label());
            client.connect(1).await;
            // A shutdown that ran during the reconnect missed the new process
            if self.closed.load(Ordering::SeqCst) {
                client.disconnect().await;
            }
        }

        let envelope = client.call_tool(name, arguments).await;
        record.finish(&envelope);
        envelope
    }

    /// Read a resource through any free client.
    pub async fn read_resource(&self, uri: &str) -> Result<serde_json::Value, ToolRpcError> {
        let pooled = self.acquire(self.config.acquire_timeout()).await?;
        pooled.client().read_resource(uri).await
    }

    /// Tools cached by the first connected member.
    pub async fn list_tools(&self) -> Vec<ToolInfo> {
        for client in self.members_snapshot().await {
            if client.is_connected().await {
                return client.tools().await;
            }
        }
        Vec::new()
    }

    /// Resources cached by the first connected member.
    pub async fn list_resources(&self) -> Vec<ResourceInfo> {
        for client in self.members_snapshot().await {
            if client.is_connected().await {
                return client.resources().await;
            }
        }
        Vec::new()
    }

    /// Probe every member, checked out or not.
    pub async fn health_check(&self) -> Vec<HealthReport> {
        let mut probes = JoinSet::new();
        for client in self.members_snapshot().await {
            probes.spawn(async move { client.health_check().await });
        }
        let mut reports = Vec::new();
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => tracing::warn!("Health probe task failed: {}", e),
            }
        }
        reports.sort_by(|a, b| a.client.cmp(&b.client));
        reports
    }

    pub async fn stats(&self) -> PoolStats {
        let members = self.members_snapshot().await;
        let mut connected = 0;
        for client in &members {
            if client.is_connected().await {
                connected += 1;
            }
        }
        PoolStats {
            connected_clients: connected,
            available_clients: self.available(),
            pool_size: members.len(),
            ..self.stats.snapshot()
        }
    }

    /// Clients currently in the queue.
    pub fn available(&self) -> usize {
        self.available.load(Ordering::SeqCst)
    }

    /// Clients owned by the pool, queued or checked out.
    pub async fn size(&self) -> usize {
        self.members.lock().await.len()
    }

    pub fn default_acquire_timeout(&self) -> Duration {
        self.config.acquire_timeout()
    }

    /// Disconnect every member and empty the queue. Idempotent.
    ///
    /// Callers waiting for a client get `PoolClosed`; calls in flight see
    /// their process go away.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();

        {
            let mut queue = self.queue_rx.lock().await;
            queue.close();
            while queue.try_recv().is_ok() {}
            self.available.store(0, Ordering::SeqCst);
        }

        let members = std::mem::take(&mut *self.members.lock().await);
        let count = members.len();
        let mut disconnects = JoinSet::new();
        for client in members {
            disconnects.spawn(async move { client.disconnect().await });
        }
        while let Some(joined) = disconnects.join_next().await {
            if let Err(e) = joined {
                tracing::warn!("Disconnect task failed: {}", e);
            }
        }
        tracing::info!(
            "Client pool for '{}' shut down ({} client(s))",
            self.server.command,
            count
        );
    }

    async fn acquire(&self, timeout: Duration) -> Result<PooledClient<'_>, ToolRpcError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ToolRpcError::PoolClosed);
        }

        let next = async { self.queue_rx.lock().await.recv().await };
        let received = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(ToolRpcError::PoolClosed),
            received = tokio::time::timeout(timeout, next) => received,
        };

        match received {
            Ok(Some(client)) => {
                self.available.fetch_sub(1, Ordering::SeqCst);
                Ok(PooledClient { client, pool: self })
            }
            Ok(None) => Err(ToolRpcError::PoolClosed),
            Err(_) => Err(ToolRpcError::PoolTimeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    fn release(&self, client: Arc<RpcClient>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        // Count before sending so a concurrent acquire never underflows
        self.available.fetch_add(1, Ordering::SeqCst);
        if self.queue_tx.send(client).is_err() {
            self.available.fetch_sub(1, Ordering::SeqCst);
        }
    }

    async fn members_snapshot(&self) -> Vec<Arc<RpcClient>> {
        self.members.lock().await.clone()
    }
}

impl ToolExecutor for ClientPool {
    fn execute_tool<'a>(
        &'a self,
        name: &'a str,
        arguments: serde_json::Value,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = ToolCallEnvelope> + Send + 'a>> {
        Box::pin(ClientPool::execute_tool(self, name, arguments, timeout))
    }
}

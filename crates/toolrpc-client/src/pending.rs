//! Correlation table: request id -> caller awaiting that id's response.

use crate::error::ToolRpcError;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, oneshot};

/// What a pending caller receives: the `result` payload or an error.
pub type Outcome = Result<serde_json::Value, ToolRpcError>;

/// One in-flight request.
#[derive(Debug)]
pub struct PendingRequest {
    pub id: u64,
    pub method: String,
    pub created_at: Instant,
    pub deadline: Option<Instant>,
    tx: oneshot::Sender<Outcome>,
}

/// Pending requests of one client, shared by the call path (insert) and
/// the response reader (remove + resolve).
///
/// An entry is removed before it is resolved, so each id resolves at most once.
#[derive(Debug, Default)]
pub struct PendingTable {
    entries: Mutex<HashMap<u64, PendingRequest>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` and return the receiver its caller awaits.
    pub async fn register(
        &self,
        id: u64,
        method: &str,
        timeout: Option<Duration>,
    ) -> oneshot::Receiver<Outcome> {
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        let request = PendingRequest {
            id,
            method: method.to_string(),
            created_at: now,
            deadline: timeout.map(|t| now + t),
            tx,
        };
        let previous = self.entries.lock().await.insert(id, request);
        debug_assert!(previous.is_none(), "request id {id} registered twice");
        rx
    }

    /// Remove `id` and hand `outcome` to its caller.
    ///
    /// Returns `false` if no entry exists (already timed out or never issued).
    pub async fn resolve(&self, id: u64, outcome: Outcome) -> bool {
        let Some(request) = self.entries.lock().await.remove(&id) else {
            return false;
        };
        if request.deadline.is_some_and(|d| d <= Instant::now()) {
            tracing::debug!(
                "Request {} ({}) resolved past its deadline after {:?}",
                id,
                request.method,
                request.created_at.elapsed()
            );
        }
        // The caller may have stopped waiting; the entry is gone either way
        let _ = request.tx.send(outcome);
        true
    }

    /// Drop `id` without resolving it.
    pub async fn remove(&self, id: u64) -> bool {
        self.entries.lock().await.remove(&id).is_some()
    }

    /// Fail every pending request with the error produced by `make_err`.
    pub async fn reject_all<F>(&self, make_err: F) -> usize
    where
        F: Fn() -> ToolRpcError,
    {
        let drained: Vec<PendingRequest> =
            self.entries.lock().await.drain().map(|(_, r)| r).collect();
        let count = drained.len();
        for request in drained {
            let _ = request.tx.send(Err(make_err()));
        }
        count
    }

    pub async fn contains(&self, id: u64) -> bool {
        self.entries.lock().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn resolve_delivers_and_removes() {
        let table = PendingTable::new();
        let rx = table.register(1, "tools/call", None).await;
        assert!(table.contains(1).await);

        assert!(table.resolve(1, Ok(json!({"x": 1}))).await);
        assert!(!table.contains(1).await);
        assert_eq!(rx.await.unwrap().unwrap(), json!({"x": 1}));
    }

    #[tokio::test]
    async fn second_resolution_is_rejected() {
        let table = PendingTable::new();
        let rx = table.register(5, "tools/call", None).await;
        assert!(table.resolve(5, Ok(json!("first"))).await);
        assert!(!table.resolve(5, Ok(json!("second"))).await);
        assert_eq!(rx.await.unwrap().unwrap(), json!("first"));
    }

    #[tokio::test]
    async fn unknown_id_is_not_resolved() {
        let table = PendingTable::new();
        assert!(!table.resolve(99, Ok(json!(null))).await);
    }

    #[tokio::test]
    async fn out_of_order_resolution_matches_by_id() {
        let table = PendingTable::new();
        let rx1 = table.register(1, "a", None).await;
        let rx2 = table.register(2, "b", None).await;
        let rx3 = table.register(3, "c", None).await;

        table.resolve(3, Ok(json!(3))).await;
        table.resolve(1, Ok(json!(1))).await;
        table.resolve(2, Ok(json!(2))).await;

        assert_eq!(rx1.await.unwrap().unwrap(), json!(1));
        assert_eq!(rx2.await.unwrap().unwrap(), json!(2));
        assert_eq!(rx3.await.unwrap().unwrap(), json!(3));
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn reject_all_fails_every_waiter() {
        let table = PendingTable::new();
        let rx1 = table.register(1, "a", None).await;
        let rx2 = table.register(2, "b", None).await;

        let rejected = table
            .reject_all(|| ToolRpcError::ConnectionLost("gone".into()))
            .await;
        assert_eq!(rejected, 2);
        assert!(table.is_empty().await);
        for rx in [rx1, rx2] {
            match rx.await.unwrap() {
                Err(ToolRpcError::ConnectionLost(msg)) => assert_eq!(msg, "gone"),
                other => panic!("Expected ConnectionLost, got: {other:?}"),
            }
        }
    }
}

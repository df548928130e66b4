//! Pool-level call statistics.

use serde::Serialize;
use std::sync::Mutex;

/// Snapshot of pool activity.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Running mean over every completed call.
    pub avg_latency_ms: f64,
    /// `failed_requests / total_requests`, 0.0 when idle.
    pub error_rate: f64,
    pub connected_clients: usize,
    pub available_clients: usize,
    pub pool_size: usize,
}

#[derive(Debug, Default)]
struct Counters {
    total: u64,
    successful: u64,
    avg_latency_ms: f64,
}

/// Accumulates per-call results. Only the pool writes to it.
///
/// Synchronous so a call dropped mid-flight can still be counted from a
/// destructor.
#[derive(Debug, Default)]
pub(crate) struct StatsRecorder {
    counters: Mutex<Counters>,
}

impl StatsRecorder {
    pub(crate) fn record(&self, success: bool, latency_ms: u64) {
        let Ok(mut c) = self.counters.lock() else {
            return;
        };
        c.total += 1;
        if success {
            c.successful += 1;
        }
        c.avg_latency_ms += (latency_ms as f64 - c.avg_latency_ms) / c.total as f64;
    }

    /// Snapshot the counters; client counts are filled in by the pool.
    pub(crate) fn snapshot(&self) -> PoolStats {
        let Ok(c) = self.counters.lock() else {
            return PoolStats::default();
        };
        let failed = c.total - c.successful;
        PoolStats {
            total_requests: c.total,
            successful_requests: c.successful,
            failed_requests: failed,
            avg_latency_ms: c.avg_latency_ms,
            error_rate: if c.total == 0 {
                0.0
            } else {
                failed as f64 / c.total as f64
            },
            ..PoolStats::default()
        }
    }
}

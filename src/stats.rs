//! Throughput counters and periodic reporting.
//!
//! Server side: an atomic served counter plus a single mutex-guarded
//! per-connection map. Reporting is destructive: `snapshot_and_reset` hands
//! back the interval's counts and zeroes them in one atomic operation, so a
//! report never double-counts and the counters read zero right after.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::info;

/// Server-side counters: messages served globally and per connection.
pub struct ServerStats {
    served: AtomicU64,
    per_conn: Mutex<HashMap<usize, u64>>,
}

/// One interval's worth of counts, taken destructively.
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub served: u64,
    pub per_conn: Vec<u64>,
}

/// Derived figures for one reporting interval.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsReport {
    /// Messages served per second over the interval.
    pub throughput: f64,
    /// Mean messages per connection over the interval.
    pub mean: f64,
    /// Population standard deviation of per-connection counts.
    pub stddev: f64,
    /// Live connections at snapshot time.
    pub connections: usize,
}

impl ServerStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            served: AtomicU64::new(0),
            per_conn: Mutex::new(HashMap::new()),
        })
    }

    /// Add a counter entry for a newly accepted connection.
    pub fn register(&self, conn_id: usize) {
        if let Ok(mut map) = self.per_conn.lock() {
            map.insert(conn_id, 0);
        }
    }

    /// Drop the counter entry when a connection is torn down.
    pub fn remove(&self, conn_id: usize) {
        if let Ok(mut map) = self.per_conn.lock() {
            map.remove(&conn_id);
        }
    }

    /// Count one message observed on `conn_id`.
    pub fn record(&self, conn_id: usize) {
        let mut map = match self.per_conn.lock() {
            Ok(map) => map,
            Err(_) => return,
        };
        self.served.fetch_add(1, Ordering::Relaxed);
        if let Some(count) = map.get_mut(&conn_id) {
            *count += 1;
        }
    }

    /// Take the interval's counts and zero them, atomically with respect to
    /// concurrent `record` calls.
    pub fn snapshot_and_reset(&self) -> StatsSnapshot {
        let mut map = match self.per_conn.lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        let served = self.served.swap(0, Ordering::Relaxed);
        let per_conn = map.values().copied().collect();
        for count in map.values_mut() {
            *count = 0;
        }
        StatsSnapshot { served, per_conn }
    }
}

impl StatsReport {
    /// Compute interval figures from a snapshot.
    pub fn compute(snapshot: &StatsSnapshot, interval: Duration) -> Self {
        let n = snapshot.served as f64;
        let m = snapshot.per_conn.len();
        let mean = if m == 0 { 0.0 } else { n / m as f64 };
        let stddev = if m == 0 {
            0.0
        } else {
            let variance = snapshot
                .per_conn
                .iter()
                .map(|&c| {
                    let d = c as f64 - mean;
                    d * d
                })
                .sum::<f64>()
                / m as f64;
            variance.sqrt()
        };
        Self {
            throughput: n / interval.as_secs_f64(),
            mean,
            stddev,
            connections: m,
        }
    }
}

/// Spawn the server-side reporter thread. Sleeps `delay`, then logs a
/// report every `interval`, resetting the counters each time.
pub fn spawn_server_reporter(stats: Arc<ServerStats>, delay: Duration, interval: Duration) {
    thread::Builder::new()
        .name("server-stats".to_string())
        .spawn(move || {
            thread::sleep(delay);
            loop {
                thread::sleep(interval);
                let snapshot = stats.snapshot_and_reset();
                let report = StatsReport::compute(&snapshot, interval);
                info!(
                    throughput = report.throughput,
                    connections = report.connections,
                    mean_per_conn = report.mean,
                    stddev_per_conn = report.stddev,
                    "Server throughput"
                );
            }
        })
        .expect("failed to spawn stats reporter thread");
}

/// Client-side counters: messages sent and digests received.
pub struct ClientStats {
    sent: AtomicU64,
    received: AtomicU64,
}

impl ClientStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
        })
    }

    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    /// Take and zero both counters. Returns (sent, received).
    pub fn snapshot_and_reset(&self) -> (u64, u64) {
        (
            self.sent.swap(0, Ordering::Relaxed),
            self.received.swap(0, Ordering::Relaxed),
        )
    }
}

/// Spawn the client-side reporter thread.
pub fn spawn_client_reporter(stats: Arc<ClientStats>, delay: Duration, interval: Duration) {
    thread::Builder::new()
        .name("client-stats".to_string())
        .spawn(move || {
            thread::sleep(delay);
            loop {
                thread::sleep(interval);
                let (sent, received) = stats.snapshot_and_reset();
                info!(sent, received, "Client traffic");
            }
        })
        .expect("failed to spawn stats reporter thread");
}

// Process-wide bus statistics
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counters incremented by the bus core on each relevant transition.
/// Reset only on process restart.
pub struct BusStats {
    published: AtomicU64,
    received: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    started_at: Instant,
    last_error: parking_lot::Mutex<Option<String>>,
}

impl BusStats {
    pub fn new() -> Self {
        Self {
            published: AtomicU64::new(0),
            received: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            started_at: Instant::now(),
            last_error: parking_lot::Mutex::new(None),
        }
    }

    pub(crate) fn inc_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_published(&self, n: u64) {
        self.published.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn inc_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self, error: &str) {
        *self.last_error.lock() = Some(error.to_string());
    }

    /// Read-only snapshot for external callers.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            uptime_secs: self.started_at.elapsed().as_secs(),
            last_error: self.last_error.lock().clone(),
        }
    }
}

impl Default for BusStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of the bus counters
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub published: u64,
    pub received: u64,
    pub failed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub uptime_secs: u64,
    pub last_error: Option<String>,
}

//! Session counters
//!
//! The counters use Relaxed ordering: they are observational only and do
//! not synchronize any other memory.

use std::sync::atomic::{AtomicU64, Ordering};

/// Transaction and flush counters for one session
#[derive(Debug, Default)]
pub struct SessionMetrics {
    begun: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
    flushes: AtomicU64,
    flush_failures: AtomicU64,
    savepoint_rollbacks: AtomicU64,
}

impl SessionMetrics {
    /// All counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_begin(&self) {
        self.begun.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_commit(&self) {
        self.committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rollback(&self) {
        self.rolled_back.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_flush(&self, success: bool) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.flush_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_savepoint_rollback(&self) {
        self.savepoint_rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Current values
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            begun: self.begun.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            rolled_back: self.rolled_back.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
            savepoint_rollbacks: self.savepoint_rollbacks.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`SessionMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Transactions begun
    pub begun: u64,
    /// Transactions committed
    pub committed: u64,
    /// Transactions rolled back
    pub rolled_back: u64,
    /// Physical flushes attempted
    pub flushes: u64,
    /// Flushes that reported failures
    pub flush_failures: u64,
    /// Rollbacks to a savepoint
    pub savepoint_rollbacks: u64,
}

impl MetricsSnapshot {
    /// Transactions that finished either way
    pub fn completed(&self) -> u64 {
        self.committed + self.rolled_back
    }

    /// committed / begun, 0 when nothing began
    pub fn commit_rate(&self) -> f64 {
        if self.begun > 0 {
            self.committed as f64 / self.begun as f64
        } else {
            0.0
        }
    }
}

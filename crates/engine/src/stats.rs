//! Engine operation counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic operation counters, shared by every engine clone.
#[derive(Debug, Default)]
pub struct EngineStats {
    creates: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
    reads: AtomicU64,
    lists: AtomicU64,
    conflict_retries: AtomicU64,
}

/// Point-in-time snapshot of [`EngineStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct EngineStatsSnapshot {
    /// Successful creates.
    pub creates: u64,
    /// Successful updates.
    pub updates: u64,
    /// Successful deletes.
    pub deletes: u64,
    /// Point reads served.
    pub reads: u64,
    /// List queries served.
    pub lists: u64,
    /// Version-conflict retries performed internally.
    pub conflict_retries: u64,
}

impl EngineStats {
    pub(crate) fn record_create(&self) {
        self.creates.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_update(&self) {
        self.updates.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_list(&self) {
        self.lists.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_conflict_retry(&self) {
        self.conflict_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Samples the counters.
    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            creates: self.creates.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            lists: self.lists.load(Ordering::Relaxed),
            conflict_retries: self.conflict_retries.load(Ordering::Relaxed),
        }
    }
}

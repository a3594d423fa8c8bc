//! Single-flight cache fill.
//!
//! De-duplicates concurrent loads of the same record key: the first
//! caller (the leader) runs the loader; everyone else arriving before it
//! resolves joins and awaits the leader's outcome. Under a thundering
//! herd on one id, the KV substrate receives exactly one read.
//!
//! The in-flight entry is removed on every exit path. If a leader is
//! cancelled mid-load, its drop guard clears the entry and wakes the
//! waiters, one of which re-runs the load from the top.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use plinth_types::Record;
use snafu::Snafu;
use tokio::sync::oneshot;
use tracing::debug;

use crate::cache::RecordCache;

/// Clonable load failure, fanned out to every joined waiter.
#[derive(Debug, Clone, Snafu)]
#[snafu(display("cache fill for {key} failed: {message}"))]
pub struct LoadError {
    /// Record key whose load failed.
    pub key: String,
    /// Description of the underlying fault.
    pub message: String,
}

/// Outcome of one load, shared between the leader and its waiters.
pub type LoadOutcome = Result<Option<Arc<Record>>, LoadError>;

/// Gate consulted before a loader outcome is written into the cache.
/// Returns false while a write for the key is still in flight, so a
/// stale read cannot overwrite the post-commit cache entry.
pub type FillGate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Collapses duplicate concurrent loads of the same key over the cache.
pub struct SingleFlight {
    cache: Arc<RecordCache>,
    inflight: Mutex<HashMap<String, Vec<oneshot::Sender<LoadOutcome>>>>,
    fill_allowed: FillGate,
}

impl SingleFlight {
    /// Creates a single-flight wrapper that always fills the cache on a
    /// successful load.
    pub fn new(cache: Arc<RecordCache>) -> Self {
        Self::with_fill_gate(cache, Arc::new(|_| true))
    }

    /// Creates a single-flight wrapper with a cache-fill gate.
    pub fn with_fill_gate(cache: Arc<RecordCache>, fill_allowed: FillGate) -> Self {
        Self { cache, inflight: Mutex::new(HashMap::new()), fill_allowed }
    }

    /// Returns the cached record for `key`, or joins/starts a load.
    ///
    /// The loader is only invoked by the leader; on completion its
    /// outcome is written to the cache (unless it returned absence or the
    /// fill gate refuses) and fanned out to every waiter.
    ///
    /// # Errors
    ///
    /// Propagates the loader's failure to the leader and every waiter.
    pub async fn get<F, Fut>(&self, key: &str, loader: F) -> LoadOutcome
    where
        F: Fn() -> Fut,
        Fut: Future<Output = LoadOutcome>,
    {
        loop {
            if let Some(hit) = self.cache.get(key) {
                return Ok(Some(hit));
            }

            let waiter = {
                let mut inflight = self.inflight.lock();
                match inflight.entry(key.to_string()) {
                    Entry::Occupied(mut entry) => {
                        let (tx, rx) = oneshot::channel();
                        entry.get_mut().push(tx);
                        Some(rx)
                    },
                    Entry::Vacant(entry) => {
                        entry.insert(Vec::new());
                        None
                    },
                }
            };

            if let Some(rx) = waiter {
                match rx.await {
                    Ok(outcome) => return outcome,
                    // Leader cancelled before resolving; take another run
                    // at the cache and possibly become the leader.
                    Err(_) => {
                        debug!(key, "single-flight leader dropped, retrying");
                        continue;
                    },
                }
            }

            // Leader path. The guard clears the in-flight entry even if
            // this future is dropped at the await point below.
            let mut guard = FlightGuard { flight: self, key, done: false };
            let outcome = loader().await;

            if let Ok(Some(record)) = &outcome
                && (self.fill_allowed)(key)
            {
                self.cache.set_if_newer(key.to_string(), Arc::clone(record));
            }

            let waiters = guard.finish();
            for tx in waiters {
                let _ = tx.send(outcome.clone());
            }
            return outcome;
        }
    }

    /// Number of keys with a load currently in flight.
    pub fn inflight_len(&self) -> usize {
        self.inflight.lock().len()
    }
}

impl std::fmt::Debug for SingleFlight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlight").field("inflight", &self.inflight_len()).finish()
    }
}

/// Removes the in-flight entry on drop. Waiters whose sender is dropped
/// without a value observe a closed channel and retry.
struct FlightGuard<'a> {
    flight: &'a SingleFlight,
    key: &'a str,
    done: bool,
}

impl FlightGuard<'_> {
    fn finish(&mut self) -> Vec<oneshot::Sender<LoadOutcome>> {
        self.done = true;
        self.flight.inflight.lock().remove(self.key).unwrap_or_default()
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.flight.inflight.lock().remove(self.key);
        }
    }
}

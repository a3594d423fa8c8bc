//! Write coalescing for improved commit throughput.
//!
//! The write buffer accepts atomic write intents and coalesces them into
//! group commits against the KV substrate. Callers receive the outcome
//! through a oneshot completion; the engine awaits it before returning.
//!
//! ## Architecture
//!
//! ```text
//! add(intent)
//!     ├── draining? → commit synchronously, apply cache, return
//!     ├── flush queue saturated? → fail fast with Overload
//!     ├── push onto ingress; arm interval on first intent
//!     └── ingress reached max_buffer_size → wake the worker now
//!
//! worker (exactly one)
//!     ├── freeze: swap ingress into a FIFO queue of frozen batches
//!     ├── pop next batch, concatenate ops in insertion order
//!     ├── one atomic substrate batch (spawn_blocking)
//!     ├── on success: apply cache updates, complete every intent
//!     └── yield every few batches when the queue runs deep
//! ```
//!
//! Concurrent batch commits against the same substrate pathologically
//! contend; a single committer with growing batch sizes turns offered
//! load into throughput. The single-committer invariant is guarded by an
//! instrumented flag.
//!
//! ## Durability modes
//!
//! `Safe` (default): the completion fires only after the batch commits.
//! `Optimistic`: cache updates are applied and the caller completes at
//! enqueue; the commit happens in the background and a failure is
//! logged. Process-wide knob.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use plinth_storage::{BatchOp, Substrate};
use plinth_types::{PlinthError, Record};
use snafu::Snafu;
use tokio::sync::{oneshot, watch};
use tokio::time::interval;
use tracing::{debug, info, instrument, warn};

use crate::cache::RecordCache;

/// Suggested client back-off when the buffer refuses an intent.
const OVERLOAD_RETRY_AFTER_MS: u64 = 1000;

/// Queue depth above which the worker starts yielding between batches.
const YIELD_QUEUE_DEPTH: usize = 2;

/// Commit durability mode for the whole process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitMode {
    /// Complete intents only after their batch durably commits.
    #[default]
    Safe,
    /// Complete intents at enqueue; commit in the background.
    Optimistic,
}

impl CommitMode {
    /// Static label for stats and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            CommitMode::Safe => "safe",
            CommitMode::Optimistic => "optimistic",
        }
    }
}

/// Configuration for the write buffer.
#[derive(Debug, Clone, bon::Builder)]
pub struct WriteBufferConfig {
    /// Maximum time an ingress intent waits before its batch freezes.
    #[builder(default = Duration::from_millis(25))]
    pub flush_interval: Duration,
    /// Interval at which the worker re-checks the flush conditions.
    #[builder(default = Duration::from_millis(5))]
    pub tick_interval: Duration,
    /// Ingress size that triggers an immediate flush.
    #[builder(default = 500)]
    pub max_buffer_size: usize,
    /// Frozen batches allowed on the flush queue before new intents are
    /// refused with `Overload`.
    #[builder(default = 50)]
    pub max_queued_batches: usize,
    /// Durability mode.
    #[builder(default)]
    pub mode: CommitMode,
}

impl Default for WriteBufferConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(25),
            tick_interval: Duration::from_millis(5),
            max_buffer_size: 500,
            max_queued_batches: 50,
            mode: CommitMode::Safe,
        }
    }
}

/// An atomic write intent: substrate ops plus the cache entries to apply
/// once the ops durably commit (`None` value = tombstone).
#[derive(Debug)]
pub struct WriteIntent {
    /// Substrate batch entries, applied in order.
    pub ops: Vec<BatchOp>,
    /// Cache updates applied after commit.
    pub cache_updates: Vec<(String, Option<Arc<Record>>)>,
}

/// Clonable commit failure, fanned out to every intent of a batch.
#[derive(Debug, Clone, Snafu)]
pub enum FlushError {
    /// The substrate rejected the batch.
    #[snafu(display("batch commit failed: {message}"))]
    Commit {
        /// Underlying fault description.
        message: String,
    },
}

/// A pending write waiting to be batched.
struct PendingWrite {
    intent: WriteIntent,
    completion: Option<oneshot::Sender<Result<(), FlushError>>>,
    queued_at: Instant,
}

/// Mutexed buffer state: the ingress and the frozen FIFO.
struct BufferState {
    ingress: Vec<PendingWrite>,
    first_pending_at: Option<Instant>,
    flush_queue: VecDeque<Vec<PendingWrite>>,
    draining: bool,
}

impl BufferState {
    fn new() -> Self {
        Self {
            ingress: Vec::new(),
            first_pending_at: None,
            flush_queue: VecDeque::new(),
            draining: false,
        }
    }

    fn should_freeze(&self, config: &WriteBufferConfig) -> bool {
        if self.ingress.is_empty() {
            return false;
        }
        if self.draining || self.ingress.len() >= config.max_buffer_size {
            return true;
        }
        self.first_pending_at
            .is_some_and(|first| first.elapsed() >= config.flush_interval)
    }

    fn freeze(&mut self) -> Vec<PendingWrite> {
        self.first_pending_at = None;
        std::mem::take(&mut self.ingress)
    }
}

/// Monotonic counters, sampled by [`WriteBufferHandle::stats`].
#[derive(Default)]
struct Counters {
    flushed_batches: AtomicU64,
    flushed_intents: AtomicU64,
    largest_batch: AtomicU64,
    overload_rejections: AtomicU64,
    concurrent_flush_attempts: AtomicU64,
}

/// Point-in-time buffer statistics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BufferStatsSnapshot {
    /// Intents currently on the ingress.
    pub buffered: usize,
    /// Frozen batches awaiting commit.
    pub queued_batches: usize,
    /// Batches committed since start.
    pub flushed_batches: u64,
    /// Intents committed since start.
    pub flushed_intents: u64,
    /// Largest batch committed so far.
    pub largest_batch: u64,
    /// Intents refused due to flush-queue saturation.
    pub overload_rejections: u64,
    /// Times a second committer was observed (always 0; instrumented
    /// guard for the single-committer invariant).
    pub concurrent_flush_attempts: u64,
    /// Durability mode.
    pub mode: &'static str,
    /// True once shutdown draining has begun.
    pub draining: bool,
}

struct Shared {
    state: Mutex<BufferState>,
    config: WriteBufferConfig,
    kv: Arc<Substrate>,
    cache: Arc<RecordCache>,
    wake: tokio::sync::Notify,
    committing: AtomicBool,
    /// Refcount of record keys with an in-flight cache update; consulted
    /// by the read path's fill gate.
    pending_keys: Mutex<HashMap<String, usize>>,
    counters: Counters,
    idle_tx: watch::Sender<bool>,
}

/// The write coalescer. Spawn [`WriteBuffer::run`] once; submit through
/// cloned [`WriteBufferHandle`]s.
pub struct WriteBuffer {
    shared: Arc<Shared>,
}

/// Cheap handle for submitting intents and sampling stats.
#[derive(Clone)]
pub struct WriteBufferHandle {
    shared: Arc<Shared>,
}

impl WriteBuffer {
    /// Creates a buffer over the given substrate and cache.
    pub fn new(kv: Arc<Substrate>, cache: Arc<RecordCache>, config: WriteBufferConfig) -> Self {
        let (idle_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BufferState::new()),
                config,
                kv,
                cache,
                wake: tokio::sync::Notify::new(),
                committing: AtomicBool::new(false),
                pending_keys: Mutex::new(HashMap::new()),
                counters: Counters::default(),
                idle_tx,
            }),
        }
    }

    /// Returns a handle for submitting intents.
    pub fn handle(&self) -> WriteBufferHandle {
        WriteBufferHandle { shared: Arc::clone(&self.shared) }
    }

    /// Runs the flush worker loop. Spawn exactly once as a background
    /// task; the loop exits after a drain completes.
    #[instrument(skip(self), name = "write_buffer")]
    pub async fn run(self) {
        let shared = self.shared;
        let mut ticker = interval(shared.config.tick_interval);
        info!(
            flush_interval_ms = shared.config.flush_interval.as_millis() as u64,
            max_buffer_size = shared.config.max_buffer_size,
            max_queued_batches = shared.config.max_queued_batches,
            mode = shared.config.mode.as_str(),
            "starting write coalescer"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {},
                _ = shared.wake.notified() => {},
            }

            // Freeze the ingress into the FIFO when a flush is due.
            {
                let mut state = shared.state.lock();
                if state.should_freeze(&shared.config) {
                    let batch = state.freeze();
                    state.flush_queue.push_back(batch);
                }
            }

            // Drain the FIFO. This loop is the single committer.
            let mut drained = 0usize;
            loop {
                let (batch, depth) = {
                    let mut state = shared.state.lock();
                    let depth = state.flush_queue.len();
                    (state.flush_queue.pop_front(), depth)
                };
                let Some(batch) = batch else { break };
                shared.commit_batch(batch).await;
                drained += 1;
                // Don't starve ingress while the queue runs deep.
                if depth > YIELD_QUEUE_DEPTH && drained % 4 == 0 {
                    tokio::task::yield_now().await;
                }
            }

            let finished = {
                let state = shared.state.lock();
                let idle =
                    state.draining && state.ingress.is_empty() && state.flush_queue.is_empty();
                shared.idle_tx.send_replace(idle);
                idle
            };
            if finished {
                info!("write coalescer drained, exiting");
                return;
            }
        }
    }
}

impl WriteBufferHandle {
    /// Submits an atomic write intent.
    ///
    /// In `Safe` mode this resolves once the intent's batch durably
    /// commits and its cache updates are applied. In `Optimistic` mode
    /// it resolves at enqueue. During shutdown draining the intent is
    /// committed synchronously.
    ///
    /// # Errors
    ///
    /// Returns [`PlinthError::Overload`] when the flush queue is
    /// saturated, or a substrate error if the commit fails.
    pub async fn add(&self, intent: WriteIntent) -> Result<(), PlinthError> {
        let shared = &self.shared;
        let optimistic = shared.config.mode == CommitMode::Optimistic;

        let waiter = match shared.begin_add(intent, optimistic) {
            AddOutcome::Drain(intent) => return shared.commit_now(intent).await,
            AddOutcome::Overload { queued } => {
                shared.counters.overload_rejections.fetch_add(1, Ordering::Relaxed);
                return Err(PlinthError::Overload {
                    queued,
                    retry_after_ms: OVERLOAD_RETRY_AFTER_MS,
                });
            },
            AddOutcome::Waiter(rx) => rx,
        };

        if optimistic {
            // Background commit; failures are logged by the worker.
            return Ok(());
        }

        match waiter.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(PlinthError::substrate(err)),
            Err(_) => Err(PlinthError::substrate("write intent dropped before commit")),
        }
    }

    /// True while a cache update for `key` is queued or committing. The
    /// read path consults this before filling the cache, so a read that
    /// raced a write cannot resurrect a stale entry.
    pub fn is_pending(&self, key: &str) -> bool {
        self.shared.pending_keys.lock().contains_key(key)
    }

    /// Switches to the draining state and resolves once every queued
    /// intent has committed and the worker has exited. New intents
    /// arriving afterwards are committed synchronously.
    pub async fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.draining {
                return;
            }
            state.draining = true;
        }
        info!("write buffer draining");
        self.shared.wake.notify_one();

        let mut idle = self.shared.idle_tx.subscribe();
        while !*idle.borrow_and_update() {
            self.shared.wake.notify_one();
            if idle.changed().await.is_err() {
                break;
            }
        }
    }

    /// Point-in-time statistics.
    pub fn stats(&self) -> BufferStatsSnapshot {
        let (buffered, queued_batches, draining) = {
            let state = self.shared.state.lock();
            (state.ingress.len(), state.flush_queue.len(), state.draining)
        };
        let c = &self.shared.counters;
        BufferStatsSnapshot {
            buffered,
            queued_batches,
            flushed_batches: c.flushed_batches.load(Ordering::Relaxed),
            flushed_intents: c.flushed_intents.load(Ordering::Relaxed),
            largest_batch: c.largest_batch.load(Ordering::Relaxed),
            overload_rejections: c.overload_rejections.load(Ordering::Relaxed),
            concurrent_flush_attempts: c.concurrent_flush_attempts.load(Ordering::Relaxed),
            mode: self.shared.config.mode.as_str(),
            draining,
        }
    }
}

/// Outcome of [`Shared::begin_add`]: the synchronous part of
/// [`WriteBufferHandle::add`], split out so the buffer mutex guard never
/// has to be threaded through an `.await` point.
enum AddOutcome {
    /// Draining: caller must commit synchronously.
    Drain(WriteIntent),
    /// Flush queue saturated at the given depth.
    Overload { queued: usize },
    /// Enqueued; caller awaits completion.
    Waiter(oneshot::Receiver<Result<(), FlushError>>),
}

impl Shared {
    /// Synchronous half of `add`: locks the buffer state, decides the
    /// outcome, and releases the lock before returning.
    fn begin_add(&self, intent: WriteIntent, optimistic: bool) -> AddOutcome {
        let mut state = self.state.lock();
        if state.draining {
            return AddOutcome::Drain(intent);
        }
        if state.flush_queue.len() >= self.config.max_queued_batches {
            return AddOutcome::Overload { queued: state.flush_queue.len() };
        }

        self.mark_pending(&intent);
        if optimistic {
            self.apply_cache_updates(&intent);
        }

        let (tx, rx) = oneshot::channel();
        if state.first_pending_at.is_none() {
            state.first_pending_at = Some(Instant::now());
        }
        state.ingress.push(PendingWrite { intent, completion: Some(tx), queued_at: Instant::now() });
        let full = state.ingress.len() >= self.config.max_buffer_size;
        drop(state);
        if full {
            self.wake.notify_one();
        }
        AddOutcome::Waiter(rx)
    }

    /// Commits one frozen batch: concatenate ops in insertion order, one
    /// atomic substrate batch, then apply cache updates and complete the
    /// intents.
    async fn commit_batch(&self, mut batch: Vec<PendingWrite>) {
        if batch.is_empty() {
            return;
        }
        let already_committing = self.committing.swap(true, Ordering::SeqCst);
        debug_assert!(!already_committing, "flush worker must be the sole committer");
        if already_committing {
            self.counters.concurrent_flush_attempts.fetch_add(1, Ordering::Relaxed);
        }

        let batch_size = batch.len();
        let start = Instant::now();
        let ops: Vec<BatchOp> =
            batch.iter_mut().flat_map(|pw| std::mem::take(&mut pw.intent.ops)).collect();

        let kv = Arc::clone(&self.kv);
        let result = match tokio::task::spawn_blocking(move || kv.batch(&ops)).await {
            Ok(outcome) => outcome.map_err(|e| e.to_string()),
            Err(join) => Err(join.to_string()),
        };

        match result {
            Ok(()) => {
                self.counters.flushed_batches.fetch_add(1, Ordering::Relaxed);
                self.counters.flushed_intents.fetch_add(batch_size as u64, Ordering::Relaxed);
                self.counters.largest_batch.fetch_max(batch_size as u64, Ordering::Relaxed);

                for mut pw in batch {
                    if self.config.mode == CommitMode::Safe {
                        self.apply_cache_updates(&pw.intent);
                    }
                    self.unmark_pending(&pw.intent);
                    if let Some(tx) = pw.completion.take() {
                        let _ = tx.send(Ok(()));
                    }
                }
                debug!(
                    batch_size,
                    latency_ms = start.elapsed().as_millis() as u64,
                    "flushed batch"
                );
            },
            Err(message) => {
                warn!(error = %message, batch_size, "batch commit failed");
                for mut pw in batch {
                    self.unmark_pending(&pw.intent);
                    let waited_ms = pw.queued_at.elapsed().as_millis() as u64;
                    if let Some(tx) = pw.completion.take() {
                        if tx.send(Err(FlushError::Commit { message: message.clone() })).is_err()
                        {
                            // Optimistic caller already resolved.
                            warn!(waited_ms, "background commit failed after completion");
                        }
                    }
                }
            },
        }

        self.committing.store(false, Ordering::SeqCst);
    }

    /// Synchronous commit path used while draining.
    async fn commit_now(&self, intent: WriteIntent) -> Result<(), PlinthError> {
        let ops = intent.ops;
        let kv = Arc::clone(&self.kv);
        match tokio::task::spawn_blocking(move || kv.batch(&ops)).await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => return Err(PlinthError::substrate(e)),
            Err(join) => return Err(PlinthError::substrate(join)),
        }
        for (key, value) in &intent.cache_updates {
            match value {
                Some(record) => self.cache.set(key.clone(), Arc::clone(record)),
                None => self.cache.delete(key),
            }
        }
        self.counters.flushed_batches.fetch_add(1, Ordering::Relaxed);
        self.counters.flushed_intents.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn apply_cache_updates(&self, intent: &WriteIntent) {
        for (key, value) in &intent.cache_updates {
            match value {
                Some(record) => self.cache.set(key.clone(), Arc::clone(record)),
                None => self.cache.delete(key),
            }
        }
    }

    fn mark_pending(&self, intent: &WriteIntent) {
        let mut pending = self.pending_keys.lock();
        for (key, _) in &intent.cache_updates {
            *pending.entry(key.clone()).or_insert(0) += 1;
        }
    }

    fn unmark_pending(&self, intent: &WriteIntent) {
        let mut pending = self.pending_keys.lock();
        for (key, _) in &intent.cache_updates {
            if let Some(count) = pending.get_mut(key) {
                *count -= 1;
                if *count == 0 {
                    pending.remove(key);
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use plinth_storage::Keyspace;
    use serde_json::json;

    use super::*;

    fn intent(key: &str, version: i64) -> WriteIntent {
        let record = Arc::new(
            Record::from_value(json!({"id": key, "_version": version})).unwrap(),
        );
        WriteIntent {
            ops: vec![BatchOp::put(
                Keyspace::Main,
                format!("posts:{key}"),
                record.to_bytes().unwrap(),
            )],
            cache_updates: vec![(format!("posts:{key}"), Some(record))],
        }
    }

    fn fixture(config: WriteBufferConfig) -> (WriteBufferHandle, Arc<Substrate>, Arc<RecordCache>)
    {
        let kv = Arc::new(Substrate::in_memory().unwrap());
        let cache = Arc::new(RecordCache::new(100));
        let buffer = WriteBuffer::new(Arc::clone(&kv), Arc::clone(&cache), config);
        let handle = buffer.handle();
        tokio::spawn(buffer.run());
        (handle, kv, cache)
    }

    #[tokio::test]
    async fn test_add_commits_and_applies_cache() {
        let (handle, kv, cache) = fixture(WriteBufferConfig::default());
        handle.add(intent("a", 1)).await.unwrap();

        assert!(kv.get(Keyspace::Main, "posts:a").unwrap().is_some());
        assert_eq!(cache.get("posts:a").unwrap().version(), 1);
        assert!(!handle.is_pending("posts:a"));
    }

    #[tokio::test]
    async fn test_concurrent_adds_coalesce_into_one_batch() {
        let config = WriteBufferConfig::builder()
            .flush_interval(Duration::from_millis(30))
            .tick_interval(Duration::from_millis(5))
            .build();
        let (handle, _kv, _cache) = fixture(config);

        let mut tasks = Vec::new();
        for i in 0..20 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                handle.add(intent(&format!("k{i}"), 1)).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let stats = handle.stats();
        assert_eq!(stats.flushed_intents, 20);
        assert_eq!(stats.flushed_batches, 1, "all intents landed in one group commit");
        assert_eq!(stats.largest_batch, 20);
    }

    #[tokio::test]
    async fn test_max_buffer_size_flushes_immediately() {
        let config = WriteBufferConfig::builder()
            .flush_interval(Duration::from_secs(10))
            .tick_interval(Duration::from_millis(1))
            .max_buffer_size(3)
            .build();
        let (handle, kv, _cache) = fixture(config);

        let (a, b, c) = tokio::join!(
            handle.add(intent("a", 1)),
            handle.add(intent("b", 1)),
            handle.add(intent("c", 1)),
        );
        a.unwrap();
        b.unwrap();
        c.unwrap();
        assert!(kv.get(Keyspace::Main, "posts:c").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_overload_fails_fast() {
        let config = WriteBufferConfig::builder().max_queued_batches(0).build();
        let (handle, _kv, _cache) = fixture(config);

        let err = handle.add(intent("a", 1)).await.unwrap_err();
        assert!(matches!(err, PlinthError::Overload { .. }));
        assert_eq!(handle.stats().overload_rejections, 1);
    }

    #[tokio::test]
    async fn test_optimistic_mode_resolves_at_enqueue() {
        let config = WriteBufferConfig::builder()
            .flush_interval(Duration::from_millis(10))
            .mode(CommitMode::Optimistic)
            .build();
        let (handle, kv, cache) = fixture(config);

        handle.add(intent("a", 1)).await.unwrap();
        // Cache visible immediately, disk catches up in the background.
        assert_eq!(cache.get("posts:a").unwrap().version(), 1);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(kv.get(Keyspace::Main, "posts:a").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_single_committer_under_load() {
        let config = WriteBufferConfig::builder()
            .flush_interval(Duration::from_millis(1))
            .tick_interval(Duration::from_millis(1))
            .max_buffer_size(4)
            .build();
        let (handle, _kv, _cache) = fixture(config);

        let mut tasks = Vec::new();
        for i in 0..100 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                handle.add(intent(&format!("k{i}"), 1)).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let stats = handle.stats();
        assert_eq!(stats.flushed_intents, 100);
        assert_eq!(stats.concurrent_flush_attempts, 0, "one committer at a time");
        assert!(stats.flushed_batches > 1, "load split across several group commits");
    }

    #[tokio::test]
    async fn test_is_pending_during_flight() {
        let config = WriteBufferConfig::builder()
            .flush_interval(Duration::from_millis(50))
            .tick_interval(Duration::from_millis(5))
            .build();
        let (handle, _kv, _cache) = fixture(config);

        let add = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.add(intent("a", 1)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(handle.is_pending("posts:a"), "key pending while queued");

        add.await.unwrap().unwrap();
        assert!(!handle.is_pending("posts:a"));
    }

    #[tokio::test]
    async fn test_shutdown_drains_then_commits_synchronously() {
        let config = WriteBufferConfig::builder()
            .flush_interval(Duration::from_millis(50))
            .build();
        let (handle, kv, _cache) = fixture(config);

        let early = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.add(intent("early", 1)).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        handle.shutdown().await;
        early.await.unwrap().unwrap();
        assert!(kv.get(Keyspace::Main, "posts:early").unwrap().is_some());
        assert!(handle.stats().draining);

        // Late intents take the synchronous path.
        handle.add(intent("late", 1)).await.unwrap();
        assert!(kv.get(Keyspace::Main, "posts:late").unwrap().is_some());
    }
}

//! CRUD orchestration over collections.
//!
//! Every mutation runs the same pipeline: validate, read the current
//! record raw (the diff base must keep private fields), check the
//! version precondition, merge, re-check uniqueness, compose the atomic
//! op batch, push it through the write buffer, and finally emit a
//! sanitized change event (fire-and-forget, after the commit).
//!
//! Version conflicts are retried up to three times with exponential
//! back-off, re-reading the current record on every attempt; the fresh
//! read is authoritative for retries, so a caller's stale expectation
//! surfaces once and the patch then lands on top of the winner.
//!
//! Writes to the same record key are serialized on a striped lock pool
//! in front of the buffer, which is what turns two racing updates into
//! the deterministic "one wins, one conflicts and retries" outcome.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use plinth_storage::{BatchOp, Keyspace, Substrate};
use plinth_types::record::{FIELD_CREATED, FIELD_ID, FIELD_UPDATED, FIELD_VERSION};
use plinth_types::{
    PlinthError, Record, Result, Schema, loosely_equal, time, token, validate_collection_name,
};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::broadcast::{ChangeAction, ChangeEvent, ChangeSink};
use crate::cache::{CacheStats, RecordCache};
use crate::indexer::{self, UniquenessGuard};
use crate::keys::{self, record_key, record_prefix};
use crate::schema::SchemaRegistry;
use crate::singleflight::{LoadError, SingleFlight};
use crate::stats::{EngineStats, EngineStatsSnapshot};
use crate::write_buffer::{BufferStatsSnapshot, WriteBufferHandle, WriteIntent};

/// Back-off schedule for version-conflict retries.
const RETRY_BACKOFF_MS: [u64; 3] = [10, 20, 40];

/// Stripes in the per-record write lock pool.
const LOCK_STRIPES: usize = 256;

/// Engine tuning knobs.
#[derive(Debug, Clone, bon::Builder)]
pub struct EngineConfig {
    /// Primary-key scan guard for unindexed list queries.
    #[builder(default = 100)]
    pub max_scan_limit: usize,
    /// Materialized-set size above which a sorted list query warns.
    #[builder(default = 1000)]
    pub sort_materialize_warning: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { max_scan_limit: 100, sort_materialize_warning: 1000 }
    }
}

/// Options for [`Engine::list`].
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Field → value equality filter (loose across primitive types).
    pub filter: Map<String, Value>,
    /// Sort field; `-` prefix sorts descending. Stable.
    pub sort: Option<String>,
    /// 1-based page number.
    pub page: usize,
    /// Page size.
    pub per_page: usize,
}

/// A page of list results.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResult {
    /// Sanitized records on this page.
    pub items: Vec<Record>,
    /// 1-based page number served.
    pub page: usize,
    /// Page size used.
    pub per_page: usize,
    /// Records matching the filter across all pages.
    pub total_items: usize,
    /// Total pages at this page size.
    pub total_pages: usize,
}

/// Striped async lock pool serializing writers of the same record key.
struct KeyLocks {
    stripes: Vec<tokio::sync::Mutex<()>>,
}

impl KeyLocks {
    fn new(stripes: usize) -> Self {
        Self { stripes: (0..stripes.max(1)).map(|_| tokio::sync::Mutex::new(())).collect() }
    }

    async fn lock(&self, key: &str) -> tokio::sync::MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.stripes.len();
        self.stripes[idx].lock().await
    }
}

/// The CRUD engine. Construct once at start-up and share behind `Arc`.
pub struct Engine {
    kv: Arc<Substrate>,
    cache: Arc<RecordCache>,
    schemas: Arc<SchemaRegistry>,
    flight: SingleFlight,
    buffer: WriteBufferHandle,
    sink: Arc<dyn ChangeSink>,
    uniques: UniquenessGuard,
    locks: KeyLocks,
    stats: Arc<EngineStats>,
    config: EngineConfig,
}

impl Engine {
    /// Wires the engine to its collaborators.
    pub fn new(
        kv: Arc<Substrate>,
        cache: Arc<RecordCache>,
        schemas: Arc<SchemaRegistry>,
        buffer: WriteBufferHandle,
        sink: Arc<dyn ChangeSink>,
        config: EngineConfig,
    ) -> Self {
        let gate_buffer = buffer.clone();
        let flight = SingleFlight::with_fill_gate(
            Arc::clone(&cache),
            Arc::new(move |key| !gate_buffer.is_pending(key)),
        );
        Self {
            kv,
            cache,
            schemas,
            flight,
            buffer,
            sink,
            uniques: UniquenessGuard::new(),
            locks: KeyLocks::new(LOCK_STRIPES),
            stats: Arc::new(EngineStats::default()),
            config,
        }
    }

    /// The schema registry (shared with the HTTP layer).
    pub fn schemas(&self) -> &Arc<SchemaRegistry> {
        &self.schemas
    }

    /// Cache counters, for the stats surface.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Write buffer counters, for the stats surface.
    pub fn buffer_stats(&self) -> BufferStatsSnapshot {
        self.buffer.stats()
    }

    /// Operation counters, for the stats surface.
    pub fn stats(&self) -> EngineStatsSnapshot {
        self.stats.snapshot()
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Returns the sanitized record, or `NotFound`.
    ///
    /// # Errors
    ///
    /// Returns [`PlinthError::NotFound`] for an absent record and
    /// propagates substrate faults.
    pub async fn get(&self, collection: &str, id: &str) -> Result<Record> {
        self.stats.record_read();
        let record = self.get_raw(collection, id).await?.ok_or_else(|| {
            PlinthError::NotFound { collection: collection.to_string(), id: id.to_string() }
        })?;
        self.sanitize(collection, &record)
    }

    /// Raw single-flight read: cache, then substrate, de-duplicating
    /// concurrent loads. No sanitization — this feeds update/delete
    /// diffs, which must see private fields.
    ///
    /// # Errors
    ///
    /// Propagates substrate faults.
    pub async fn get_raw(&self, collection: &str, id: &str) -> Result<Option<Arc<Record>>> {
        let key = record_key(collection, id);
        let kv = Arc::clone(&self.kv);
        self.flight
            .get(&key, || {
                let kv = Arc::clone(&kv);
                let key = key.clone();
                async move {
                    let load_error = |message: String| LoadError { key: key.clone(), message };
                    match kv
                        .get(Keyspace::Main, &key)
                        .map_err(|e| load_error(e.to_string()))?
                    {
                        Some(bytes) => Record::from_bytes(&bytes)
                            .map(|record| Some(Arc::new(record)))
                            .map_err(|e| load_error(e.to_string())),
                        None => Ok(None),
                    }
                }
            })
            .await
            .map_err(PlinthError::substrate)
    }

    /// Resolves a unique field value to its raw record, for the auth
    /// glue (login looks up `email` this way and needs `password`).
    ///
    /// # Errors
    ///
    /// Propagates substrate faults.
    pub async fn find_by_unique_raw(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<Option<Arc<Record>>> {
        let Some(id) = indexer::lookup_unique(&self.kv, collection, field, value)? else {
            return Ok(None);
        };
        self.get_raw(collection, &id).await
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Creates a record: fresh 15-character id, `_version` 1,
    /// `created == updated`, index and uniqueness entries committed
    /// atomically with the row. Returns the sanitized record.
    ///
    /// # Errors
    ///
    /// Returns validation, uniqueness, overload, or substrate errors.
    pub async fn create(&self, collection: &str, data: Record) -> Result<Record> {
        if let Err(issue) = validate_collection_name(collection) {
            return Err(PlinthError::Validation {
                collection: collection.to_string(),
                issues: vec![issue],
            });
        }
        let schema = self.schema_for(collection)?;

        let mut record = data;
        for field in [FIELD_ID, FIELD_CREATED, FIELD_UPDATED, FIELD_VERSION] {
            record.remove(field);
        }
        let id = token::new_record_id();
        let now = time::now_rfc3339();
        record.insert(FIELD_ID, Value::from(id.clone()));
        record.insert(FIELD_CREATED, Value::from(now.clone()));
        record.insert(FIELD_UPDATED, Value::from(now));
        record.set_version(1);

        schema.validate(&record).map_err(|issues| PlinthError::Validation {
            collection: collection.to_string(),
            issues,
        })?;

        let key = record_key(collection, &id);
        let _guard = self.locks.lock(&key).await;
        let claim = self.uniques.claim(&self.kv, collection, &record, &schema, None)?;

        let record = Arc::new(record);
        let mut ops = vec![BatchOp::put(
            Keyspace::Main,
            key.clone(),
            record.to_bytes().map_err(PlinthError::serialization)?,
        )];
        ops.extend(indexer::diff(collection, &id, Some(&record), None, &schema));

        self.buffer
            .add(WriteIntent { ops, cache_updates: vec![(key, Some(Arc::clone(&record)))] })
            .await?;
        drop(claim);

        self.stats.record_create();
        let sanitized = record.sanitized(&schema.private_field_names());
        self.emit(collection, ChangeAction::Create, sanitized.clone());
        Ok(sanitized)
    }

    /// Patches a record, guarded by `_version`. Returns the sanitized
    /// new record.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, `VersionConflict` (after exhausting internal
    /// retries), validation, uniqueness, overload, or substrate errors.
    pub async fn update(
        &self,
        collection: &str,
        id: &str,
        patch: Record,
        expected_version: Option<i64>,
    ) -> Result<Record> {
        let mut expected = expected_version;
        let mut attempt = 0;
        loop {
            match self.try_update(collection, id, &patch, expected).await {
                Err(err) if err.is_retryable() && attempt < RETRY_BACKOFF_MS.len() => {
                    debug!(collection, id, attempt, "version conflict, retrying");
                    self.stats.record_conflict_retry();
                    tokio::time::sleep(Duration::from_millis(RETRY_BACKOFF_MS[attempt])).await;
                    attempt += 1;
                    // The re-read is authoritative on retries.
                    expected = None;
                },
                Ok(record) => {
                    self.stats.record_update();
                    return Ok(record);
                },
                Err(err) => return Err(err),
            }
        }
    }

    /// Deletes a record and its index entries atomically. The optional
    /// `expected_version` behaves as in [`Engine::update`].
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, `VersionConflict` (after exhausting internal
    /// retries), overload, or substrate errors.
    pub async fn delete(
        &self,
        collection: &str,
        id: &str,
        expected_version: Option<i64>,
    ) -> Result<()> {
        let mut expected = expected_version;
        let mut attempt = 0;
        loop {
            match self.try_delete(collection, id, expected).await {
                Err(err) if err.is_retryable() && attempt < RETRY_BACKOFF_MS.len() => {
                    debug!(collection, id, attempt, "version conflict on delete, retrying");
                    self.stats.record_conflict_retry();
                    tokio::time::sleep(Duration::from_millis(RETRY_BACKOFF_MS[attempt])).await;
                    attempt += 1;
                    expected = None;
                },
                Ok(()) => {
                    self.stats.record_delete();
                    return Ok(());
                },
                Err(err) => return Err(err),
            }
        }
    }

    async fn try_update(
        &self,
        collection: &str,
        id: &str,
        patch: &Record,
        expected: Option<i64>,
    ) -> Result<Record> {
        let schema = self.schema_for(collection)?;
        let key = record_key(collection, id);
        let _guard = self.locks.lock(&key).await;

        let old = self.require_raw(collection, id).await?;
        self.check_version(collection, id, &old, expected)?;

        let mut merged = (*old).clone();
        let mut patch = patch.clone();
        for field in [FIELD_ID, FIELD_CREATED, FIELD_UPDATED, FIELD_VERSION] {
            patch.remove(field);
        }
        merged.merge(&patch);
        merged.insert(FIELD_ID, Value::from(id));
        merged.insert(
            FIELD_CREATED,
            old.get(FIELD_CREATED)
                .cloned()
                .unwrap_or_else(|| Value::from(time::now_rfc3339())),
        );
        merged.insert(
            FIELD_UPDATED,
            Value::from(time::strictly_after(old.updated().unwrap_or_default())),
        );
        merged.set_version(old.version() + 1);

        schema.validate(&merged).map_err(|issues| PlinthError::Validation {
            collection: collection.to_string(),
            issues,
        })?;

        let claim = self.uniques.claim(&self.kv, collection, &merged, &schema, Some(id))?;

        let merged = Arc::new(merged);
        let mut ops = vec![BatchOp::put(
            Keyspace::Main,
            key.clone(),
            merged.to_bytes().map_err(PlinthError::serialization)?,
        )];
        ops.extend(indexer::diff(collection, id, Some(&merged), Some(&old), &schema));

        self.buffer
            .add(WriteIntent { ops, cache_updates: vec![(key, Some(Arc::clone(&merged)))] })
            .await?;
        drop(claim);

        let sanitized = merged.sanitized(&schema.private_field_names());
        self.emit(collection, ChangeAction::Update, sanitized.clone());
        Ok(sanitized)
    }

    async fn try_delete(
        &self,
        collection: &str,
        id: &str,
        expected: Option<i64>,
    ) -> Result<()> {
        let schema = self.schema_for(collection)?;
        let key = record_key(collection, id);
        let _guard = self.locks.lock(&key).await;

        let old = self.require_raw(collection, id).await?;
        self.check_version(collection, id, &old, expected)?;

        let mut ops = vec![BatchOp::delete(Keyspace::Main, key.clone())];
        ops.extend(indexer::diff(collection, id, None, Some(&old), &schema));

        self.buffer.add(WriteIntent { ops, cache_updates: vec![(key, None)] }).await?;

        let sanitized = old.sanitized(&schema.private_field_names());
        self.emit(collection, ChangeAction::Delete, sanitized);
        Ok(())
    }

    // =========================================================================
    // List
    // =========================================================================

    /// Lists records with filtering, optional stable sort, and
    /// pagination. See the module docs for the indexed fast path.
    ///
    /// # Errors
    ///
    /// Propagates substrate faults and decode failures.
    pub async fn list(&self, collection: &str, opts: ListOptions) -> Result<ListResult> {
        self.stats.record_list();
        let schema = self.schema_for(collection)?;
        let per_page = opts.per_page.max(1);
        let page = opts.page.max(1);

        // Locate at most one indexed field named in the filter; its index
        // enumerates candidates without touching the primary scan guard.
        let indexed_filter = schema
            .indexed_fields()
            .find(|f| opts.filter.get(&f.name).is_some_and(|v| !v.is_null()))
            .map(|f| f.name.clone());

        let candidates: Vec<Arc<Record>> = match &indexed_filter {
            Some(field) => {
                let value = &opts.filter[field];
                let (start, end) =
                    keys::prefix_range(&keys::index_prefix(collection, field, value));
                let rows = self
                    .kv
                    .range(Keyspace::Indexes, &start, &end, None)
                    .map_err(PlinthError::substrate)?;
                let mut out = Vec::with_capacity(rows.len());
                for (_key, id_bytes) in rows {
                    let id = String::from_utf8_lossy(&id_bytes).into_owned();
                    // A candidate whose primary row is gone is skipped;
                    // the atomic batch contract makes this unreachable
                    // for committed histories.
                    if let Some(record) = self.fetch_for_list(collection, &id)? {
                        out.push(record);
                    }
                }
                out
            },
            None => {
                let (start, end) = keys::prefix_range(&record_prefix(collection));
                let rows = self
                    .kv
                    .range(Keyspace::Main, &start, &end, Some(self.config.max_scan_limit))
                    .map_err(PlinthError::substrate)?;
                if rows.len() >= self.config.max_scan_limit {
                    warn!(
                        collection,
                        limit = self.config.max_scan_limit,
                        "unindexed list hit the primary scan guard; results are truncated"
                    );
                }
                let mut out = Vec::with_capacity(rows.len());
                for (_key, bytes) in rows {
                    out.push(Arc::new(
                        Record::from_bytes(&bytes).map_err(PlinthError::serialization)?,
                    ));
                }
                out
            },
        };

        let matches = |record: &Record| {
            opts.filter.iter().all(|(field, wanted)| {
                loosely_equal(record.get(field).unwrap_or(&Value::Null), wanted)
            })
        };

        let private = schema.private_field_names();
        let start_idx = per_page * (page - 1);
        let end_idx = per_page * page;

        let (items, total_items) = match &opts.sort {
            None => {
                // Fast path: count matches, keep only the page window.
                let mut total = 0usize;
                let mut items = Vec::new();
                for record in &candidates {
                    if !matches(record) {
                        continue;
                    }
                    if total >= start_idx && total < end_idx {
                        items.push(record.sanitized(&private));
                    }
                    total += 1;
                }
                (items, total)
            },
            Some(sort) => {
                let (field, descending) = match sort.strip_prefix('-') {
                    Some(rest) => (rest, true),
                    None => (sort.as_str(), false),
                };
                let mut matched: Vec<&Arc<Record>> =
                    candidates.iter().filter(|r| matches(r)).collect();
                if matched.len() > self.config.sort_materialize_warning {
                    warn!(
                        collection,
                        materialized = matched.len(),
                        "sorted list materialized a large result set"
                    );
                }
                matched.sort_by(|a, b| {
                    let ordering = compare_values(
                        a.get(field).unwrap_or(&Value::Null),
                        b.get(field).unwrap_or(&Value::Null),
                    );
                    if descending { ordering.reverse() } else { ordering }
                });
                let total = matched.len();
                let items = matched
                    .into_iter()
                    .skip(start_idx)
                    .take(per_page)
                    .map(|r| r.sanitized(&private))
                    .collect();
                (items, total)
            },
        };

        Ok(ListResult {
            items,
            page,
            per_page,
            total_items,
            total_pages: total_items.div_ceil(per_page),
        })
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Cache-first fetch for list candidates. Does not fill the cache —
    /// list scans would churn the LRU.
    fn fetch_for_list(&self, collection: &str, id: &str) -> Result<Option<Arc<Record>>> {
        let key = record_key(collection, id);
        if let Some(hit) = self.cache.get(&key) {
            return Ok(Some(hit));
        }
        match self.kv.get(Keyspace::Main, &key).map_err(PlinthError::substrate)? {
            Some(bytes) => Ok(Some(Arc::new(
                Record::from_bytes(&bytes).map_err(PlinthError::serialization)?,
            ))),
            None => Ok(None),
        }
    }

    async fn require_raw(&self, collection: &str, id: &str) -> Result<Arc<Record>> {
        self.get_raw(collection, id).await?.ok_or_else(|| PlinthError::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        })
    }

    fn check_version(
        &self,
        collection: &str,
        id: &str,
        current: &Record,
        expected: Option<i64>,
    ) -> Result<()> {
        if let Some(expected) = expected
            && expected != current.version()
        {
            return Err(PlinthError::VersionConflict {
                collection: collection.to_string(),
                id: id.to_string(),
                expected,
                actual: current.version(),
            });
        }
        Ok(())
    }

    fn schema_for(&self, collection: &str) -> Result<Arc<Schema>> {
        match self.schemas.get(collection)? {
            Some(schema) => Ok(schema),
            // Schema-less collections are permissive; system fields are
            // still engine-managed.
            None => Ok(Arc::new(Schema::new(Vec::new()))),
        }
    }

    fn sanitize(&self, collection: &str, record: &Record) -> Result<Record> {
        let schema = self.schema_for(collection)?;
        Ok(record.sanitized(&schema.private_field_names()))
    }

    /// Fire-and-forget publish after the commit callback. The sink
    /// contract is non-blocking fan-out (bounded try-send per
    /// subscriber), so the write's return path never waits on a slow
    /// observer, and per-sink ordering follows call order.
    fn emit(&self, collection: &str, action: ChangeAction, data: Record) {
        self.sink.publish(ChangeEvent { collection: collection.to_string(), action, data });
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").field("config", &self.config).finish_non_exhaustive()
    }
}

/// Total order over primitive JSON values for list sorting: numbers
/// numerically, strings lexicographically, mixed types by type rank.
fn compare_values(a: &Value, b: &Value) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            x.as_f64().partial_cmp(&y.as_f64()).unwrap_or(Ordering::Equal)
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Sink that discards events; for tests and tooling.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl ChangeSink for NoopSink {
    fn publish(&self, _event: ChangeEvent) {}
}

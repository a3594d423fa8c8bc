//! Schema registry over the `meta` keyspace.
//!
//! Schemas persist as JSON under `schema:{collection}` and are served
//! from an in-process map; the registry is read-mostly and schema writes
//! are rare. The two auth collection names auto-materialize a schema on
//! first access so that login works on a fresh database.

use std::sync::Arc;

use dashmap::DashMap;
use plinth_storage::{BatchOp, Keyspace, Substrate};
use plinth_types::{PlinthError, Record, Result, Schema, validate_collection_name};
use tracing::info;

use crate::keys::schema_key;

/// Collections that auto-materialize an auth schema on first access.
pub const AUTH_COLLECTIONS: [&str; 2] = ["users", "_superusers"];

/// Per-collection schema store with payload validation.
pub struct SchemaRegistry {
    kv: Arc<Substrate>,
    cache: DashMap<String, Arc<Schema>>,
}

impl SchemaRegistry {
    /// Creates a registry over the given substrate.
    pub fn new(kv: Arc<Substrate>) -> Self {
        Self { kv, cache: DashMap::new() }
    }

    /// Returns the schema for `collection`, if one exists.
    ///
    /// Auth collections are materialized (and persisted) on first
    /// access.
    ///
    /// # Errors
    ///
    /// Propagates substrate faults and schema decode failures.
    pub fn get(&self, collection: &str) -> Result<Option<Arc<Schema>>> {
        if let Some(cached) = self.cache.get(collection) {
            return Ok(Some(Arc::clone(cached.value())));
        }

        let stored = self
            .kv
            .get(Keyspace::Meta, &schema_key(collection))
            .map_err(PlinthError::substrate)?;

        if let Some(bytes) = stored {
            let schema: Schema =
                serde_json::from_slice(&bytes).map_err(PlinthError::serialization)?;
            let schema = Arc::new(schema);
            self.cache.insert(collection.to_string(), Arc::clone(&schema));
            return Ok(Some(schema));
        }

        if AUTH_COLLECTIONS.contains(&collection) {
            info!(collection, "materializing auth collection schema");
            return self.put(collection, Schema::auth()).map(Some);
        }

        Ok(None)
    }

    /// Stores a schema for `collection`, filling in the system fields,
    /// and returns the normalized result.
    ///
    /// The write goes directly to the substrate (one atomic batch); the
    /// substrate serializes it against the flush worker's commits.
    ///
    /// # Errors
    ///
    /// Rejects invalid collection names and propagates substrate faults.
    pub fn put(&self, collection: &str, mut schema: Schema) -> Result<Arc<Schema>> {
        if let Err(issue) = validate_collection_name(collection) {
            return Err(PlinthError::Validation {
                collection: collection.to_string(),
                issues: vec![issue],
            });
        }
        schema.fill_system_fields();

        let bytes = serde_json::to_vec(&schema).map_err(PlinthError::serialization)?;
        self.kv
            .batch(&[BatchOp::put(Keyspace::Meta, schema_key(collection), bytes)])
            .map_err(PlinthError::substrate)?;

        let schema = Arc::new(schema);
        self.cache.insert(collection.to_string(), Arc::clone(&schema));
        Ok(schema)
    }

    /// Validates a record payload against the collection's schema. A
    /// collection without a stored schema accepts any object (system
    /// fields are still engine-managed).
    ///
    /// # Errors
    ///
    /// Returns [`PlinthError::Validation`] with every issue found.
    pub fn validate(&self, collection: &str, record: &Record) -> Result<()> {
        let Some(schema) = self.get(collection)? else {
            return Ok(());
        };
        schema.validate(record).map_err(|issues| PlinthError::Validation {
            collection: collection.to_string(),
            issues,
        })
    }

    /// Lists every stored schema, for the admin surface.
    ///
    /// # Errors
    ///
    /// Propagates substrate faults and schema decode failures.
    pub fn list(&self) -> Result<Vec<(String, Arc<Schema>)>> {
        let (start, end) = crate::keys::prefix_range("schema:");
        let rows = self
            .kv
            .range(Keyspace::Meta, &start, &end, None)
            .map_err(PlinthError::substrate)?;

        let mut out = Vec::with_capacity(rows.len());
        for (key, bytes) in rows {
            let collection = key.trim_start_matches("schema:").to_string();
            let schema: Schema =
                serde_json::from_slice(&bytes).map_err(PlinthError::serialization)?;
            out.push((collection, Arc::new(schema)));
        }
        Ok(out)
    }
}

impl std::fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaRegistry").field("cached", &self.cache.len()).finish()
    }
}

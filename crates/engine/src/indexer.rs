//! Secondary and uniqueness index maintenance.
//!
//! [`diff`] computes the batch ops that transition a record's index
//! entries from `old` to `new`; the engine commits them atomically with
//! the primary row, which is what keeps invariant and index in lockstep.
//!
//! [`UniquenessGuard`] answers "may this record claim these unique
//! values?". It checks the persisted `uniq:` keys and an in-memory table
//! of claims whose commits are still in flight, so two concurrent
//! creates with the same unique value cannot both pass the check between
//! read and commit. A claim is held until its write completes (either
//! way) and releases on drop.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use plinth_storage::{BatchOp, Keyspace, Substrate};
use plinth_types::{PlinthError, Record, Result, Schema};
use serde_json::Value;

use crate::keys::{index_key, unique_key};

/// Computes the index batch ops for a record transition.
///
/// For each `indexed` field whose old and new values differ, emits a
/// delete of the old index entry and a put of the new one; `unique`
/// fields get the same treatment on their `uniq:` key. A `None` old or
/// new record means create or delete respectively. Null values carry no
/// index entry.
pub fn diff(
    collection: &str,
    id: &str,
    new: Option<&Record>,
    old: Option<&Record>,
    schema: &Schema,
) -> Vec<BatchOp> {
    let mut ops = Vec::new();

    for field in schema.fields.iter().filter(|f| f.indexed || f.unique) {
        let old_value = old.and_then(|r| r.get(&field.name)).filter(|v| !v.is_null());
        let new_value = new.and_then(|r| r.get(&field.name)).filter(|v| !v.is_null());

        if old_value == new_value {
            continue;
        }

        if let Some(value) = old_value {
            if field.indexed {
                ops.push(BatchOp::delete(
                    Keyspace::Indexes,
                    index_key(collection, &field.name, value, id),
                ));
            }
            if field.unique {
                ops.push(BatchOp::delete(
                    Keyspace::Indexes,
                    unique_key(collection, &field.name, value),
                ));
            }
        }

        if let Some(value) = new_value {
            if field.indexed {
                ops.push(BatchOp::put(
                    Keyspace::Indexes,
                    index_key(collection, &field.name, value, id),
                    id.as_bytes().to_vec(),
                ));
            }
            if field.unique {
                ops.push(BatchOp::put(
                    Keyspace::Indexes,
                    unique_key(collection, &field.name, value),
                    id.as_bytes().to_vec(),
                ));
            }
        }
    }

    ops
}

/// In-flight uniqueness claims, shared by all writers of an engine.
#[derive(Default)]
pub struct UniquenessGuard {
    pending: Arc<Mutex<HashMap<String, String>>>,
}

/// A successful claim on a set of uniqueness keys; releases on drop.
///
/// Held across the write buffer await so a concurrent writer observing
/// neither the committed `uniq:` row nor the claim is impossible.
#[derive(Debug)]
pub struct UniqClaim {
    pending: Arc<Mutex<HashMap<String, String>>>,
    keys: Vec<String>,
}

impl Drop for UniqClaim {
    fn drop(&mut self) {
        let mut pending = self.pending.lock();
        for key in &self.keys {
            pending.remove(key);
        }
    }
}

impl UniquenessGuard {
    /// Creates an empty guard.
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks every `unique` field of `record` with a present value
    /// against the substrate and the in-flight claims, excluding
    /// `excluding_id` (the record being updated), and claims the keys.
    ///
    /// # Errors
    ///
    /// Returns [`PlinthError::Uniqueness`] naming the first colliding
    /// field; propagates substrate faults.
    pub fn claim(
        &self,
        kv: &Substrate,
        collection: &str,
        record: &Record,
        schema: &Schema,
        excluding_id: Option<&str>,
    ) -> Result<UniqClaim> {
        let record_id = record.id().unwrap_or_default().to_string();

        // Both the substrate lookup and the claim table are checked under
        // one lock: a racing writer either sees this claim, or has
        // already committed and is visible in the substrate. Claims are
        // released only after the claimant's write completes.
        let mut pending = self.pending.lock();

        let mut keys: Vec<String> = Vec::new();
        for field in schema.unique_fields() {
            let Some(value) = record.get(&field.name).filter(|v| !v.is_null()) else {
                continue;
            };
            let key = unique_key(collection, &field.name, value);

            let owner = kv
                .get(Keyspace::Indexes, &key)
                .map_err(PlinthError::substrate)?
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned());
            if let Some(owner) = owner
                && Some(owner.as_str()) != excluding_id
            {
                return Err(uniqueness_error(collection, &field.name));
            }
            if let Some(claimant) = pending.get(&key)
                && claimant != &record_id
            {
                return Err(uniqueness_error(collection, &field.name));
            }
            keys.push(key);
        }

        for key in &keys {
            pending.insert(key.clone(), record_id.clone());
        }
        Ok(UniqClaim { pending: Arc::clone(&self.pending), keys })
    }

    /// Number of keys currently claimed (for stats and tests).
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

fn uniqueness_error(collection: &str, field: &str) -> PlinthError {
    PlinthError::Uniqueness { collection: collection.to_string(), field: field.to_string() }
}

/// Checks uniqueness without claiming — used by read-only validation
/// paths (e.g. the login lookup resolving an email to a record id).
pub fn lookup_unique(
    kv: &Substrate,
    collection: &str,
    field: &str,
    value: &Value,
) -> Result<Option<String>> {
    let key = unique_key(collection, field, value);
    Ok(kv
        .get(Keyspace::Indexes, &key)
        .map_err(PlinthError::substrate)?
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use plinth_types::{FieldDef, FieldType};
    use serde_json::json;

    use super::*;

    fn posts_schema() -> Schema {
        Schema::new(vec![
            FieldDef::new("owner_id", FieldType::String).indexed(),
            FieldDef::new("slug", FieldType::String).unique(),
            FieldDef::new("views", FieldType::Number).indexed(),
        ])
    }

    fn record(value: serde_json::Value) -> Record {
        Record::from_value(value).unwrap()
    }

    fn keys_of(ops: &[BatchOp]) -> Vec<(bool, String)> {
        ops.iter()
            .map(|op| match op {
                BatchOp::Put { key, .. } => (true, key.clone()),
                BatchOp::Delete { key, .. } => (false, key.clone()),
            })
            .collect()
    }

    #[test]
    fn test_diff_create_emits_puts_only() {
        let schema = posts_schema();
        let new = record(json!({
            "id": "r1", "owner_id": "u1", "slug": "hello", "views": 3,
            "updated": "2026-01-01T00:00:00.000Z",
        }));
        let ops = diff("posts", "r1", Some(&new), None, &schema);
        let keys = keys_of(&ops);
        assert!(keys.contains(&(true, "idx:posts:owner_id:u1:r1".into())));
        assert!(keys.contains(&(true, "uniq:posts:slug:hello".into())));
        assert!(keys.contains(&(true, "idx:posts:views:00000000000000000003:r1".into())));
        // `updated` is always indexed via the system fields.
        assert!(keys.iter().any(|(put, k)| *put && k.starts_with("idx:posts:updated:")));
        assert!(keys.iter().all(|(put, _)| *put), "create has no deletes");
    }

    #[test]
    fn test_diff_delete_mirrors_create() {
        let schema = posts_schema();
        let old = record(json!({"id": "r1", "owner_id": "u1", "slug": "hello"}));
        let ops = diff("posts", "r1", None, Some(&old), &schema);
        let keys = keys_of(&ops);
        assert!(keys.contains(&(false, "idx:posts:owner_id:u1:r1".into())));
        assert!(keys.contains(&(false, "uniq:posts:slug:hello".into())));
        assert!(keys.iter().all(|(put, _)| !*put), "delete has no puts");
    }

    #[test]
    fn test_diff_update_only_touches_changed_fields() {
        let schema = posts_schema();
        let old = record(json!({"id": "r1", "owner_id": "u1", "slug": "same", "views": 1}));
        let new = record(json!({"id": "r1", "owner_id": "u2", "slug": "same", "views": 1}));
        let ops = diff("posts", "r1", Some(&new), Some(&old), &schema);
        let keys = keys_of(&ops);
        assert_eq!(
            keys,
            vec![
                (false, "idx:posts:owner_id:u1:r1".into()),
                (true, "idx:posts:owner_id:u2:r1".into()),
            ]
        );
    }

    #[test]
    fn test_diff_null_means_absent() {
        let schema = posts_schema();
        let old = record(json!({"id": "r1", "owner_id": "u1"}));
        let new = record(json!({"id": "r1", "owner_id": null}));
        let ops = diff("posts", "r1", Some(&new), Some(&old), &schema);
        assert_eq!(keys_of(&ops), vec![(false, "idx:posts:owner_id:u1:r1".into())]);
    }

    #[test]
    fn test_claim_detects_committed_owner() {
        let kv = Substrate::in_memory().unwrap();
        kv.batch(&[BatchOp::put(
            Keyspace::Indexes,
            "uniq:posts:slug:hello",
            b"other".to_vec(),
        )])
        .unwrap();

        let guard = UniquenessGuard::new();
        let schema = posts_schema();
        let rec = record(json!({"id": "r1", "slug": "hello"}));
        let err = guard.claim(&kv, "posts", &rec, &schema, None).unwrap_err();
        assert!(matches!(err, PlinthError::Uniqueness { ref field, .. } if field == "slug"));

        // The record that owns the value may keep it.
        let own = record(json!({"id": "other", "slug": "hello"}));
        assert!(guard.claim(&kv, "posts", &own, &schema, Some("other")).is_ok());
    }

    #[test]
    fn test_claim_blocks_concurrent_claimant_until_release() {
        let kv = Substrate::in_memory().unwrap();
        let guard = UniquenessGuard::new();
        let schema = posts_schema();

        let first = record(json!({"id": "r1", "slug": "hello"}));
        let claim = guard.claim(&kv, "posts", &first, &schema, None).unwrap();
        assert_eq!(guard.pending_len(), 1);

        let second = record(json!({"id": "r2", "slug": "hello"}));
        let err = guard.claim(&kv, "posts", &second, &schema, None).unwrap_err();
        assert!(matches!(err, PlinthError::Uniqueness { .. }));

        drop(claim);
        assert_eq!(guard.pending_len(), 0);
        // Released (e.g. the first write failed): the value is free again.
        assert!(guard.claim(&kv, "posts", &second, &schema, None).is_ok());
    }

    #[test]
    fn test_lookup_unique() {
        let kv = Substrate::in_memory().unwrap();
        kv.batch(&[BatchOp::put(Keyspace::Indexes, "uniq:users:email:x@y", b"u9".to_vec())])
            .unwrap();
        assert_eq!(
            lookup_unique(&kv, "users", "email", &json!("x@y")).unwrap(),
            Some("u9".to_string())
        );
        assert_eq!(lookup_unique(&kv, "users", "email", &json!("a@b")).unwrap(), None);
    }
}

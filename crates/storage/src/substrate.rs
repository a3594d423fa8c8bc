//! The KV substrate: point reads, prefix scans, atomic batches.
//!
//! One redb database holds the three keyspaces as tables. A batch maps
//! to a single redb write transaction that opens whichever tables the
//! ops touch and commits once, giving all-or-nothing semantics across
//! primary rows, index entries, and schema rows.
//!
//! Durability is a process-wide knob: the default `GroupCommit` mode
//! commits without waiting for fsync (redb's eventual durability), which
//! trades a bounded window of durability for write throughput. This is a
//! deliberate mode, not an omission; `FsyncPerCommit` restores a full
//! fsync per batch.

use std::path::Path;

use redb::{Database, Durability, TableDefinition};
use snafu::{ResultExt, Snafu};

use crate::tables::Tables;

/// Named keyspace within the substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Keyspace {
    /// Primary record rows.
    Main,
    /// Secondary and uniqueness index entries.
    Indexes,
    /// Schema registry rows.
    Meta,
}

impl Keyspace {
    fn table(self) -> TableDefinition<'static, &'static [u8], &'static [u8]> {
        match self {
            Keyspace::Main => Tables::MAIN,
            Keyspace::Indexes => Tables::INDEXES,
            Keyspace::Meta => Tables::META,
        }
    }

    /// Static label for logging.
    pub fn as_str(self) -> &'static str {
        match self {
            Keyspace::Main => "main",
            Keyspace::Indexes => "indexes",
            Keyspace::Meta => "meta",
        }
    }
}

/// One entry of an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Insert or overwrite `key` with `value`.
    Put {
        /// Target keyspace.
        keyspace: Keyspace,
        /// Key bytes (UTF-8 from the key codec).
        key: String,
        /// Value bytes.
        value: Vec<u8>,
    },
    /// Remove `key` if present.
    Delete {
        /// Target keyspace.
        keyspace: Keyspace,
        /// Key bytes (UTF-8 from the key codec).
        key: String,
    },
}

impl BatchOp {
    /// Convenience constructor for a put.
    pub fn put(keyspace: Keyspace, key: impl Into<String>, value: Vec<u8>) -> Self {
        BatchOp::Put { keyspace, key: key.into(), value }
    }

    /// Convenience constructor for a delete.
    pub fn delete(keyspace: Keyspace, key: impl Into<String>) -> Self {
        BatchOp::Delete { keyspace, key: key.into() }
    }
}

/// Commit durability for write batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DurabilityMode {
    /// Commit without waiting for fsync (bounded durability window).
    #[default]
    GroupCommit,
    /// Full fsync on every batch commit.
    FsyncPerCommit,
}

impl DurabilityMode {
    fn to_redb(self) -> Durability {
        match self {
            DurabilityMode::GroupCommit => Durability::Eventual,
            DurabilityMode::FsyncPerCommit => Durability::Immediate,
        }
    }
}

/// Substrate configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubstrateConfig {
    /// Commit durability for write batches.
    pub durability: DurabilityMode,
}

/// Storage-layer errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StorageError {
    /// Database open/create failed.
    #[snafu(display("Failed to open database at {path}: {source}"))]
    Open {
        /// Database path.
        path: String,
        /// Underlying redb error.
        source: redb::DatabaseError,
    },

    /// Beginning a transaction failed.
    #[snafu(display("Transaction error: {source}"))]
    Transaction {
        /// Underlying redb error.
        source: redb::TransactionError,
    },

    /// Opening a table failed.
    #[snafu(display("Table error: {source}"))]
    Table {
        /// Underlying redb error.
        source: redb::TableError,
    },

    /// A read, write, or scan failed.
    #[snafu(display("Storage error: {source}"))]
    Storage {
        /// Underlying redb error.
        source: redb::StorageError,
    },

    /// Committing a write transaction failed.
    #[snafu(display("Commit error: {source}"))]
    Commit {
        /// Underlying redb error.
        source: redb::CommitError,
    },
}

/// The embedded ordered KV store consumed by the engine.
///
/// Cheap to share behind an `Arc`; reads may run concurrently with the
/// single committing writer (redb gives snapshot-isolated readers).
pub struct Substrate {
    db: Database,
    durability: Durability,
}

impl Substrate {
    /// Opens (or creates) a database file at `path` with the default
    /// configuration.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if the file cannot be created or
    /// opened, and propagates the table-creation transaction errors.
    pub fn open(path: impl AsRef<Path>) -> crate::Result<Self> {
        Self::open_with(path, SubstrateConfig::default())
    }

    /// Opens (or creates) a database file at `path`.
    ///
    /// All three keyspace tables are created eagerly so that readers
    /// never observe a missing table.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if the file cannot be created or
    /// opened, and propagates the table-creation transaction errors.
    pub fn open_with(path: impl AsRef<Path>, config: SubstrateConfig) -> crate::Result<Self> {
        let path = path.as_ref();
        let db = Database::create(path)
            .context(OpenSnafu { path: path.display().to_string() })?;
        Self::init(db, config)
    }

    /// Creates an in-memory substrate for tests.
    ///
    /// # Errors
    ///
    /// Propagates redb backend creation errors.
    pub fn in_memory() -> crate::Result<Self> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .context(OpenSnafu { path: ":memory:".to_string() })?;
        Self::init(db, SubstrateConfig::default())
    }

    fn init(db: Database, config: SubstrateConfig) -> crate::Result<Self> {
        let txn = db.begin_write().context(TransactionSnafu)?;
        for keyspace in [Keyspace::Main, Keyspace::Indexes, Keyspace::Meta] {
            txn.open_table(keyspace.table()).context(TableSnafu)?;
        }
        txn.commit().context(CommitSnafu)?;
        Ok(Self { db, durability: config.durability.to_redb() })
    }

    /// Point read.
    ///
    /// # Errors
    ///
    /// Propagates substrate read faults; an absent key is `Ok(None)`.
    pub fn get(&self, keyspace: Keyspace, key: &str) -> crate::Result<Option<Vec<u8>>> {
        let txn = self.db.begin_read().context(TransactionSnafu)?;
        let table = txn.open_table(keyspace.table()).context(TableSnafu)?;
        let value = table.get(key.as_bytes()).context(StorageSnafu)?;
        Ok(value.map(|guard| guard.value().to_vec()))
    }

    /// Lexicographic range scan over `[start, end)`, optionally bounded
    /// by `limit`. Returns `(key, value)` pairs in key order; keys are
    /// returned as UTF-8 strings (the codec only ever writes UTF-8).
    ///
    /// # Errors
    ///
    /// Propagates substrate read faults.
    pub fn range(
        &self,
        keyspace: Keyspace,
        start: &[u8],
        end: &[u8],
        limit: Option<usize>,
    ) -> crate::Result<Vec<(String, Vec<u8>)>> {
        let txn = self.db.begin_read().context(TransactionSnafu)?;
        let table = txn.open_table(keyspace.table()).context(TableSnafu)?;
        let mut out = Vec::new();
        let max = limit.unwrap_or(usize::MAX);
        for entry in table.range::<&[u8]>(start..end).context(StorageSnafu)? {
            if out.len() >= max {
                break;
            }
            let (key, value) = entry.context(StorageSnafu)?;
            out.push((
                String::from_utf8_lossy(key.value()).into_owned(),
                value.value().to_vec(),
            ));
        }
        Ok(out)
    }

    /// Applies `ops` in order inside one write transaction.
    ///
    /// The whole batch commits atomically across keyspaces, or not at
    /// all. This call blocks on redb's single-writer lock; the engine
    /// funnels all writes through one flush worker, so in practice there
    /// is no lock contention.
    ///
    /// # Errors
    ///
    /// Propagates transaction, table, write, and commit faults. On any
    /// error before commit the transaction is dropped and nothing is
    /// applied.
    pub fn batch(&self, ops: &[BatchOp]) -> crate::Result<()> {
        let mut txn = self.db.begin_write().context(TransactionSnafu)?;
        txn.set_durability(self.durability);
        {
            let mut main = txn.open_table(Tables::MAIN).context(TableSnafu)?;
            let mut indexes = txn.open_table(Tables::INDEXES).context(TableSnafu)?;
            let mut meta = txn.open_table(Tables::META).context(TableSnafu)?;
            for op in ops {
                match op {
                    BatchOp::Put { keyspace, key, value } => {
                        let table = match keyspace {
                            Keyspace::Main => &mut main,
                            Keyspace::Indexes => &mut indexes,
                            Keyspace::Meta => &mut meta,
                        };
                        table
                            .insert(key.as_bytes(), value.as_slice())
                            .context(StorageSnafu)?;
                    },
                    BatchOp::Delete { keyspace, key } => {
                        let table = match keyspace {
                            Keyspace::Main => &mut main,
                            Keyspace::Indexes => &mut indexes,
                            Keyspace::Meta => &mut meta,
                        };
                        table.remove(key.as_bytes()).context(StorageSnafu)?;
                    },
                }
            }
        }
        txn.commit().context(CommitSnafu)?;
        Ok(())
    }
}

impl std::fmt::Debug for Substrate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Substrate").field("durability", &self.durability).finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn put(keyspace: Keyspace, key: &str, value: &str) -> BatchOp {
        BatchOp::put(keyspace, key, value.as_bytes().to_vec())
    }

    #[test]
    fn test_get_absent() {
        let kv = Substrate::in_memory().unwrap();
        assert_eq!(kv.get(Keyspace::Main, "posts:missing").unwrap(), None);
    }

    #[test]
    fn test_batch_then_get() {
        let kv = Substrate::in_memory().unwrap();
        kv.batch(&[
            put(Keyspace::Main, "posts:a", "{\"id\":\"a\"}"),
            put(Keyspace::Indexes, "uniq:posts:slug:x", "a"),
            put(Keyspace::Meta, "schema:posts", "{}"),
        ])
        .unwrap();

        assert_eq!(kv.get(Keyspace::Main, "posts:a").unwrap(), Some(b"{\"id\":\"a\"}".to_vec()));
        assert_eq!(kv.get(Keyspace::Indexes, "uniq:posts:slug:x").unwrap(), Some(b"a".to_vec()));
        // Keyspaces are disjoint.
        assert_eq!(kv.get(Keyspace::Main, "uniq:posts:slug:x").unwrap(), None);
    }

    #[test]
    fn test_batch_delete() {
        let kv = Substrate::in_memory().unwrap();
        kv.batch(&[put(Keyspace::Main, "posts:a", "1")]).unwrap();
        kv.batch(&[
            BatchOp::delete(Keyspace::Main, "posts:a"),
            // Deleting an absent key is not an error.
            BatchOp::delete(Keyspace::Main, "posts:never"),
        ])
        .unwrap();
        assert_eq!(kv.get(Keyspace::Main, "posts:a").unwrap(), None);
    }

    #[test]
    fn test_range_is_ordered_and_bounded() {
        let kv = Substrate::in_memory().unwrap();
        kv.batch(&[
            put(Keyspace::Main, "posts:b", "2"),
            put(Keyspace::Main, "posts:a", "1"),
            put(Keyspace::Main, "posts:c", "3"),
            put(Keyspace::Main, "users:z", "9"),
        ])
        .unwrap();

        let mut end = b"posts:".to_vec();
        end.push(0xFF);
        let all = kv.range(Keyspace::Main, b"posts:", &end, None).unwrap();
        let keys: Vec<_> = all.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["posts:a", "posts:b", "posts:c"]);

        let capped = kv.range(Keyspace::Main, b"posts:", &end, Some(2)).unwrap();
        assert_eq!(capped.len(), 2);
    }

    #[test]
    fn test_batch_overwrites_in_order() {
        let kv = Substrate::in_memory().unwrap();
        kv.batch(&[
            put(Keyspace::Main, "posts:a", "old"),
            put(Keyspace::Main, "posts:a", "new"),
        ])
        .unwrap();
        assert_eq!(kv.get(Keyspace::Main, "posts:a").unwrap(), Some(b"new".to_vec()));
    }

    #[test]
    fn test_on_disk_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plinth.redb");
        {
            let kv = Substrate::open(&path).unwrap();
            kv.batch(&[put(Keyspace::Main, "posts:a", "1")]).unwrap();
        }
        let kv = Substrate::open(&path).unwrap();
        assert_eq!(kv.get(Keyspace::Main, "posts:a").unwrap(), Some(b"1".to_vec()));
    }
}

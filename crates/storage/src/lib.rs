//! Embedded ordered KV substrate for Plinth, backed by redb.
//!
//! This crate provides the one storage interface the engine consumes:
//! three named keyspaces (`main` for primary rows, `indexes` for
//! secondary and uniqueness entries, `meta` for schemas) with
//!
//! - point reads (`get`),
//! - lexicographic prefix range scans (`range`),
//! - atomic multi-key batches spanning all keyspaces (`batch`).
//!
//! Atomicity across a batch is the contract the engine's index coherence
//! rests on: a record's primary row and its index entries commit together
//! or not at all.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod substrate;
mod tables;

pub use substrate::{
    BatchOp, DurabilityMode, Keyspace, StorageError, Substrate, SubstrateConfig,
};
pub use tables::Tables;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

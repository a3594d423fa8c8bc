//! The Plinth storage engine and concurrency substrate.
//!
//! This crate sits between the raw KV substrate (`plinth-storage`) and
//! the HTTP glue (`plinth-server`), providing:
//!
//! - The CRUD engine over named record collections, with optimistic
//!   concurrency (`_version`) and internal conflict retry
//! - Secondary and uniqueness index maintenance, committed atomically
//!   with the primary row
//! - The write coalescer: a group-commit buffer with a single serialized
//!   flush worker
//! - The read path: in-memory LRU cache with single-flight cache fill
//! - The schema registry with payload validation
//! - The change broadcaster feeding real-time subscribers

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod broadcast;
pub mod cache;
pub mod engine;
pub mod indexer;
pub mod keys;
pub mod schema;
pub mod singleflight;
pub mod stats;
pub mod write_buffer;

pub use broadcast::{
    Broadcaster, BroadcasterConfig, ChangeAction, ChangeEvent, ChangeSink, FeedMessage,
};
pub use cache::{CacheStats, RecordCache};
pub use engine::{Engine, EngineConfig, ListOptions, ListResult, NoopSink};
pub use schema::SchemaRegistry;
pub use singleflight::SingleFlight;
pub use stats::{EngineStats, EngineStatsSnapshot};
pub use write_buffer::{
    BufferStatsSnapshot, CommitMode, WriteBuffer, WriteBufferConfig, WriteBufferHandle,
    WriteIntent,
};

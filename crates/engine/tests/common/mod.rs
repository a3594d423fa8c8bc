//! Shared fixture: a fully wired engine over an in-memory substrate
//! with a fast-flushing write buffer.

// Each test binary compiles this module separately and uses a subset.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use plinth_engine::{
    Broadcaster, ChangeSink, Engine, EngineConfig, RecordCache, SchemaRegistry, WriteBuffer,
    WriteBufferConfig,
};
use plinth_storage::Substrate;
use plinth_types::{FieldDef, FieldType, Record, Schema};

pub struct TestEngine {
    pub engine: Arc<Engine>,
    pub kv: Arc<Substrate>,
    pub cache: Arc<RecordCache>,
    pub broadcaster: Arc<Broadcaster>,
    worker: tokio::task::JoinHandle<()>,
}

impl TestEngine {
    /// Engine with a 2 ms flush interval; must be built inside a tokio
    /// runtime.
    pub fn new() -> Self {
        Self::with_configs(
            WriteBufferConfig::builder()
                .flush_interval(Duration::from_millis(2))
                .tick_interval(Duration::from_millis(1))
                .build(),
            EngineConfig::default(),
        )
    }

    pub fn with_configs(buffer_config: WriteBufferConfig, engine_config: EngineConfig) -> Self {
        let kv = Arc::new(Substrate::in_memory().expect("in-memory substrate"));
        let cache = Arc::new(RecordCache::new(1000));
        let schemas = Arc::new(SchemaRegistry::new(Arc::clone(&kv)));
        let broadcaster = Arc::new(Broadcaster::default());

        let buffer = WriteBuffer::new(Arc::clone(&kv), Arc::clone(&cache), buffer_config);
        let handle = buffer.handle();
        let worker = tokio::spawn(buffer.run());

        let sink: Arc<dyn ChangeSink> = Arc::clone(&broadcaster) as Arc<dyn ChangeSink>;
        let engine = Arc::new(Engine::new(
            Arc::clone(&kv),
            Arc::clone(&cache),
            schemas,
            handle,
            sink,
            engine_config,
        ));

        Self { engine, kv, cache, broadcaster, worker }
    }

    /// Registers the `posts` schema used across the tests: required
    /// title, indexed owner_id and views, unique slug.
    pub fn with_posts_schema(self) -> Self {
        self.engine
            .schemas()
            .put(
                "posts",
                Schema::new(vec![
                    FieldDef::new("title", FieldType::String).required(),
                    FieldDef::new("owner_id", FieldType::String).indexed(),
                    FieldDef::new("views", FieldType::Number).indexed(),
                    FieldDef::new("slug", FieldType::String).unique(),
                ]),
            )
            .expect("posts schema");
        self
    }
}

impl Drop for TestEngine {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

pub fn record(value: serde_json::Value) -> Record {
    Record::from_value(value).expect("JSON object")
}

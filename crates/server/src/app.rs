//! Process wiring.
//!
//! Builds the collaborator graph explicitly — substrate → cache →
//! write buffer → engine → broadcaster → router — and hands the caller
//! the router plus the shared state. No hidden process-global state:
//! everything is constructed here and passed by reference.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use plinth_engine::{
    Broadcaster, ChangeSink, CommitMode, Engine, EngineConfig, RecordCache, SchemaRegistry,
    WriteBuffer, WriteBufferConfig,
};
use plinth_storage::Substrate;
use plinth_types::token;
use tracing::warn;

use crate::auth::TokenService;
use crate::config::Config;
use crate::rate_limit::RateLimiter;
use crate::routes::router;
use crate::state::AppState;

/// A wired application: the axum router and the state behind it.
pub struct App {
    /// The full REST surface.
    pub router: Router,
    /// Shared state (engine, buffer handle, broadcaster, ...).
    pub state: AppState,
}

/// Wires the engine and glue over an opened substrate and spawns the
/// background tasks (flush worker, heartbeat). Must run inside a tokio
/// runtime.
pub fn build_app(config: &Config, kv: Arc<Substrate>) -> App {
    let cache = Arc::new(RecordCache::new(config.max_cache_size));
    let schemas = Arc::new(SchemaRegistry::new(Arc::clone(&kv)));

    let buffer_config = WriteBufferConfig::builder()
        .flush_interval(Duration::from_millis(config.flush_interval_ms))
        .max_buffer_size(config.max_buffer_size)
        .mode(if config.optimistic_mode { CommitMode::Optimistic } else { CommitMode::Safe })
        .build();
    let buffer = WriteBuffer::new(Arc::clone(&kv), Arc::clone(&cache), buffer_config);
    let buffer_handle = buffer.handle();
    tokio::spawn(buffer.run());

    let broadcaster = Arc::new(Broadcaster::default());
    tokio::spawn(Arc::clone(&broadcaster).run_heartbeat());

    let engine = Arc::new(Engine::new(
        kv,
        cache,
        schemas,
        buffer_handle.clone(),
        Arc::clone(&broadcaster) as Arc<dyn ChangeSink>,
        EngineConfig::builder().max_scan_limit(config.max_scan_limit).build(),
    ));

    let secret = config.jwt_secret.clone().unwrap_or_else(|| {
        warn!("no JWT_SECRET configured; tokens will not survive a restart");
        token::new_token(48)
    });
    let tokens = Arc::new(TokenService::new(
        secret.into_bytes(),
        Duration::from_secs(config.jwt_expires_in_secs),
    ));
    let limiter =
        Arc::new(RateLimiter::new(config.rate_limit_per_client, config.rate_limit_global));

    let state = AppState {
        engine,
        broadcaster,
        buffer: buffer_handle,
        tokens,
        limiter,
        started_at: Instant::now(),
        max_batch_size: config.max_batch_size,
    };
    App { router: router(state.clone()), state }
}

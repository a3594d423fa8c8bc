//! Shared request state.

use std::sync::Arc;
use std::time::Instant;

use plinth_engine::{Broadcaster, Engine, WriteBufferHandle};

use crate::auth::TokenService;
use crate::rate_limit::RateLimiter;

/// State handed to every handler. Cheap to clone; everything inside is
/// shared.
#[derive(Clone)]
pub struct AppState {
    /// The CRUD engine.
    pub engine: Arc<Engine>,
    /// Realtime fan-out.
    pub broadcaster: Arc<Broadcaster>,
    /// Write buffer handle (stats and shutdown draining).
    pub buffer: WriteBufferHandle,
    /// Token issuance/verification.
    pub tokens: Arc<TokenService>,
    /// Write-surface rate limiter.
    pub limiter: Arc<RateLimiter>,
    /// Process start, for the uptime stat.
    pub started_at: Instant,
    /// Cap on `POST /api/batch` operations.
    pub max_batch_size: usize,
}

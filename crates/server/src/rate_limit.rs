//! Token-bucket rate limiting for the write surface.
//!
//! Two tiers of admission control:
//!
//! 1. **Per-client** — one bucket per authenticated record id (or
//!    `anonymous` for unauthenticated writes), created on demand.
//! 2. **Global** — one process-wide bucket so aggregate write pressure
//!    is bounded regardless of client count.
//!
//! The token bucket allows controlled bursts while holding an average
//! rate: each bucket has a capacity (burst) and a refill rate
//! (sustained throughput); tokens are consumed per request and refill
//! with elapsed time. Stale per-client buckets are pruned on the way.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;

/// Buckets idle longer than this are pruned.
const PRUNE_IDLE_SECS: u64 = 300;

/// Rejection details, surfaced as HTTP 429.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitRejection {
    /// Which bucket rejected: `client` or `global`.
    pub level: &'static str,
    /// Estimated milliseconds until a token is available.
    pub retry_after_ms: u64,
}

struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate_per_sec: u64) -> Self {
        let capacity = (rate_per_sec as f64).max(1.0);
        Self { tokens: capacity, capacity, refill_per_sec: capacity, last_refill: Instant::now() }
    }

    fn try_take(&mut self) -> Result<(), u64> {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - self.tokens;
            Err(((deficit / self.refill_per_sec) * 1000.0).ceil() as u64)
        }
    }
}

/// Two-tier write rate limiter.
pub struct RateLimiter {
    per_client_rate: u64,
    clients: Mutex<HashMap<String, (TokenBucket, Instant)>>,
    global: Mutex<TokenBucket>,
}

impl RateLimiter {
    /// Creates a limiter with per-client and global sustained rates
    /// (tokens per second; burst equals one second of rate).
    pub fn new(per_client_rate: u64, global_rate: u64) -> Self {
        Self {
            per_client_rate,
            clients: Mutex::new(HashMap::new()),
            global: Mutex::new(TokenBucket::new(global_rate)),
        }
    }

    /// Admits or rejects one write attributed to `client_key`.
    ///
    /// # Errors
    ///
    /// Returns the rejecting tier and a retry hint.
    pub fn check(&self, client_key: &str) -> Result<(), RateLimitRejection> {
        if let Err(retry_after_ms) = self.global.lock().try_take() {
            return Err(RateLimitRejection { level: "global", retry_after_ms });
        }

        let mut clients = self.clients.lock();
        let now = Instant::now();
        clients.retain(|_, (_, touched)| {
            now.duration_since(*touched).as_secs() < PRUNE_IDLE_SECS
        });

        let (bucket, touched) = clients
            .entry(client_key.to_string())
            .or_insert_with(|| (TokenBucket::new(self.per_client_rate), now));
        *touched = now;
        bucket
            .try_take()
            .map_err(|retry_after_ms| RateLimitRejection { level: "client", retry_after_ms })
    }

    /// Number of tracked client buckets.
    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }
}

//! Server configuration.
//!
//! Every knob is a CLI flag with an environment-variable fallback and a
//! documented default, so `plinth` runs with no arguments on a laptop
//! and is fully configurable in a container.

use std::path::PathBuf;

use clap::Parser;

/// Plinth server configuration.
#[derive(Debug, Clone, Parser)]
#[command(name = "plinth", version, about = "Compact backend-as-a-service")]
pub struct Config {
    /// Port to listen on.
    #[arg(long, env = "PORT", default_value_t = 8090)]
    pub port: u16,

    /// Address to bind.
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0")]
    pub bind_addr: String,

    /// Path of the embedded database file.
    #[arg(long, env = "DB_PATH", default_value = "./data/plinth.redb")]
    pub db_path: PathBuf,

    /// Record cache capacity (entries).
    #[arg(long, env = "MAX_CACHE_SIZE", default_value_t = 1000)]
    pub max_cache_size: usize,

    /// Primary-key scan guard for unindexed list queries.
    #[arg(long, env = "MAX_SCAN_LIMIT", default_value_t = 100)]
    pub max_scan_limit: usize,

    /// Maximum operations accepted by `POST /api/batch`.
    #[arg(long, env = "MAX_BATCH_SIZE", default_value_t = 100)]
    pub max_batch_size: usize,

    /// Write coalescing window in milliseconds.
    #[arg(long, env = "FLUSH_INTERVAL", default_value_t = 25)]
    pub flush_interval_ms: u64,

    /// Ingress size that triggers an immediate flush.
    #[arg(long, env = "MAX_BUFFER_SIZE", default_value_t = 500)]
    pub max_buffer_size: usize,

    /// Complete writes at enqueue instead of after commit.
    #[arg(long, env = "OPTIMISTIC_MODE", default_value_t = false)]
    pub optimistic_mode: bool,

    /// Secret for signing auth tokens. A random per-boot secret is
    /// generated when unset (tokens then expire on restart).
    #[arg(long, env = "JWT_SECRET")]
    pub jwt_secret: Option<String>,

    /// Auth token lifetime in seconds.
    #[arg(long, env = "JWT_EXPIRES_IN", default_value_t = 86_400)]
    pub jwt_expires_in_secs: u64,

    /// Email for the seeded superuser on first boot.
    #[arg(long, env = "ADMIN_EMAIL", default_value = "admin@plinth.local")]
    pub admin_email: String,

    /// Password for the seeded superuser; random (logged once) if unset.
    #[arg(long, env = "ADMIN_PASSWORD")]
    pub admin_password: Option<String>,

    /// Sustained writes per second allowed per client.
    #[arg(long, env = "RATE_LIMIT_PER_CLIENT", default_value_t = 50)]
    pub rate_limit_per_client: u64,

    /// Sustained writes per second allowed process-wide.
    #[arg(long, env = "RATE_LIMIT_GLOBAL", default_value_t = 500)]
    pub rate_limit_global: u64,
}

impl Config {
    /// A configuration suitable for tests: in-memory-ish paths and fast
    /// flushing. The database path still needs to be set by the caller.
    pub fn for_tests() -> Self {
        Self {
            port: 0,
            bind_addr: "127.0.0.1".to_string(),
            db_path: PathBuf::from(":memory:"),
            max_cache_size: 1000,
            max_scan_limit: 100,
            max_batch_size: 100,
            flush_interval_ms: 2,
            max_buffer_size: 500,
            optimistic_mode: false,
            jwt_secret: Some("test-secret".to_string()),
            jwt_expires_in_secs: 3600,
            admin_email: "admin@plinth.local".to_string(),
            admin_password: Some("admin-password".to_string()),
            rate_limit_per_client: 1_000_000,
            rate_limit_global: 1_000_000,
        }
    }
}

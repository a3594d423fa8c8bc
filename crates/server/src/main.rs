//! Plinth server binary.
//!
//! # Usage
//!
//! ```bash
//! # Run with defaults (port 8090, ./data/plinth.redb)
//! plinth
//!
//! # Configure through the environment
//! PORT=9000 DB_PATH=/var/lib/plinth/data.redb JWT_SECRET=... plinth
//! ```

use std::sync::Arc;

use clap::Parser;
use plinth_server::{Config, bootstrap, build_app, shutdown};
use plinth_storage::Substrate;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Some(parent) = config.db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let kv = Arc::new(Substrate::open(&config.db_path)?);

    let app = build_app(&config, kv);
    bootstrap::seed_admin(&app.state.engine, &config).await?;

    let addr = format!("{}:{}", config.bind_addr, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, db = %config.db_path.display(), "plinth listening");

    axum::serve(listener, app.router)
        .with_graceful_shutdown(shutdown::shutdown_signal())
        .await?;

    info!("http server stopped; draining write buffer");
    app.state.buffer.shutdown().await;
    info!("shutdown complete");
    Ok(())
}

//! Route table.

use axum::Router;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

use crate::state::AppState;
use crate::{handlers, realtime};

/// Builds the full REST surface over the given state.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/stats", get(handlers::stats))
        .route("/api/stats/buffer", get(handlers::buffer_stats))
        .route("/api/auth/login", post(handlers::login))
        .route("/api/batch", post(handlers::batch))
        .route("/api/realtime", get(realtime::subscribe))
        .route(
            "/api/collections/:collection/records",
            get(handlers::list_records).post(handlers::create_record),
        )
        .route(
            "/api/collections/:collection/records/:id",
            get(handlers::get_record)
                .patch(handlers::update_record)
                .delete(handlers::delete_record),
        )
        .route("/api/schemas", get(handlers::list_schemas))
        .route(
            "/api/schemas/:collection",
            get(handlers::get_schema).put(handlers::put_schema),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

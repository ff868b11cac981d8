use axum::{
    middleware as axum_mw,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::handlers;
use crate::metrics::stream;
use crate::middleware::timing;
use crate::AppState;

/// Builds the admin `Router`: counts, flush control, verbosity, stats and
/// the load generator.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // ── Stored counts ───────────────────────────────────────
        .route("/api/counts/:group", get(handlers::counts::get_counts))
        .route("/api/pending", get(handlers::counts::get_pending))
        // ── Flush / verbosity control ───────────────────────────
        .route("/api/flush", post(handlers::control::flush_now))
        .route(
            "/api/verbosity",
            get(handlers::control::get_verbosity).put(handlers::control::set_verbosity),
        )
        // ── Load generator ──────────────────────────────────────
        .route("/api/loadgen/start", post(handlers::loadgen::start_loadgen))
        .route("/api/loadgen/stop", post(handlers::loadgen::stop_loadgen))
        .route("/api/loadgen/status", get(handlers::loadgen::loadgen_status))
        // ── Self stats ──────────────────────────────────────────
        .route("/api/stats", get(stream::get_stats))
        .route("/api/stats/stream", get(stream::stats_stream))
        .with_state(state)
        // ── Global middleware (applied bottom-up) ───────────────
        .layer(axum_mw::from_fn(timing::timing_middleware))
        .layer(CorsLayer::permissive())
}

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::aggregator::FlushReport;
use crate::AppState;

use super::AppError;

/// Highest level with extra output; anything above is rejected.
const MAX_VERBOSITY: u8 = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verbosity {
    pub level: u8,
}

// ─── POST /api/flush ─────────────────────────────────────────────

pub async fn flush_now(State(state): State<Arc<AppState>>) -> Result<Json<FlushReport>, AppError> {
    let report = state.aggregator.flush().await?;
    tracing::info!(increments = report.increments, resent = report.resent, "manual flush");
    Ok(Json(report))
}

// ─── GET/PUT /api/verbosity ──────────────────────────────────────

pub async fn get_verbosity(State(state): State<Arc<AppState>>) -> Json<Verbosity> {
    Json(Verbosity {
        level: state.aggregator.verbosity(),
    })
}

pub async fn set_verbosity(
    State(state): State<Arc<AppState>>,
    Json(req): Json<Verbosity>,
) -> Result<Json<Verbosity>, AppError> {
    if req.level > MAX_VERBOSITY {
        return Err(AppError::BadRequest(format!(
            "level must be between 0 and {MAX_VERBOSITY}"
        )));
    }
    state.aggregator.set_verbosity(req.level);
    Ok(Json(req))
}

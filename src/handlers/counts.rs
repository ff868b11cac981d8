use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;
use std::sync::Arc;

use crate::AppState;

use super::AppError;

#[derive(Debug, Clone, Serialize)]
pub struct MemberCount {
    pub member: String,
    pub count: f64,
}

#[derive(Debug, Serialize)]
pub struct GroupCounts {
    pub group: String,
    pub backend: &'static str,
    pub counts: Vec<MemberCount>,
}

#[derive(Debug, Serialize)]
pub struct PendingCounts {
    pub keys: usize,
    /// Increments of an unconfirmed batch waiting to be resent
    pub in_doubt: usize,
    pub counters: Vec<(String, f64)>,
}

// ─── GET /api/counts/:group ──────────────────────────────────────

/// Counts already committed to the backend, in the backend's order.
pub async fn get_counts(
    State(state): State<Arc<AppState>>,
    Path(group): Path<String>,
) -> Result<Json<GroupCounts>, AppError> {
    let backend = state.aggregator.backend();
    let counts = backend
        .retrieve_counts(&group)
        .await?
        .into_iter()
        .map(|(member, count)| MemberCount { member, count })
        .collect();

    Ok(Json(GroupCounts {
        group,
        backend: backend.name(),
        counts,
    }))
}

// ─── GET /api/pending ────────────────────────────────────────────

/// Raw keys accumulated since the last flush, plus any batch in doubt.
pub async fn get_pending(State(state): State<Arc<AppState>>) -> Json<PendingCounts> {
    let counters = state.aggregator.snapshot();
    Json(PendingCounts {
        keys: counters.len(),
        in_doubt: state.aggregator.in_doubt(),
        counters,
    })
}

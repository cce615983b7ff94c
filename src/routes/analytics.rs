//! Dashboard analytics routes.

use axum::extract::{Query, State};
use axum::response::Json;
use serde::Deserialize;

use crate::error::ApiError;
use crate::services::analytics::{self, LeaderboardEntry, SectorQueue, Summary};
use crate::state::AppState;

/// `GET /api/analytics/summary`
pub async fn summary(State(state): State<AppState>) -> Result<Json<Summary>, ApiError> {
    Ok(Json(analytics::summary(&state.pool).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct LeaderboardQuery {
    pub limit: Option<i64>,
}

/// `GET /api/analytics/leaderboard?limit=`
pub async fn leaderboard(
    State(state): State<AppState>,
    Query(query): Query<LeaderboardQuery>,
) -> Result<Json<Vec<LeaderboardEntry>>, ApiError> {
    Ok(Json(analytics::leaderboard(&state.pool, query.limit).await?))
}

/// `GET /api/analytics/queues`: verification and moderation backlog per sector.
pub async fn queues(State(state): State<AppState>) -> Result<Json<Vec<SectorQueue>>, ApiError> {
    Ok(Json(analytics::sector_queues(&state.pool).await?))
}

#[cfg(test)]
#[path = "analytics_test.rs"]
mod tests;

//! Token maintenance endpoints, guarded by the admin bearer token.

use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use tracing::instrument;

use crate::error::AppError;
use crate::middleware::AdminToken;
use crate::services::{MigrationReport, SweepReport, TokenStatusReport};
use crate::state::AppState;

/// Create admin routes.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/admin/tokens", get(token_status))
        .route("/api/admin/tokens/migrate", post(force_migration))
        .route("/api/admin/tokens/sweep", post(sweep))
}

async fn token_status(
    State(state): State<AppState>,
    _admin: AdminToken,
) -> Result<Json<TokenStatusReport>, AppError> {
    Ok(Json(state.tokens().token_status().await?))
}

#[instrument(skip_all)]
async fn force_migration(
    State(state): State<AppState>,
    _admin: AdminToken,
) -> Result<Json<MigrationReport>, AppError> {
    Ok(Json(state.tokens().force_migration().await?))
}

#[instrument(skip_all)]
async fn sweep(
    State(state): State<AppState>,
    _admin: AdminToken,
) -> Result<Json<SweepReport>, AppError> {
    Ok(Json(state.tokens().sweep().await?))
}

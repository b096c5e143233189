use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use tracing::error;

use crate::{
    engagement::{EngagementKey, EngagementState, ItemId},
    error::AppError,
    state::State as AppState,
};

/// Identity first, so an unauthenticated caller never reaches storage.
async fn engagement_key(
    state: &AppState,
    headers: &HeaderMap,
    item_id: &str,
) -> Result<EngagementKey, AppError> {
    let user = state.gate.resolve(headers).await?;
    let item = ItemId::parse(item_id).ok_or(AppError::NotFound)?;

    Ok(EngagementKey::new(item, user))
}

pub async fn toggle_handler(
    State(state): State<Arc<AppState>>,
    Path(item_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<EngagementState>, AppError> {
    let key = engagement_key(&state, &headers, &item_id).await?;

    // Detached so a dropped connection cannot cancel the unit midway.
    let coordinator = state.coordinator.clone();
    let engagement = tokio::spawn(async move { coordinator.toggle(&key).await })
        .await
        .map_err(|e| {
            error!("Toggle task failed: {e}");
            AppError::InternalError
        })??;

    Ok(Json(engagement))
}

pub async fn status_handler(
    State(state): State<Arc<AppState>>,
    Path(item_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<EngagementState>, AppError> {
    let key = engagement_key(&state, &headers, &item_id).await?;

    Ok(Json(state.coordinator.status(&key).await?))
}

pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.coordinator.store().begin().await {
        Ok(_) => (StatusCode::OK, "ok").into_response(),
        Err(e) => {
            error!("Health check failed: {e}");
            AppError::InternalError.into_response()
        }
    }
}

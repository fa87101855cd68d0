use crate::dtos::DiscoveryMapResponse;
use crate::error::WopiError;
use crate::startup::AppState;
use axum::{extract::State, Json};

/// Editor URLs for every supported extension the host can open.
pub async fn discovery_map(
    State(state): State<AppState>,
) -> Result<Json<DiscoveryMapResponse>, WopiError> {
    let extensions = state.discovery.extension_map().await?;
    Ok(Json(DiscoveryMapResponse { extensions }))
}

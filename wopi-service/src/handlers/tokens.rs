use crate::dtos::{
    CreateSessionRequest, IssueTokenRequest, RevokeTokenRequest, SessionResponse, TokenResponse,
};
use crate::error::WopiError;
use crate::models::{Action, FileId};
use crate::services::resolve_app;
use crate::startup::AppState;
use axum::{
    extract::State,
    http::StatusCode,
    Json,
};
use chrono::Utc;
use validator::Validate;

#[tracing::instrument(skip(state, request), fields(file_id = %request.file_id, user_id = %request.user_id))]
pub async fn issue_token(
    State(state): State<AppState>,
    Json(request): Json<IssueTokenRequest>,
) -> Result<Json<TokenResponse>, WopiError> {
    request.validate()?;
    let permission = request.permission()?;

    let token = state
        .tokens
        .issue(&request.file_id, &request.user_id, &request.user_name, permission)
        .await?;
    let wopi_src = state.discovery.wopi_src(&token.file_id)?;

    Ok(Json(TokenResponse::new(&token, wopi_src.to_string(), Utc::now())))
}

/// Revoking an unknown token is not an error.
#[tracing::instrument(skip_all)]
pub async fn revoke_token(
    State(state): State<AppState>,
    Json(request): Json<RevokeTokenRequest>,
) -> Result<StatusCode, WopiError> {
    request.validate()?;
    state.tokens.revoke(&request.access_token).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Issue a token and build the editor launch URL in one call.
#[tracing::instrument(skip(state, request), fields(file_id = %request.file_id, user_id = %request.user_id))]
pub async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<Json<SessionResponse>, WopiError> {
    request.validate()?;
    let permission = request.permission()?;

    let unknown = || WopiError::UnknownFile(request.file_id.clone());
    let file_id = FileId::parse(&request.file_id).ok_or_else(unknown)?;
    let handle = state
        .storage
        .load_handle(&file_id)
        .await?
        .ok_or_else(unknown)?;
    let app_name = resolve_app(&handle.extension().unwrap_or_default())?;

    let action = request.action.unwrap_or(if permission.can_write() {
        Action::Edit
    } else {
        Action::View
    });

    let token = state
        .tokens
        .issue(&request.file_id, &request.user_id, &request.user_name, permission)
        .await?;
    let now = Utc::now();
    let action_url = state
        .discovery
        .build_action_url(
            app_name,
            action,
            &token.file_id,
            &token.token_value,
            token.ttl_ms_at(now),
        )
        .await?;
    let wopi_src = state.discovery.wopi_src(&token.file_id)?;

    Ok(Json(SessionResponse {
        token: TokenResponse::new(&token, wopi_src.to_string(), now),
        app_name,
        action,
        action_url: action_url.to_string(),
    }))
}

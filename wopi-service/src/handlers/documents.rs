use crate::dtos::CreateDocumentQuery;
use crate::error::WopiError;
use crate::models::FileHandle;
use crate::startup::AppState;
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use validator::Validate;

/// Register a document from the raw request body.
#[tracing::instrument(skip(state, body), fields(size = body.len()))]
pub async fn create_document(
    State(state): State<AppState>,
    Query(query): Query<CreateDocumentQuery>,
    body: Bytes,
) -> Result<(StatusCode, Json<FileHandle>), WopiError> {
    query.validate()?;

    let handle = state
        .gateway
        .create_file(query.file_id.as_deref(), &query.file_name, &query.owner_id, body)
        .await?;

    Ok((StatusCode::CREATED, Json(handle)))
}

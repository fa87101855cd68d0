//! Routes called by the editor host. The access token arrives in the
//! `access_token` query parameter and is never logged.

use crate::dtos::{PutFileResponse, WopiQuery};
use crate::error::{TokenRejection, WopiError};
use crate::models::FileInfo;
use crate::services::ByteRange;
use crate::startup::AppState;
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};

pub const ITEM_VERSION_HEADER: &str = "x-wopi-itemversion";
pub const OVERRIDE_HEADER: &str = "x-wopi-override";

fn access_token(query: &WopiQuery) -> Result<&str, WopiError> {
    query
        .access_token
        .as_deref()
        .filter(|t| !t.is_empty())
        .ok_or(WopiError::InvalidToken(TokenRejection::NotFound))
}

/// CheckFileInfo
#[tracing::instrument(skip(state, query))]
pub async fn check_file_info(
    State(state): State<AppState>,
    Path(file_id): Path<String>,
    Query(query): Query<WopiQuery>,
) -> Result<Json<FileInfo>, WopiError> {
    let token = access_token(&query)?;
    let mut info = state.gateway.check_file_info(&file_id, token).await?;
    info.post_message_origin = Some(state.discovery.editor_origin());
    Ok(Json(info))
}

/// GetFile
#[tracing::instrument(skip(state, query, headers))]
pub async fn get_file(
    State(state): State<AppState>,
    Path(file_id): Path<String>,
    Query(query): Query<WopiQuery>,
    headers: HeaderMap,
) -> Result<Response, WopiError> {
    let token = access_token(&query)?;
    let range = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(ByteRange::parse);

    let content = state.gateway.get_file(&file_id, token, range).await?;

    let status = if content.range.is_some() {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };
    let mut response = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, content.content_length())
        .header(header::ACCEPT_RANGES, "bytes")
        .header(ITEM_VERSION_HEADER, content.handle.content_hash.as_str());
    if let Some(range) = content.range {
        response = response.header(header::CONTENT_RANGE, range.header_value());
    }

    response
        .body(Body::from_stream(content.stream))
        .map_err(|e| WopiError::Internal(e.into()))
}

/// PutFile. Other `X-WOPI-Override` operations on this route are refused.
#[tracing::instrument(skip(state, query, headers, body))]
pub async fn put_file(
    State(state): State<AppState>,
    Path(file_id): Path<String>,
    Query(query): Query<WopiQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<impl IntoResponse, WopiError> {
    let token = access_token(&query)?;

    if let Some(op) = headers.get(OVERRIDE_HEADER) {
        let op = op.to_str().unwrap_or_default();
        if !op.eq_ignore_ascii_case("PUT") {
            return Err(WopiError::UnsupportedOperation(op.to_string()));
        }
    }

    let max_size = state.storage.max_file_size();
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok());
    if declared.is_some_and(|len| len > max_size) {
        return Err(WopiError::PayloadTooLarge { max_size });
    }

    let outcome = state
        .gateway
        .put_file(&file_id, token, body.into_data_stream())
        .await?;
    let handle = outcome.file_handle;

    Ok((
        [(ITEM_VERSION_HEADER, handle.content_hash.clone())],
        Json(PutFileResponse {
            last_modified_time: handle.last_modified.to_rfc3339(),
            version: handle.content_hash,
            size: handle.byte_size,
        }),
    ))
}

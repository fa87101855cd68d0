use crate::services::storage::StorageError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use service_core::error::ErrorBody;
use std::fmt;
use thiserror::Error;

/// Why a token was not accepted for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenRejection {
    Expired,
    NotFound,
    /// The token is valid but was issued for a different file.
    FileMismatch,
}

impl fmt::Display for TokenRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            TokenRejection::Expired => "expired",
            TokenRejection::NotFound => "not_found",
            TokenRejection::FileMismatch => "file_mismatch",
        };
        f.write_str(reason)
    }
}

#[derive(Debug, Error)]
pub enum WopiError {
    #[error("Unknown file: {0}")]
    UnknownFile(String),

    #[error("Access token expired")]
    Expired,

    #[error("Access token not found")]
    TokenNotFound,

    #[error("Invalid access token ({0})")]
    InvalidToken(TokenRejection),

    #[error("Permission denied for {operation} on file {file_id}")]
    PermissionDenied {
        operation: &'static str,
        file_id: String,
    },

    #[error("File missing: {0}")]
    FileMissing(String),

    #[error("Storage I/O error: {0}")]
    StorageIo(#[source] StorageError),

    #[error("Unsupported file extension: {0}")]
    UnsupportedExtension(String),

    #[error("Discovery unavailable: {0}")]
    DiscoveryUnavailable(String),

    #[error("Payload exceeds the {max_size} byte limit")]
    PayloadTooLarge { max_size: u64 },

    #[error("Upload aborted: {0}")]
    UploadAborted(String),

    #[error("Range not satisfiable for {size} byte file")]
    RangeNotSatisfiable { size: u64 },

    #[error("Validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Token store unavailable: {0}")]
    TokenStoreUnavailable(anyhow::Error),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl WopiError {
    /// Machine-readable error code returned to callers.
    pub fn code(&self) -> &'static str {
        match self {
            WopiError::UnknownFile(_) => "UNKNOWN_FILE",
            WopiError::Expired => "TOKEN_EXPIRED",
            WopiError::TokenNotFound => "TOKEN_NOT_FOUND",
            WopiError::InvalidToken(_) => "INVALID_TOKEN",
            WopiError::PermissionDenied { .. } => "PERMISSION_DENIED",
            WopiError::FileMissing(_) => "FILE_MISSING",
            WopiError::StorageIo(_) => "STORAGE_IO_ERROR",
            WopiError::UnsupportedExtension(_) => "UNSUPPORTED_EXTENSION",
            WopiError::DiscoveryUnavailable(_) => "DISCOVERY_UNAVAILABLE",
            WopiError::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            WopiError::UploadAborted(_) => "UPLOAD_ABORTED",
            WopiError::RangeNotSatisfiable { .. } => "RANGE_NOT_SATISFIABLE",
            WopiError::Validation(_) => "VALIDATION_ERROR",
            WopiError::BadRequest(_) => "BAD_REQUEST",
            WopiError::Conflict(_) => "CONFLICT",
            WopiError::UnsupportedOperation(_) => "UNSUPPORTED_OPERATION",
            WopiError::TokenStoreUnavailable(_) => "TOKEN_STORE_UNAVAILABLE",
            WopiError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            WopiError::UnknownFile(_) | WopiError::FileMissing(_) => StatusCode::NOT_FOUND,
            WopiError::Expired | WopiError::TokenNotFound | WopiError::InvalidToken(_) => {
                StatusCode::UNAUTHORIZED
            }
            WopiError::PermissionDenied { .. } => StatusCode::FORBIDDEN,
            WopiError::StorageIo(_) | WopiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            WopiError::UnsupportedExtension(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            WopiError::DiscoveryUnavailable(_) => StatusCode::BAD_GATEWAY,
            WopiError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            WopiError::UploadAborted(_) | WopiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            WopiError::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            WopiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            WopiError::Conflict(_) => StatusCode::CONFLICT,
            WopiError::UnsupportedOperation(_) => StatusCode::NOT_IMPLEMENTED,
            WopiError::TokenStoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Extra context safe to hand back to the caller.
    fn details(&self) -> Option<String> {
        match self {
            WopiError::InvalidToken(reason) => Some(format!("reason={}", reason)),
            WopiError::Validation(errors) => Some(errors.to_string()),
            WopiError::RangeNotSatisfiable { size } => Some(format!("size={}", size)),
            _ => None,
        }
    }

    /// Message shown to the caller. Server-side failures are not described.
    fn public_message(&self) -> String {
        match self {
            WopiError::StorageIo(_) => "Storage I/O error".to_string(),
            WopiError::TokenStoreUnavailable(_) => "Token store unavailable".to_string(),
            WopiError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<StorageError> for WopiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::TooLarge { max_size } => WopiError::PayloadTooLarge { max_size },
            StorageError::AlreadyExists(id) => {
                WopiError::Conflict(format!("File {} already exists", id))
            }
            other => WopiError::StorageIo(other),
        }
    }
}

impl IntoResponse for WopiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();

        if status.is_server_error() {
            tracing::error!(code = code, error = ?self, "WOPI request failed");
        } else {
            tracing::warn!(code = code, error = %self, "WOPI request rejected");
        }

        let body = ErrorBody::new(code, self.public_message(), self.details());
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_failures_are_unauthorized() {
        for err in [
            WopiError::Expired,
            WopiError::TokenNotFound,
            WopiError::InvalidToken(TokenRejection::FileMismatch),
        ] {
            assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
        }
    }

    #[test]
    fn every_taxonomy_member_has_a_distinct_code() {
        let errors = [
            WopiError::UnknownFile("f".into()),
            WopiError::Expired,
            WopiError::TokenNotFound,
            WopiError::InvalidToken(TokenRejection::Expired),
            WopiError::PermissionDenied {
                operation: "put_file",
                file_id: "f".into(),
            },
            WopiError::FileMissing("f".into()),
            WopiError::StorageIo(StorageError::Io(std::io::Error::other("disk"))),
            WopiError::UnsupportedExtension("exe".into()),
            WopiError::DiscoveryUnavailable("timeout".into()),
        ];
        let mut codes: Vec<_> = errors.iter().map(WopiError::code).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn storage_errors_keep_their_meaning() {
        let too_large: WopiError = StorageError::TooLarge { max_size: 10 }.into();
        assert_eq!(too_large.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let exists: WopiError = StorageError::AlreadyExists("f1".into()).into();
        assert_eq!(exists.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn server_side_messages_are_not_leaked() {
        let err = WopiError::StorageIo(StorageError::Io(std::io::Error::other(
            "/var/lib/wopi/secret/path",
        )));
        assert_eq!(err.public_message(), "Storage I/O error");
    }
}

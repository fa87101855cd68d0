use crate::error::WopiError;
use crate::models::{Action, AccessToken, AppName, DiscoveryDescriptor, Permission};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use validator::{Validate, ValidationError, ValidationErrors};

#[derive(Debug, Deserialize, Validate)]
pub struct IssueTokenRequest {
    #[validate(length(min = 1, max = 128, message = "file_id is required"))]
    pub file_id: String,
    #[validate(length(min = 1, max = 256, message = "user_id is required"))]
    pub user_id: String,
    #[validate(length(min = 1, max = 256, message = "user_name is required"))]
    pub user_name: String,
    #[validate(length(min = 1, message = "permission is required"))]
    pub permission: String,
}

impl IssueTokenRequest {
    pub fn permission(&self) -> Result<Permission, WopiError> {
        parse_permission(&self.permission)
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateSessionRequest {
    #[validate(length(min = 1, max = 128, message = "file_id is required"))]
    pub file_id: String,
    #[validate(length(min = 1, max = 256, message = "user_id is required"))]
    pub user_id: String,
    #[validate(length(min = 1, max = 256, message = "user_name is required"))]
    pub user_name: String,
    #[validate(length(min = 1, message = "permission is required"))]
    pub permission: String,
    /// Defaults to `edit` for write tokens and `view` for read tokens.
    pub action: Option<Action>,
}

impl CreateSessionRequest {
    pub fn permission(&self) -> Result<Permission, WopiError> {
        parse_permission(&self.permission)
    }
}

fn parse_permission(raw: &str) -> Result<Permission, WopiError> {
    raw.parse().map_err(|_| {
        let mut errors = ValidationErrors::new();
        let mut error = ValidationError::new("permission");
        error.message = Some("permission must be \"read\" or \"write\"".into());
        errors.add("permission", error);
        WopiError::Validation(errors)
    })
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    /// Remaining lifetime in milliseconds, as editors expect it.
    pub access_token_ttl: i64,
    pub expires_at: DateTime<Utc>,
    pub permission: Permission,
    pub wopi_src: String,
}

impl TokenResponse {
    pub fn new(token: &AccessToken, wopi_src: String, now: DateTime<Utc>) -> Self {
        Self {
            access_token: token.token_value.clone(),
            access_token_ttl: token.ttl_ms_at(now),
            expires_at: token.expires_at,
            permission: token.permission,
            wopi_src,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionResponse {
    #[serde(flatten)]
    pub token: TokenResponse,
    pub app_name: AppName,
    pub action: Action,
    pub action_url: String,
}

/// The token travels in the body so it never appears in a request path.
#[derive(Debug, Deserialize, Validate)]
pub struct RevokeTokenRequest {
    #[validate(length(min = 1, max = 512, message = "access_token is required"))]
    pub access_token: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateDocumentQuery {
    #[validate(length(min = 1, max = 255, message = "file_name is required"))]
    pub file_name: String,
    #[validate(length(min = 1, max = 256, message = "owner_id is required"))]
    pub owner_id: String,
    pub file_id: Option<String>,
}

/// Query parameters on editor-host routes.
#[derive(Debug, Deserialize)]
pub struct WopiQuery {
    pub access_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PutFileResponse {
    pub last_modified_time: String,
    pub version: String,
    pub size: u64,
}

#[derive(Debug, Serialize)]
pub struct DiscoveryMapResponse {
    pub extensions: BTreeMap<String, DiscoveryDescriptor>,
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

const MAX_FILE_ID_LEN: usize = 128;

/// A file identifier that is safe to use as a single path component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FileId(String);

impl FileId {
    pub fn parse(raw: &str) -> Option<Self> {
        let valid = !raw.is_empty()
            && raw.len() <= MAX_FILE_ID_LEN
            && raw != "."
            && raw != ".."
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        valid.then(|| FileId(raw.to_string()))
    }

    pub fn generate() -> Self {
        FileId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for FileId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        FileId::parse(&value).ok_or_else(|| format!("Invalid file id: {}", value))
    }
}

impl From<FileId> for String {
    fn from(id: FileId) -> Self {
        id.0
    }
}

/// Durable representation of a document's bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileHandle {
    pub file_id: FileId,
    pub file_name: String,
    pub owner_id: String,
    #[serde(skip)]
    pub storage_path: PathBuf,
    pub byte_size: u64,
    pub content_hash: String,
    pub last_modified: DateTime<Utc>,
}

impl FileHandle {
    /// Lowercased extension of the document name, without the dot.
    pub fn extension(&self) -> Option<String> {
        std::path::Path::new(&self.file_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_lowercase())
    }
}

/// CheckFileInfo result, serialised with WOPI property names.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct FileInfo {
    #[serde(skip)]
    pub file_id: String,
    pub base_file_name: String,
    pub size: u64,
    pub owner_id: String,
    pub user_id: String,
    pub user_friendly_name: String,
    pub user_can_write: bool,
    pub read_only: bool,
    pub user_can_not_write_relative: bool,
    pub supports_update: bool,
    pub supports_locks: bool,
    /// RFC 3339 timestamp of the last committed write.
    pub last_modified_time: String,
    /// Changes on every committed write; the content hash.
    pub version: String,
    /// Base64 SHA-256 of the content, per the WOPI property definition.
    #[serde(rename = "SHA256")]
    pub sha256: String,
    /// Origin of the editor frame allowed to exchange postMessage calls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_message_origin: Option<String>,
}

impl FileInfo {
    pub fn new(handle: &FileHandle, user_id: &str, user_name: &str, can_write: bool) -> Self {
        use base64::Engine;

        let sha256 = hex::decode(&handle.content_hash)
            .map(|raw| base64::engine::general_purpose::STANDARD.encode(raw))
            .unwrap_or_default();

        Self {
            file_id: handle.file_id.to_string(),
            base_file_name: handle.file_name.clone(),
            size: handle.byte_size,
            owner_id: handle.owner_id.clone(),
            user_id: user_id.to_string(),
            user_friendly_name: user_name.to_string(),
            user_can_write: can_write,
            read_only: !can_write,
            user_can_not_write_relative: true,
            supports_update: true,
            supports_locks: false,
            last_modified_time: handle.last_modified.to_rfc3339(),
            version: handle.content_hash.clone(),
            sha256,
            post_message_origin: None,
        }
    }
}

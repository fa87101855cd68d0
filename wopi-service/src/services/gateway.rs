//! Token- and permission-gated access to stored documents.
//!
//! Every operation walks the same stages and logs each transition:
//! `Received -> TokenValidated -> PermissionChecked -> StorageOperation ->
//! Committed | Failed`. Nothing touches storage before the token has been
//! validated for this exact file and the permission has been checked.

use crate::error::{TokenRejection, WopiError};
use crate::models::{AccessToken, FileHandle, FileId, FileInfo};
use crate::services::discovery::resolve_app;
use crate::services::storage::{BlobReader, Storage};
use crate::services::token_store::TokenStore;
use axum::body::Bytes;
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use service_core::retry::{retry_async, RetryConfig};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio_util::io::ReaderStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStage {
    Received,
    TokenValidated,
    PermissionChecked,
    StorageOperation,
    Committed,
    Failed,
}

impl fmt::Display for RequestStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestStage::Received => "received",
            RequestStage::TokenValidated => "token_validated",
            RequestStage::PermissionChecked => "permission_checked",
            RequestStage::StorageOperation => "storage_operation",
            RequestStage::Committed => "committed",
            RequestStage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Tracks one request through its stages.
struct RequestTrace {
    operation: &'static str,
    file_id: String,
    stage: RequestStage,
    started: Instant,
}

impl RequestTrace {
    fn start(operation: &'static str, file_id: &str) -> Self {
        tracing::debug!(operation, file_id, stage = %RequestStage::Received, "WOPI request stage");
        Self {
            operation,
            file_id: file_id.to_string(),
            stage: RequestStage::Received,
            started: Instant::now(),
        }
    }

    fn advance(&mut self, next: RequestStage) {
        tracing::debug!(
            operation = self.operation,
            file_id = %self.file_id,
            from = %self.stage,
            stage = %next,
            "WOPI request stage"
        );
        self.stage = next;
    }

    fn finish<T>(mut self, result: Result<T, WopiError>) -> Result<T, WopiError> {
        let outcome = match &result {
            Ok(_) => {
                self.advance(RequestStage::Committed);
                "success"
            }
            Err(e) => {
                tracing::info!(
                    operation = self.operation,
                    file_id = %self.file_id,
                    failed_at = %self.stage,
                    code = e.code(),
                    "WOPI request failed"
                );
                self.advance(RequestStage::Failed);
                e.code()
            }
        };

        metrics::counter!(
            "wopi_operations_total",
            "operation" => self.operation,
            "outcome" => outcome
        )
        .increment(1);
        metrics::histogram!("wopi_operation_duration_seconds", "operation" => self.operation)
            .record(self.started.elapsed().as_secs_f64());

        result
    }
}

/// A single `Range: bytes=...` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// `bytes=a-b`
    Bounded(u64, u64),
    /// `bytes=a-`
    From(u64),
    /// `bytes=-n`
    Suffix(u64),
}

impl ByteRange {
    /// Parse a Range header value. Malformed or multi-range values yield
    /// `None` and the full content is served.
    pub fn parse(header: &str) -> Option<Self> {
        let spec = header.trim().strip_prefix("bytes=")?.trim();
        if spec.contains(',') {
            return None;
        }
        let (start, end) = spec.split_once('-')?;
        let (start, end) = (start.trim(), end.trim());

        match (start.is_empty(), end.is_empty()) {
            (true, false) => end.parse().ok().map(ByteRange::Suffix),
            (false, true) => start.parse().ok().map(ByteRange::From),
            (false, false) => {
                let a: u64 = start.parse().ok()?;
                let b: u64 = end.parse().ok()?;
                (a <= b).then_some(ByteRange::Bounded(a, b))
            }
            (true, true) => None,
        }
    }

    /// Clamp against the file size.
    pub fn resolve(self, size: u64) -> Result<ContentRange, WopiError> {
        let unsatisfiable = || WopiError::RangeNotSatisfiable { size };
        let (start, end) = match self {
            ByteRange::Bounded(a, b) => {
                if a >= size {
                    return Err(unsatisfiable());
                }
                (a, b.min(size - 1))
            }
            ByteRange::From(a) => {
                if a >= size {
                    return Err(unsatisfiable());
                }
                (a, size - 1)
            }
            ByteRange::Suffix(n) => {
                if n == 0 || size == 0 {
                    return Err(unsatisfiable());
                }
                (size - n.min(size), size - 1)
            }
        };
        Ok(ContentRange {
            start,
            end,
            total: size,
        })
    }
}

/// Resolved byte range, `end` inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    pub total: u64,
}

impl ContentRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Value for the `Content-Range` response header.
    pub fn header_value(&self) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, self.total)
    }
}

/// GetFile result. The body is streamed from disk in `chunk_size` pieces.
pub struct FileContent {
    pub handle: FileHandle,
    pub range: Option<ContentRange>,
    pub stream: ReaderStream<BlobReader>,
}

impl FileContent {
    pub fn content_length(&self) -> u64 {
        self.range.map(|r| r.len()).unwrap_or(self.handle.byte_size)
    }
}

#[derive(Debug, Clone)]
pub struct PutOutcome {
    pub file_handle: FileHandle,
    pub previous_hash: String,
}

fn is_transient(err: &WopiError) -> bool {
    matches!(err, WopiError::StorageIo(e) if e.is_transient())
}

pub struct FileGateway {
    tokens: TokenStore,
    storage: Arc<dyn Storage>,
    retry: RetryConfig,
    locks: DashMap<FileId, Arc<Mutex<()>>>,
}

impl FileGateway {
    pub fn new(tokens: TokenStore, storage: Arc<dyn Storage>, retry: RetryConfig) -> Self {
        Self {
            tokens,
            storage,
            retry,
            locks: DashMap::new(),
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Validate the token for this file and check it grants what is needed.
    async fn authorize(
        &self,
        trace: &mut RequestTrace,
        file_id: &str,
        token_value: &str,
        needs_write: bool,
    ) -> Result<(FileId, AccessToken), WopiError> {
        let token = match self.tokens.validate(token_value).await {
            Ok(token) => token,
            Err(WopiError::Expired) => {
                return Err(WopiError::InvalidToken(TokenRejection::Expired))
            }
            Err(WopiError::TokenNotFound) => {
                return Err(WopiError::InvalidToken(TokenRejection::NotFound))
            }
            Err(other) => return Err(other),
        };
        if token.file_id != file_id {
            tracing::warn!(
                file_id,
                token_file_id = %token.file_id,
                user_id = %token.user_id,
                "Token presented for a different file"
            );
            return Err(WopiError::InvalidToken(TokenRejection::FileMismatch));
        }
        let id =
            FileId::parse(file_id).ok_or_else(|| WopiError::FileMissing(file_id.to_string()))?;
        trace.advance(RequestStage::TokenValidated);

        if needs_write && !token.permission.can_write() {
            return Err(WopiError::PermissionDenied {
                operation: trace.operation,
                file_id: file_id.to_string(),
            });
        }
        trace.advance(RequestStage::PermissionChecked);

        Ok((id, token))
    }

    async fn current_handle(&self, id: &FileId) -> Result<FileHandle, WopiError> {
        let storage = self.storage.as_ref();
        retry_async(&self.retry, "storage.load_handle", is_transient, || async move {
            storage
                .load_handle(id)
                .await?
                .ok_or_else(|| WopiError::FileMissing(id.to_string()))
        })
        .await
    }

    fn lock_for(&self, id: &FileId) -> Arc<Mutex<()>> {
        self.locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn release_lock(&self, id: &FileId) {
        self.locks
            .remove_if(id, |_, lock| Arc::strong_count(lock) == 1);
    }

    pub async fn check_file_info(
        &self,
        file_id: &str,
        token_value: &str,
    ) -> Result<FileInfo, WopiError> {
        let mut trace = RequestTrace::start("check_file_info", file_id);
        let result = async {
            let (id, token) = self.authorize(&mut trace, file_id, token_value, false).await?;
            trace.advance(RequestStage::StorageOperation);
            let handle = self.current_handle(&id).await?;
            Ok(FileInfo::new(
                &handle,
                &token.user_id,
                &token.user_display_name,
                token.permission.can_write(),
            ))
        }
        .await;
        trace.finish(result)
    }

    pub async fn get_file(
        &self,
        file_id: &str,
        token_value: &str,
        range: Option<ByteRange>,
    ) -> Result<FileContent, WopiError> {
        let mut trace = RequestTrace::start("get_file", file_id);
        let result = async {
            let (id, _token) = self.authorize(&mut trace, file_id, token_value, false).await?;
            trace.advance(RequestStage::StorageOperation);

            let storage = self.storage.as_ref();
            let id = &id;
            let (handle, range, reader) =
                retry_async(&self.retry, "storage.open", is_transient, || async move {
                    let handle = storage
                        .load_handle(id)
                        .await?
                        .ok_or_else(|| WopiError::FileMissing(id.to_string()))?;
                    let range = range.map(|r| r.resolve(handle.byte_size)).transpose()?;
                    let (start, len) = range
                        .map(|r| (r.start, r.len()))
                        .unwrap_or((0, handle.byte_size));
                    let reader = storage.open_range(&handle, start, len).await?;
                    Ok::<_, WopiError>((handle, range, reader))
                })
                .await?;

            let content = FileContent {
                stream: ReaderStream::with_capacity(reader, storage.chunk_size()),
                handle,
                range,
            };
            metrics::counter!("wopi_bytes_total", "direction" => "out")
                .increment(content.content_length());
            Ok(content)
        }
        .await;
        trace.finish(result)
    }

    /// Replace a file's content with the streamed body. Writers to the same
    /// file are serialised; the last one to commit wins.
    pub async fn put_file<S, E>(
        &self,
        file_id: &str,
        token_value: &str,
        body: S,
    ) -> Result<PutOutcome, WopiError>
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: fmt::Display + Send,
    {
        let mut trace = RequestTrace::start("put_file", file_id);
        let result = async {
            let (id, token) = self.authorize(&mut trace, file_id, token_value, true).await?;
            trace.advance(RequestStage::StorageOperation);

            let lock = self.lock_for(&id);
            let outcome = {
                let _guard = lock.lock().await;
                self.replace_content(&id, body).await
            };
            drop(lock);
            self.release_lock(&id);

            if let Ok(outcome) = &outcome {
                tracing::info!(
                    file_id = %id,
                    user_id = %token.user_id,
                    byte_size = outcome.file_handle.byte_size,
                    version = %outcome.file_handle.content_hash,
                    previous_version = %outcome.previous_hash,
                    "File content committed"
                );
            }
            outcome
        }
        .await;
        trace.finish(result)
    }

    async fn replace_content<S, E>(&self, id: &FileId, body: S) -> Result<PutOutcome, WopiError>
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: fmt::Display + Send,
    {
        let current = self.current_handle(id).await?;

        let storage = self.storage.as_ref();
        let mut staged = retry_async(&self.retry, "storage.stage", is_transient, || async move {
            storage.stage(id).await.map_err(WopiError::from)
        })
        .await?;

        futures::pin_mut!(body);
        while let Some(chunk) = body.next().await {
            let written = match chunk {
                Ok(bytes) => staged.write_chunk(&bytes).await.map_err(WopiError::from),
                Err(e) => Err(WopiError::UploadAborted(e.to_string())),
            };
            if let Err(e) = written {
                tracing::warn!(
                    file_id = %id,
                    bytes_received = staged.bytes_written(),
                    error = %e,
                    "Upload discarded"
                );
                staged.abort().await;
                return Err(e);
            }
        }
        let staged = staged.finish().await?;
        metrics::counter!("wopi_bytes_total", "direction" => "in").increment(staged.byte_size);

        let committed = {
            let (current, staged) = (&current, &staged);
            retry_async(&self.retry, "storage.commit", is_transient, || async move {
                storage.commit(current, staged).await.map_err(WopiError::from)
            })
            .await
        };

        match committed {
            Ok(file_handle) => Ok(PutOutcome {
                file_handle,
                previous_hash: current.content_hash,
            }),
            Err(e) => {
                staged.discard().await;
                Err(e)
            }
        }
    }

    /// Register a new document. A UUID is generated when no id is given.
    pub async fn create_file(
        &self,
        file_id: Option<&str>,
        file_name: &str,
        owner_id: &str,
        bytes: Bytes,
    ) -> Result<FileHandle, WopiError> {
        let id = match file_id {
            Some(raw) => FileId::parse(raw)
                .ok_or_else(|| WopiError::BadRequest(format!("Invalid file id: {}", raw)))?,
            None => FileId::generate(),
        };
        let mut trace = RequestTrace::start("create_file", id.as_str());
        let result = async {
            let extension = std::path::Path::new(file_name)
                .extension()
                .and_then(|ext| ext.to_str())
                .unwrap_or_default();
            resolve_app(extension)?;
            trace.advance(RequestStage::StorageOperation);

            let lock = self.lock_for(&id);
            let created = {
                let _guard = lock.lock().await;
                self.storage
                    .create(&id, file_name, owner_id, &bytes)
                    .await
                    .map_err(WopiError::from)
            };
            drop(lock);
            self.release_lock(&id);
            created
        }
        .await;
        trace.finish(result)
    }
}

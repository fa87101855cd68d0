use crate::models::{FileHandle, FileId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

const META_FILE: &str = "meta.json";
const BLOB_EXT: &str = "blob";
const STAGING_EXT: &str = "tmp";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Content exceeds {max_size} bytes")]
    TooLarge { max_size: u64 },

    #[error("File already exists: {0}")]
    AlreadyExists(String),

    #[error("Corrupt metadata for {file_id}: {source}")]
    CorruptMetadata {
        file_id: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StorageError {
    /// Only raw I/O failures are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Io(_))
    }
}

/// Reader over the requested slice of a blob.
pub type BlobReader = tokio::io::Take<fs::File>;

#[async_trait]
pub trait Storage: Send + Sync {
    /// Register a new document. Fails with `AlreadyExists` for a known id.
    async fn create(
        &self,
        file_id: &FileId,
        file_name: &str,
        owner_id: &str,
        bytes: &[u8],
    ) -> Result<FileHandle, StorageError>;

    /// Current committed handle, or `None` when the file is unknown.
    async fn load_handle(&self, file_id: &FileId) -> Result<Option<FileHandle>, StorageError>;

    /// Open `len` bytes of the handle's blob starting at `start`.
    async fn open_range(
        &self,
        handle: &FileHandle,
        start: u64,
        len: u64,
    ) -> Result<BlobReader, StorageError>;

    /// Start a staging file next to the document's committed content.
    async fn stage(&self, file_id: &FileId) -> Result<StagedWrite, StorageError>;

    /// Promote a finished staging file over `current`. Safe to repeat.
    async fn commit(
        &self,
        current: &FileHandle,
        staged: &StagedFile,
    ) -> Result<FileHandle, StorageError>;

    fn chunk_size(&self) -> usize;

    fn max_file_size(&self) -> u64;

    async fn health_check(&self) -> Result<(), StorageError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredMeta {
    file_id: FileId,
    file_name: String,
    owner_id: String,
    byte_size: u64,
    content_hash: String,
    last_modified: DateTime<Utc>,
}

/// Upload in progress. Bytes are hashed as they are written.
pub struct StagedWrite {
    file_id: FileId,
    path: PathBuf,
    file: fs::File,
    hasher: Sha256,
    written: u64,
    max_size: u64,
}

impl StagedWrite {
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), StorageError> {
        let written = self.written + chunk.len() as u64;
        if written > self.max_size {
            return Err(StorageError::TooLarge {
                max_size: self.max_size,
            });
        }
        self.file.write_all(chunk).await?;
        self.hasher.update(chunk);
        self.written = written;
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Flush and fsync the staging file. The file is removed if that fails.
    pub async fn finish(mut self) -> Result<StagedFile, StorageError> {
        if let Err(e) = self.sync().await {
            self.abort().await;
            return Err(e);
        }
        Ok(StagedFile {
            file_id: self.file_id,
            path: self.path,
            content_hash: hex::encode(self.hasher.finalize()),
            byte_size: self.written,
        })
    }

    async fn sync(&mut self) -> Result<(), StorageError> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(())
    }

    /// Drop the partial upload.
    pub async fn abort(self) {
        let StagedWrite { path, file, .. } = self;
        drop(file);
        remove_quietly(&path).await;
    }
}

/// Fully written, fsynced staging file awaiting commit.
#[derive(Debug)]
pub struct StagedFile {
    pub file_id: FileId,
    pub path: PathBuf,
    pub content_hash: String,
    pub byte_size: u64,
}

impl StagedFile {
    pub async fn discard(self) {
        remove_quietly(&self.path).await;
    }
}

/// Filesystem storage. Each document lives in its own directory:
/// `meta.json` names the current `<sha256>.blob`, and replacing `meta.json`
/// is the only step that changes what readers see.
pub struct LocalStorage {
    root: PathBuf,
    max_file_size: u64,
    chunk_size: usize,
}

impl LocalStorage {
    pub async fn new(
        root: impl Into<PathBuf>,
        max_file_size: u64,
        chunk_size: usize,
    ) -> Result<Self, StorageError> {
        let root = root.into();
        if !fs::try_exists(&root).await? {
            fs::create_dir_all(&root).await?;
        }
        Ok(Self {
            root,
            max_file_size,
            chunk_size,
        })
    }

    fn file_dir(&self, file_id: &FileId) -> PathBuf {
        self.root.join(file_id.as_str())
    }

    fn blob_path(&self, file_id: &FileId, content_hash: &str) -> PathBuf {
        self.file_dir(file_id)
            .join(format!("{}.{}", content_hash, BLOB_EXT))
    }

    fn handle_from(&self, meta: StoredMeta) -> FileHandle {
        let storage_path = self.blob_path(&meta.file_id, &meta.content_hash);
        FileHandle {
            file_id: meta.file_id,
            file_name: meta.file_name,
            owner_id: meta.owner_id,
            storage_path,
            byte_size: meta.byte_size,
            content_hash: meta.content_hash,
            last_modified: meta.last_modified,
        }
    }

    /// Move the staging file into place as a blob, then swap `meta.json`.
    async fn install(
        &self,
        staged: &StagedFile,
        file_name: &str,
        owner_id: &str,
    ) -> Result<FileHandle, StorageError> {
        let blob = self.blob_path(&staged.file_id, &staged.content_hash);

        if fs::try_exists(&blob).await? {
            // Same content already committed, or a previous attempt got this far.
            remove_quietly(&staged.path).await;
        } else {
            fs::rename(&staged.path, &blob).await?;
        }

        let meta = StoredMeta {
            file_id: staged.file_id.clone(),
            file_name: file_name.to_string(),
            owner_id: owner_id.to_string(),
            byte_size: staged.byte_size,
            content_hash: staged.content_hash.clone(),
            last_modified: Utc::now(),
        };
        self.write_meta(&meta).await?;

        Ok(self.handle_from(meta))
    }

    async fn write_meta(&self, meta: &StoredMeta) -> Result<(), StorageError> {
        let dir = self.file_dir(&meta.file_id);
        let payload = serde_json::to_vec_pretty(meta).map_err(|source| {
            StorageError::CorruptMetadata {
                file_id: meta.file_id.to_string(),
                source,
            }
        })?;

        let tmp = dir.join(format!("meta.{}.{}", uuid::Uuid::new_v4(), STAGING_EXT));
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&payload).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = fs::rename(&tmp, dir.join(META_FILE)).await {
            remove_quietly(&tmp).await;
            return Err(e.into());
        }
        // The new meta.json is visible from here on; the commit has happened.
        persist_dir(&dir).await;
        Ok(())
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn create(
        &self,
        file_id: &FileId,
        file_name: &str,
        owner_id: &str,
        bytes: &[u8],
    ) -> Result<FileHandle, StorageError> {
        if self.load_handle(file_id).await?.is_some() {
            return Err(StorageError::AlreadyExists(file_id.to_string()));
        }
        if bytes.len() as u64 > self.max_file_size {
            return Err(StorageError::TooLarge {
                max_size: self.max_file_size,
            });
        }

        let mut staged = self.stage(file_id).await?;
        if let Err(e) = staged.write_chunk(bytes).await {
            staged.abort().await;
            return Err(e);
        }
        let staged = staged.finish().await?;

        match self.install(&staged, file_name, owner_id).await {
            Ok(handle) => {
                tracing::info!(
                    file_id = %file_id,
                    byte_size = handle.byte_size,
                    "Document created"
                );
                Ok(handle)
            }
            Err(e) => {
                staged.discard().await;
                Err(e)
            }
        }
    }

    async fn load_handle(&self, file_id: &FileId) -> Result<Option<FileHandle>, StorageError> {
        let path = self.file_dir(file_id).join(META_FILE);
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let meta: StoredMeta =
            serde_json::from_slice(&raw).map_err(|source| StorageError::CorruptMetadata {
                file_id: file_id.to_string(),
                source,
            })?;
        Ok(Some(self.handle_from(meta)))
    }

    async fn open_range(
        &self,
        handle: &FileHandle,
        start: u64,
        len: u64,
    ) -> Result<BlobReader, StorageError> {
        let mut file = fs::File::open(&handle.storage_path).await?;
        if start > 0 {
            file.seek(SeekFrom::Start(start)).await?;
        }
        Ok(file.take(len))
    }

    async fn stage(&self, file_id: &FileId) -> Result<StagedWrite, StorageError> {
        let dir = self.file_dir(file_id);
        fs::create_dir_all(&dir).await?;

        let path = dir.join(format!("{}.{}", uuid::Uuid::new_v4(), STAGING_EXT));
        let file = fs::File::create(&path).await?;

        Ok(StagedWrite {
            file_id: file_id.clone(),
            path,
            file,
            hasher: Sha256::new(),
            written: 0,
            max_size: self.max_file_size,
        })
    }

    async fn commit(
        &self,
        current: &FileHandle,
        staged: &StagedFile,
    ) -> Result<FileHandle, StorageError> {
        let handle = self
            .install(staged, &current.file_name, &current.owner_id)
            .await?;

        if current.content_hash != handle.content_hash {
            remove_quietly(&current.storage_path).await;
        }

        Ok(handle)
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        let meta = fs::metadata(&self.root).await?;
        if !meta.is_dir() {
            return Err(StorageError::Io(std::io::Error::other(
                "storage root is not a directory",
            )));
        }
        Ok(())
    }
}

async fn remove_quietly(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove file"),
    }
}

/// Flush a directory's entries after a rename. Failures are logged only.
async fn persist_dir(dir: &Path) {
    if let Err(e) = sync_dir(dir).await {
        tracing::warn!(dir = %dir.display(), error = %e, "Failed to sync directory after commit");
    }
}

#[cfg(unix)]
async fn sync_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir).await?.sync_all().await
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

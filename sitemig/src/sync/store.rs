use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use sitemig_core::{DriveClient, DriveError, DriveFile, FOLDER_MIME, FileMetadata, FileQuery};
use thiserror::Error;
use tokio::sync::Semaphore;

use super::backoff::RetryDecision;

pub type RemoteFile = DriveFile;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Drive(#[from] DriveError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("upload limiter is closed")]
    ConcurrencyClosed,
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Drive(err) => err.is_retryable(),
            _ => false,
        }
    }

    pub fn retry_decision(&self) -> RetryDecision {
        match self {
            StoreError::Drive(err) if err.is_retryable() => {
                RetryDecision::retry_after(err.retry_after())
            }
            _ => RetryDecision::STOP,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    pub name: Option<String>,
    pub mime_type: Option<String>,
}

impl ListFilter {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            mime_type: None,
        }
    }

    pub fn folder(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            mime_type: Some(FOLDER_MIME.to_string()),
        }
    }

    pub fn matches(&self, file: &RemoteFile) -> bool {
        self.name.as_ref().is_none_or(|name| &file.name == name)
            && self
                .mime_type
                .as_ref()
                .is_none_or(|mime| &file.mime_type == mime)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpload {
    pub name: String,
    pub mime_type: String,
    pub source: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyTarget {
    pub name: String,
    pub mime_type: String,
    pub parent_id: String,
}

/// The hierarchical remote store files are mirrored into.
#[async_trait]
pub trait RemoteFileStore: Send + Sync {
    async fn list(&self, parent_id: &str, filter: &ListFilter)
    -> Result<Vec<RemoteFile>, StoreError>;
    async fn get_file(&self, id: &str) -> Result<RemoteFile, StoreError>;
    async fn create_folder(&self, parent_id: &str, name: &str) -> Result<String, StoreError>;
    async fn create_file(
        &self,
        parent_id: &str,
        upload: &FileUpload,
    ) -> Result<RemoteFile, StoreError>;
    async fn copy_file(&self, id: &str, target: &CopyTarget) -> Result<RemoteFile, StoreError>;
    async fn delete_file(&self, id: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy)]
pub struct StoreConfig {
    pub upload_concurrency: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            upload_concurrency: 4,
        }
    }
}

/// Google Drive backed store. Byte uploads are additionally limited so a
/// high item concurrency does not open as many upload streams.
#[derive(Clone)]
pub struct DriveStore {
    client: DriveClient,
    upload_limit: Arc<Semaphore>,
}

impl DriveStore {
    pub fn new(client: DriveClient) -> Self {
        Self::with_config(client, StoreConfig::default())
    }

    pub fn with_config(client: DriveClient, config: StoreConfig) -> Self {
        Self {
            client,
            upload_limit: Arc::new(Semaphore::new(config.upload_concurrency.max(1))),
        }
    }
}

#[async_trait]
impl RemoteFileStore for DriveStore {
    async fn list(
        &self,
        parent_id: &str,
        filter: &ListFilter,
    ) -> Result<Vec<RemoteFile>, StoreError> {
        let mut query = FileQuery::in_folder(parent_id);
        query.name = filter.name.clone();
        query.mime_type = filter.mime_type.clone();
        Ok(self.client.list_files(&query).await?)
    }

    async fn get_file(&self, id: &str) -> Result<RemoteFile, StoreError> {
        Ok(self.client.get_file(id).await?)
    }

    async fn create_folder(&self, parent_id: &str, name: &str) -> Result<String, StoreError> {
        Ok(self.client.create_folder(parent_id, name).await?.id)
    }

    async fn create_file(
        &self,
        parent_id: &str,
        upload: &FileUpload,
    ) -> Result<RemoteFile, StoreError> {
        let _permit = self
            .upload_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| StoreError::ConcurrencyClosed)?;
        let metadata = FileMetadata {
            name: upload.name.clone(),
            mime_type: Some(upload.mime_type.clone()),
            parents: vec![parent_id.to_string()],
        };
        Ok(self
            .client
            .upload_file(&metadata, &upload.mime_type, &upload.source)
            .await?)
    }

    async fn copy_file(&self, id: &str, target: &CopyTarget) -> Result<RemoteFile, StoreError> {
        let metadata = FileMetadata {
            name: target.name.clone(),
            mime_type: Some(target.mime_type.clone()),
            parents: vec![target.parent_id.clone()],
        };
        Ok(self.client.copy_file(id, &metadata).await?)
    }

    async fn delete_file(&self, id: &str) -> Result<(), StoreError> {
        Ok(self.client.delete_file(id).await?)
    }
}

/// Content type sent with an upload, chosen by file extension.
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "docx" => sitemig_core::DOCX_MIME,
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "doc" => "application/msword",
        "pdf" => "application/pdf",
        "md" => "text/markdown",
        "html" | "htm" => "text/html",
        "txt" => "text/plain",
        "csv" => "text/csv",
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}

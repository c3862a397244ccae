use std::collections::HashMap;
use std::path::{Component, Path};
use std::sync::{Arc, Mutex};

use tracing::debug;

use super::SyncError;
use super::backoff::{Backoff, DEFAULT_MAX_RETRIES};
use super::store::{ListFilter, RemoteFileStore, StoreError};

/// Splits a relative path into folder segments. Empty and `.` segments are
/// dropped; `..` and absolute prefixes are rejected.
pub fn split_segments(rel_path: &str) -> Result<Vec<String>, SyncError> {
    let mut segments = Vec::new();
    for component in Path::new(rel_path).components() {
        match component {
            Component::Normal(part) => segments.push(part.to_string_lossy().into_owned()),
            Component::RootDir | Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(SyncError::UnsupportedPath(rel_path.to_string()));
            }
        }
    }
    Ok(segments)
}

/// Resolved folder ids keyed by root id and slash-joined relative path.
/// Entries live for the whole run.
#[derive(Debug, Default)]
pub struct FolderCache {
    entries: Mutex<HashMap<(String, String), String>>,
}

impl FolderCache {
    pub fn get(&self, root_id: &str, path: &str) -> Option<String> {
        let entries = self.entries.lock().ok()?;
        entries
            .get(&(root_id.to_string(), path.to_string()))
            .cloned()
    }

    pub fn insert(&self, root_id: &str, path: &str, id: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert((root_id.to_string(), path.to_string()), id.to_string());
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Maps relative folder paths to remote folder ids, creating missing folders.
pub struct FolderResolver {
    store: Arc<dyn RemoteFileStore>,
    cache: FolderCache,
    miss_lock: tokio::sync::Mutex<()>,
    backoff: Backoff,
    max_retries: u32,
}

impl FolderResolver {
    pub fn new(store: Arc<dyn RemoteFileStore>) -> Self {
        Self {
            store,
            cache: FolderCache::default(),
            miss_lock: tokio::sync::Mutex::new(()),
            backoff: Backoff::default(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_retry(mut self, backoff: Backoff, max_retries: u32) -> Self {
        self.backoff = backoff;
        self.max_retries = max_retries;
        self
    }

    pub fn cache(&self) -> &FolderCache {
        &self.cache
    }

    pub async fn resolve_path(&self, root_id: &str, rel_path: &str) -> Result<String, SyncError> {
        let segments = split_segments(rel_path)?;
        self.resolve(root_id, &segments).await
    }

    /// Returns the id of the deepest folder, or `root_id` for no segments.
    pub async fn resolve<S: AsRef<str>>(
        &self,
        root_id: &str,
        segments: &[S],
    ) -> Result<String, SyncError> {
        let mut parent = root_id.to_string();
        let mut key = String::new();
        for segment in segments.iter().map(AsRef::as_ref) {
            if segment.is_empty() || segment == "." {
                continue;
            }
            if !key.is_empty() {
                key.push('/');
            }
            key.push_str(segment);

            parent = match self.cache.get(root_id, &key) {
                Some(id) => id,
                None => self.resolve_miss(root_id, &key, &parent, segment).await?,
            };
        }
        Ok(parent)
    }

    async fn resolve_miss(
        &self,
        root_id: &str,
        key: &str,
        parent: &str,
        name: &str,
    ) -> Result<String, SyncError> {
        let _guard = self.miss_lock.lock().await;
        if let Some(id) = self.cache.get(root_id, key) {
            return Ok(id);
        }

        let filter = ListFilter::folder(name);
        let existing = self
            .backoff
            .execute(self.max_retries, StoreError::retry_decision, || {
                self.store.list(parent, &filter)
            })
            .await?;

        let id = match existing.into_iter().next() {
            Some(folder) => {
                debug!(path = key, id = %folder.id, "found remote folder");
                folder.id
            }
            None => {
                let id = self
                    .backoff
                    .execute(self.max_retries, StoreError::retry_decision, || {
                        self.store.create_folder(parent, name)
                    })
                    .await?;
                debug!(path = key, id = %id, "created remote folder");
                id
            }
        };
        self.cache.insert(root_id, key, &id);
        Ok(id)
    }
}

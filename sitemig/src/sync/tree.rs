use super::SyncError;
use super::backoff::Backoff;
use super::store::{ListFilter, RemoteFile, RemoteFileStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    /// `prefix/sub/name` of the file below the scanned folder.
    pub path: String,
    pub file: RemoteFile,
}

/// Remote listing with retry applied to every folder read.
pub struct RemoteTree<'a> {
    store: &'a dyn RemoteFileStore,
    backoff: Backoff,
    max_retries: u32,
}

impl<'a> RemoteTree<'a> {
    pub fn new(store: &'a dyn RemoteFileStore, backoff: Backoff, max_retries: u32) -> Self {
        Self {
            store,
            backoff,
            max_retries,
        }
    }

    async fn children(&self, folder_id: &str) -> Result<Vec<RemoteFile>, SyncError> {
        let filter = ListFilter::default();
        Ok(self
            .backoff
            .execute(self.max_retries, StoreError::retry_decision, || {
                self.store.list(folder_id, &filter)
            })
            .await?)
    }

    /// Collects every non-folder file under `folder_id`, descending into
    /// subfolders when `deep` is set. Paths are joined onto `prefix`.
    pub async fn scan_files(
        &self,
        folder_id: &str,
        deep: bool,
        prefix: &str,
    ) -> Result<Vec<RemoteEntry>, SyncError> {
        let mut entries = Vec::new();
        let mut stack = vec![(folder_id.to_string(), prefix.trim_end_matches('/').to_string())];
        while let Some((id, path)) = stack.pop() {
            let mut folders = Vec::new();
            for file in self.children(&id).await? {
                let child_path = if path.is_empty() {
                    file.name.clone()
                } else {
                    format!("{path}/{}", file.name)
                };
                if file.is_folder() {
                    if deep {
                        folders.push((file.id.clone(), child_path));
                    }
                } else {
                    entries.push(RemoteEntry {
                        path: child_path,
                        file,
                    });
                }
            }
            stack.extend(folders.into_iter().rev());
        }
        Ok(entries)
    }

    /// Indented listing of the folder tree, one line per entry.
    pub async fn render(&self, folder_id: &str) -> Result<Vec<String>, SyncError> {
        let mut lines = Vec::new();
        self.render_into(folder_id, "", &mut lines).await?;
        Ok(lines)
    }

    async fn render_into(
        &self,
        folder_id: &str,
        indent: &str,
        lines: &mut Vec<String>,
    ) -> Result<(), SyncError> {
        let files = self.children(folder_id).await?;
        if files.is_empty() {
            lines.push(format!("{indent} This folder is empty."));
            return Ok(());
        }
        for file in files {
            if file.is_folder() {
                lines.push(format!("{indent} + {}", file.name));
                let nested = format!("  {indent}");
                Box::pin(self.render_into(&file.id, &nested, lines)).await?;
            } else {
                lines.push(format!(
                    "{indent} {} ({} bytes) -> {}",
                    file.name,
                    file.size.unwrap_or(0),
                    file.mime_type
                ));
            }
        }
        Ok(())
    }
}

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use sitemig_core::DOCUMENT_MIME;
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::SyncError;
use super::backoff::{Backoff, DEFAULT_MAX_RETRIES};
use super::folders::FolderResolver;
use super::policy::{self, Conversion, LocalFile, SyncAction, SyncMode};
use super::report::{
    TransferRecord, TransferReporter, TransferStatus, format_elapsed, format_size,
};
use super::scheduler::WorkItem;
use super::store::{
    CopyTarget, FileUpload, ListFilter, RemoteFile, RemoteFileStore, StoreError, content_type_for,
};

#[derive(Debug, Clone, Copy)]
pub struct UploadOptions {
    pub mode: SyncMode,
    pub convert: bool,
    pub backoff: Backoff,
    pub max_retries: u32,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            mode: SyncMode::UploadAll,
            convert: true,
            backoff: Backoff::default(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Local tree below the upload source: folders first-seen order, then files.
#[derive(Debug, Default)]
pub struct LocalScan {
    pub dirs: Vec<String>,
    pub files: Vec<LocalFile>,
}

impl LocalScan {
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

pub fn scan_local(source: &Path) -> Result<LocalScan, SyncError> {
    if !source.is_dir() {
        return Err(SyncError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} is not a directory", source.display()),
        )));
    }

    let mut scan = LocalScan::default();
    for entry in WalkDir::new(source).min_depth(1).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(error = %err, "skipping unreadable entry");
                continue;
            }
        };
        let Ok(rel) = entry.path().strip_prefix(source) else {
            continue;
        };
        let rel_path = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if entry.file_type().is_dir() {
            scan.dirs.push(rel_path);
            continue;
        }
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!(path = %rel_path, error = %err, "unable to read file metadata");
                continue;
            }
        };
        scan.files.push(LocalFile {
            path: entry.path().to_path_buf(),
            rel_path,
            size: metadata.len(),
            modified: metadata.modified().ok().map(OffsetDateTime::from),
        });
    }
    Ok(scan)
}

/// Per-run state shared by every upload worker.
pub struct UploadContext {
    store: Arc<dyn RemoteFileStore>,
    folders: FolderResolver,
    reporter: TransferReporter,
    root_id: String,
    options: UploadOptions,
    done: AtomicUsize,
    started: Instant,
}

impl UploadContext {
    pub fn new(store: Arc<dyn RemoteFileStore>, root_id: impl Into<String>, options: UploadOptions) -> Self {
        let folders = FolderResolver::new(Arc::clone(&store))
            .with_retry(options.backoff, options.max_retries);
        Self {
            store,
            folders,
            reporter: TransferReporter::new(),
            root_id: root_id.into(),
            options,
            done: AtomicUsize::new(0),
            started: Instant::now(),
        }
    }

    pub fn reporter(&self) -> &TransferReporter {
        &self.reporter
    }

    pub fn folders(&self) -> &FolderResolver {
        &self.folders
    }

    /// Resolves every local directory up front, one at a time, so file
    /// workers only hit the folder cache.
    pub async fn pre_resolve(&self, dirs: &[String]) -> Result<(), SyncError> {
        if self.options.mode == SyncMode::ScanOnly {
            return Ok(());
        }
        for dir in dirs {
            self.folders.resolve_path(&self.root_id, dir).await?;
        }
        debug!(folders = self.folders.cache().len(), "remote folders resolved");
        Ok(())
    }

    /// Syncs one file and records exactly one row for it.
    pub async fn process(&self, item: WorkItem<LocalFile>) -> Result<(), SyncError> {
        let file = &item.value;
        let outcome = self.sync_file(file).await;
        let done = self.done.fetch_add(1, Ordering::SeqCst) + 1;
        let elapsed = format_elapsed(self.started.elapsed());
        match outcome {
            Ok(record) => {
                info!(
                    "{done}/{}. {} {} ({elapsed})",
                    item.total,
                    file.rel_path,
                    describe(&record)
                );
                self.reporter.record(record);
                Ok(())
            }
            Err(err) => {
                warn!("{done}/{}. {} failed: {err} ({elapsed})", item.total, file.rel_path);
                self.reporter
                    .record(TransferRecord::error(&file.rel_path, err.to_string()));
                Err(err)
            }
        }
    }

    async fn sync_file(&self, file: &LocalFile) -> Result<TransferRecord, SyncError> {
        let mode = self.options.mode;
        if mode == SyncMode::ScanOnly {
            return Ok(TransferRecord::skipped(
                &file.rel_path,
                Some(file.size),
                "scanned",
            ));
        }

        let parent = self.folders.resolve_path(&self.root_id, file.folder()).await?;
        let matches = if mode.needs_matches() {
            self.find_matches(&parent, file).await?
        } else {
            Vec::new()
        };

        match policy::decide(mode, file, &matches) {
            SyncAction::Skip => Ok(TransferRecord::skipped(
                &file.rel_path,
                Some(file.size),
                skip_reason(mode, file),
            )),
            SyncAction::ConvertOnly(id) => {
                self.convert(&id, &parent, file).await?;
                Ok(TransferRecord::success(
                    &file.rel_path,
                    Some(file.size),
                    format!("converted to document '{}'", file.stem()),
                ))
            }
            SyncAction::UploadOnly => self.upload(&parent, file, None).await,
            SyncAction::DeleteThenUpload(ids) => {
                for id in &ids {
                    self.retry(|| self.store.delete_file(id)).await?;
                }
                self.upload(&parent, file, Some(ids.len())).await
            }
        }
    }

    async fn find_matches(
        &self,
        parent: &str,
        file: &LocalFile,
    ) -> Result<Vec<RemoteFile>, SyncError> {
        let by_name = ListFilter::named(file.name());
        let mut matches = self.retry(|| self.store.list(parent, &by_name)).await?;
        if file.stem() != file.name() {
            let by_stem = ListFilter::named(file.stem());
            matches.extend(self.retry(|| self.store.list(parent, &by_stem)).await?);
        }
        matches.retain(|file| !file.is_folder());
        Ok(policy::dedup_matches(matches))
    }

    async fn upload(
        &self,
        parent: &str,
        file: &LocalFile,
        replaced: Option<usize>,
    ) -> Result<TransferRecord, SyncError> {
        debug!(path = %file.rel_path, size = %format_size(file.size), "uploading");
        let upload = FileUpload {
            name: file.name().to_string(),
            mime_type: content_type_for(&file.path).to_string(),
            source: file.path.clone(),
        };
        let uploaded = self.retry(|| self.store.create_file(parent, &upload)).await?;

        let mut message = match replaced {
            Some(count) => format!("replaced {count} remote file(s)"),
            None => "uploaded".to_string(),
        };
        match policy::conversion_for(file, self.options.convert) {
            Conversion::Convert => match self.convert(&uploaded.id, parent, file).await {
                Ok(()) => {
                    message.push_str(&format!("; converted to document '{}'", file.stem()));
                }
                Err(err) => {
                    warn!(path = %file.rel_path, error = %err, "unable to convert to document");
                    message.push_str(&format!("; conversion failed: {err}"));
                }
            },
            Conversion::TooLarge => {
                info!(path = %file.rel_path, size = %format_size(file.size), "file too large to convert");
                message.push_str("; conversion skipped, file exceeds 100 MB");
            }
            Conversion::NotApplicable => {}
        }
        Ok(TransferRecord::success(
            &file.rel_path,
            Some(file.size),
            message,
        ))
    }

    /// Copies the uploaded office file as a native document, then removes
    /// the office file.
    async fn convert(&self, id: &str, parent: &str, file: &LocalFile) -> Result<(), SyncError> {
        let target = CopyTarget {
            name: file.stem().to_string(),
            mime_type: DOCUMENT_MIME.to_string(),
            parent_id: parent.to_string(),
        };
        let document = self.retry(|| self.store.copy_file(id, &target)).await?;
        debug!(path = %file.rel_path, document = %document.id, "converted");
        self.retry(|| self.store.delete_file(id)).await?;
        Ok(())
    }

    async fn retry<T, F, Fut>(&self, operation: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, StoreError>>,
    {
        self.options
            .backoff
            .execute(self.options.max_retries, StoreError::retry_decision, operation)
            .await
    }
}

fn skip_reason(mode: SyncMode, file: &LocalFile) -> &'static str {
    match mode {
        SyncMode::Convert if policy::conversion_for(file, true) == Conversion::TooLarge => {
            "exceeds 100 MB, not converted"
        }
        SyncMode::Convert => "nothing to convert",
        SyncMode::OverwriteOlder => "remote is up to date",
        _ => "exists on remote",
    }
}

fn describe(record: &TransferRecord) -> String {
    match record.status {
        TransferStatus::Success | TransferStatus::Deleted => record.message.clone(),
        TransferStatus::Skipped => format!("skipped: {}", record.message),
        TransferStatus::Error => format!("error: {}", record.message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::scheduler::{ScheduleOptions, Scheduler};
    use crate::sync::store::memory::{CallCounts, MemoryStore};
    use sitemig_core::{DOCX_MIME, FOLDER_MIME};
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;
    use time::macros::datetime;

    fn source_tree() -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("blog/2024")).unwrap();
        fs::create_dir_all(dir.path().join("empty")).unwrap();
        fs::write(dir.path().join("index.docx"), b"home").unwrap();
        fs::write(dir.path().join("blog/2024/launch.docx"), b"launch").unwrap();
        fs::write(dir.path().join("blog/2024/hero.png"), b"png").unwrap();
        dir
    }

    async fn run(store: &Arc<MemoryStore>, source: &Path, options: UploadOptions) -> Arc<UploadContext> {
        let scan = scan_local(source).unwrap();
        let ctx = Arc::new(UploadContext::new(store.clone(), "root", options));
        ctx.pre_resolve(&scan.dirs).await.unwrap();
        Scheduler::new(ScheduleOptions::new(3, Duration::ZERO))
            .process_all(scan.files, Arc::clone(&ctx), |item, ctx| async move {
                ctx.process(item).await
            })
            .await;
        ctx
    }

    fn options(mode: SyncMode) -> UploadOptions {
        UploadOptions {
            mode,
            ..UploadOptions::default()
        }
    }

    fn folder_id(store: &MemoryStore, parent: &str, name: &str) -> String {
        store
            .children(parent)
            .into_iter()
            .find(|f| f.name == name && f.mime_type == FOLDER_MIME)
            .map(|f| f.id)
            .unwrap()
    }

    #[test]
    fn scans_relative_slash_paths() {
        let dir = source_tree();
        let scan = scan_local(dir.path()).unwrap();
        assert_eq!(scan.dirs, ["blog", "blog/2024", "empty"]);
        let files: Vec<_> = scan.files.iter().map(|f| f.rel_path.as_str()).collect();
        assert_eq!(files, ["blog/2024/hero.png", "blog/2024/launch.docx", "index.docx"]);
        assert_eq!(scan.total_size(), 13);
        assert!(scan.files.iter().all(|f| f.modified.is_some()));
    }

    #[test]
    fn missing_source_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            scan_local(&dir.path().join("nope")),
            Err(SyncError::Io(_))
        ));
    }

    #[tokio::test]
    async fn uploads_tree_and_converts_documents() {
        let dir = source_tree();
        let store = Arc::new(MemoryStore::default());
        let ctx = run(&store, dir.path(), options(SyncMode::UploadAll)).await;

        let blog = folder_id(&store, "root", "blog");
        let year = folder_id(&store, &blog, "2024");
        assert!(store.children("root").iter().any(|f| f.name == "empty"));

        let names: Vec<_> = store
            .children(&year)
            .into_iter()
            .map(|f| (f.name, f.mime_type))
            .collect();
        assert_eq!(
            names,
            [
                ("hero.png".to_string(), "image/png".to_string()),
                ("launch".to_string(), DOCUMENT_MIME.to_string()),
            ]
        );
        assert_eq!(CallCounts::get(&store.calls.create_folder), 3);
        assert_eq!(CallCounts::get(&store.calls.copy), 2);

        let summary = ctx.reporter().summary();
        assert_eq!(summary.success, 3);
        assert_eq!(summary.total(), 3);
    }

    #[tokio::test]
    async fn no_convert_keeps_office_files() {
        let dir = source_tree();
        let store = Arc::new(MemoryStore::default());
        let mut opts = options(SyncMode::UploadAll);
        opts.convert = false;
        run(&store, dir.path(), opts).await;

        assert!(
            store
                .children("root")
                .iter()
                .any(|f| f.name == "index.docx" && f.mime_type == DOCX_MIME)
        );
        assert_eq!(CallCounts::get(&store.calls.copy), 0);
    }

    #[tokio::test]
    async fn keep_remote_skips_existing_documents() {
        let dir = source_tree();
        let store = Arc::new(MemoryStore::default());
        store.insert("root", "index", DOCUMENT_MIME, None);
        let ctx = run(&store, dir.path(), options(SyncMode::KeepRemote)).await;

        let records = ctx.reporter().drain();
        let index = records.iter().find(|r| r.path == "index.docx").unwrap();
        assert_eq!(index.status, TransferStatus::Skipped);
        assert_eq!(index.message, "exists on remote");
        assert_eq!(records.len(), 3);
    }

    #[tokio::test]
    async fn overwrite_replaces_matches() {
        let dir = source_tree();
        let store = Arc::new(MemoryStore::default());
        let old = store.insert("root", "index", DOCUMENT_MIME, None);
        let ctx = run(&store, dir.path(), options(SyncMode::Overwrite)).await;

        assert!(!store.contains(&old));
        let records = ctx.reporter().drain();
        let index = records.iter().find(|r| r.path == "index.docx").unwrap();
        assert_eq!(index.status, TransferStatus::Success);
        assert!(index.message.starts_with("replaced 1 remote file(s)"));
        let docs: Vec<_> = store
            .children("root")
            .into_iter()
            .filter(|f| f.name == "index")
            .collect();
        assert_eq!(docs.len(), 1);
    }

    #[tokio::test]
    async fn overwrite_older_respects_newer_remote() {
        let dir = source_tree();
        let store = Arc::new(MemoryStore::default());
        let newer = store.insert(
            "root",
            "index",
            DOCUMENT_MIME,
            Some(datetime!(2999-01-01 0:00 UTC)),
        );
        let older = store.insert(
            "root",
            "index.docx",
            DOCX_MIME,
            Some(datetime!(2000-01-01 0:00 UTC)),
        );
        let ctx = run(&store, dir.path(), options(SyncMode::OverwriteOlder)).await;

        assert!(store.contains(&newer));
        assert!(!store.contains(&older));
        let records = ctx.reporter().drain();
        let index = records.iter().find(|r| r.path == "index.docx").unwrap();
        assert_eq!(index.status, TransferStatus::Success);
    }

    #[tokio::test]
    async fn convert_mode_converts_uploaded_docx_only() {
        let dir = source_tree();
        let store = Arc::new(MemoryStore::default());
        let docx = store.insert("root", "index.docx", DOCX_MIME, None);
        let ctx = run(&store, dir.path(), options(SyncMode::Convert)).await;

        assert!(!store.contains(&docx));
        assert_eq!(CallCounts::get(&store.calls.create_file), 0);
        let records = ctx.reporter().drain();
        let index = records.iter().find(|r| r.path == "index.docx").unwrap();
        assert_eq!(index.status, TransferStatus::Success);
        assert_eq!(index.message, "converted to document 'index'");
        assert_eq!(
            records
                .iter()
                .filter(|r| r.status == TransferStatus::Skipped)
                .count(),
            2
        );
    }

    #[test]
    fn oversized_docx_skip_names_the_limit() {
        let mut file = LocalFile {
            path: "/src/big.docx".into(),
            rel_path: "big.docx".into(),
            size: policy::CONVERSION_LIMIT + 1,
            modified: None,
        };
        assert_eq!(
            skip_reason(SyncMode::Convert, &file),
            "exceeds 100 MB, not converted"
        );
        file.size = 10;
        assert_eq!(skip_reason(SyncMode::Convert, &file), "nothing to convert");
        assert_eq!(skip_reason(SyncMode::KeepRemote, &file), "exists on remote");
    }

    fn docx_beside_folder() -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("blog")).unwrap();
        fs::write(dir.path().join("blog.docx"), b"landing").unwrap();
        fs::write(dir.path().join("blog/post.docx"), b"post").unwrap();
        dir
    }

    async fn run_serial(
        store: &Arc<MemoryStore>,
        source: &Path,
        options: UploadOptions,
    ) -> Arc<UploadContext> {
        let scan = scan_local(source).unwrap();
        let ctx = Arc::new(UploadContext::new(store.clone(), "root", options));
        ctx.pre_resolve(&scan.dirs).await.unwrap();
        Scheduler::new(ScheduleOptions::new(1, Duration::ZERO))
            .process_all(scan.files, Arc::clone(&ctx), |item, ctx| async move {
                ctx.process(item).await
            })
            .await;
        ctx
    }

    #[tokio::test]
    async fn sibling_folder_does_not_block_or_get_replaced() {
        for mode in [SyncMode::KeepRemote, SyncMode::Overwrite, SyncMode::OverwriteOlder] {
            let dir = docx_beside_folder();
            let store = Arc::new(MemoryStore::default());
            let ctx = run_serial(&store, dir.path(), options(mode)).await;

            let blog = folder_id(&store, "root", "blog");
            assert!(
                store.children(&blog).iter().any(|f| f.name == "post"),
                "{mode}: folder contents lost"
            );
            assert!(
                store
                    .children("root")
                    .iter()
                    .any(|f| f.name == "blog" && f.mime_type == DOCUMENT_MIME),
                "{mode}: landing page not uploaded"
            );
            let records = ctx.reporter().drain();
            let landing = records.iter().find(|r| r.path == "blog.docx").unwrap();
            assert_eq!(landing.status, TransferStatus::Success, "{mode}");
            assert_eq!(landing.message, "uploaded; converted to document 'blog'");
            assert_eq!(CallCounts::get(&store.calls.delete), 2, "{mode}");
        }
    }

    #[tokio::test]
    async fn failed_conversion_keeps_the_upload() {
        let dir = source_tree();
        let store = Arc::new(MemoryStore::default());
        store.rejected_copies.lock().unwrap().push("index".into());
        let ctx = run(&store, dir.path(), options(SyncMode::UploadAll)).await;

        assert!(
            store
                .children("root")
                .iter()
                .any(|f| f.name == "index.docx" && f.mime_type == DOCX_MIME)
        );
        assert_eq!(ctx.reporter().summary().error, 0);
        let records = ctx.reporter().drain();
        let index = records.iter().find(|r| r.path == "index.docx").unwrap();
        assert_eq!(index.status, TransferStatus::Success);
        assert!(index.message.starts_with("uploaded; conversion failed:"));
    }

    #[tokio::test]
    async fn scan_only_makes_no_remote_calls() {
        let dir = source_tree();
        let store = Arc::new(MemoryStore::default());
        let ctx = run(&store, dir.path(), options(SyncMode::ScanOnly)).await;

        assert_eq!(CallCounts::get(&store.calls.list), 0);
        assert_eq!(CallCounts::get(&store.calls.create_folder), 0);
        let records = ctx.reporter().drain();
        assert_eq!(records.len(), 3);
        assert_eq!(records.iter().filter_map(|r| r.size).sum::<u64>(), 13);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_become_error_rows() {
        let dir = source_tree();
        let store = Arc::new(MemoryStore::default());
        store
            .rate_limited_uploads
            .store(2, std::sync::atomic::Ordering::SeqCst);
        store.rejected_names.lock().unwrap().push("hero.png".into());
        let ctx = run(&store, dir.path(), options(SyncMode::UploadAll)).await;

        let records = ctx.reporter().drain();
        assert_eq!(records.len(), 3);
        let hero = records
            .iter()
            .find(|r| r.path == "blog/2024/hero.png")
            .unwrap();
        assert_eq!(hero.status, TransferStatus::Error);
        assert_eq!(
            records
                .iter()
                .filter(|r| r.status == TransferStatus::Success)
                .count(),
            2
        );
    }
}

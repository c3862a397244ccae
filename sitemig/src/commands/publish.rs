use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Context;
use sitemig_core::{ADMIN_API_BASE, AdminClient, AdminError, AdminOperation, DOCUMENT_MIME, SiteRef};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli::{OperationArg, PublishArgs};
use crate::config::RunConfig;
use crate::sync::backoff::{Backoff, RetryDecision};
use crate::sync::report::{TransferRecord, TransferReporter, format_elapsed};
use crate::sync::scheduler::{Scheduler, WorkItem};
use crate::sync::store::{DriveStore, RemoteFileStore};
use crate::sync::tree::{RemoteEntry, RemoteTree};

use super::import::sanitize_name;
use super::{drive_client, save_run_report};

impl From<OperationArg> for AdminOperation {
    fn from(value: OperationArg) -> Self {
        match value {
            OperationArg::Preview => AdminOperation::Preview,
            OperationArg::Live => AdminOperation::Live,
            OperationArg::Index => AdminOperation::Index,
            OperationArg::Cache => AdminOperation::Cache,
            OperationArg::Status => AdminOperation::Status,
        }
    }
}

/// Web path of a document: every segment sanitized, the context kept as given.
pub fn web_path(context: &str, rel_path: &str) -> String {
    let mut path = context.trim_end_matches('/').to_string();
    for segment in rel_path.split('/').filter(|s| !s.is_empty()) {
        path.push('/');
        path.push_str(&sanitize_name(segment));
    }
    if path.is_empty() {
        path.push('/');
    }
    path
}

pub struct PublishContext {
    admin: AdminClient,
    operations: Vec<AdminOperation>,
    context: String,
    reporter: TransferReporter,
    backoff: Backoff,
    max_retries: u32,
    done: AtomicUsize,
    started: Instant,
}

impl PublishContext {
    pub fn new(
        admin: AdminClient,
        operations: Vec<AdminOperation>,
        context: impl Into<String>,
        max_retries: u32,
    ) -> Self {
        Self {
            admin,
            operations,
            context: context.into(),
            reporter: TransferReporter::new(),
            backoff: Backoff::default(),
            max_retries,
            done: AtomicUsize::new(0),
            started: Instant::now(),
        }
    }

    pub fn reporter(&self) -> &TransferReporter {
        &self.reporter
    }

    /// Runs every configured operation for one document, stopping at the
    /// first failure.
    pub async fn process(&self, item: WorkItem<RemoteEntry>) -> Result<(), AdminError> {
        let rel = item
            .value
            .path
            .strip_prefix(self.context.as_str())
            .unwrap_or(&item.value.path);
        let path = web_path(&self.context, rel);
        let outcome = self.publish(&path).await;
        let done = self.done.fetch_add(1, Ordering::SeqCst) + 1;
        let elapsed = format_elapsed(self.started.elapsed());
        match outcome {
            Ok(()) => {
                let ops: Vec<&str> = self.operations.iter().map(|op| op.as_str()).collect();
                info!("{done}/{}. published {path} ({elapsed})", item.total);
                self.reporter
                    .record(TransferRecord::success(&path, None, ops.join(", ")));
                Ok(())
            }
            Err(err) => {
                warn!("{done}/{}. {path} failed: {err}", item.total);
                self.reporter
                    .record(TransferRecord::error(&path, err.to_string()));
                Err(err)
            }
        }
    }

    async fn publish(&self, path: &str) -> Result<(), AdminError> {
        for operation in &self.operations {
            self.backoff
                .execute(
                    self.max_retries,
                    |err: &AdminError| {
                        if err.is_retryable() {
                            RetryDecision::retry_after(err.retry_after())
                        } else {
                            RetryDecision::STOP
                        }
                    },
                    || self.admin.run(*operation, path),
                )
                .await?;
        }
        Ok(())
    }
}

pub async fn run(
    config: &RunConfig,
    args: PublishArgs,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let token = config.resolve_token(args.token.as_deref())?;
    let store = DriveStore::with_config(drive_client(config, &token)?, config.store_config());

    let context = match args.root_context {
        Some(context) => context,
        None => {
            let folder = store
                .get_file(&args.target)
                .await
                .with_context(|| format!("unable to read folder {}", args.target))?;
            format!("/{}", folder.name)
        }
    };
    info!(%context, "publishing");

    let tree = RemoteTree::new(&store, config.backoff(), config.max_retries);
    let documents: Vec<RemoteEntry> = tree
        .scan_files(&args.target, true, &context)
        .await
        .context("failed to scan target folder")?
        .into_iter()
        .filter(|entry| entry.file.mime_type == DOCUMENT_MIME)
        .collect();
    info!(documents = documents.len(), "documents found");

    let http = reqwest::Client::builder()
        .timeout(config.http_timeout)
        .build()
        .context("failed to build http client")?;
    let site = SiteRef {
        owner: args.owner,
        repo: args.repo,
        branch: args.branch,
    };
    let base = config.admin_base.as_deref().unwrap_or(ADMIN_API_BASE);
    let admin = AdminClient::with_http(http, base, site).context("invalid admin base url")?;
    let operations: Vec<AdminOperation> = args.operation.into_iter().map(Into::into).collect();

    let ctx = Arc::new(PublishContext::new(
        admin,
        operations,
        context,
        config.max_retries,
    ));
    let summary = Scheduler::new(config.schedule_options())
        .with_cancellation(cancel)
        .process_all(documents, Arc::clone(&ctx), |item, ctx| async move {
            ctx.process(item).await
        })
        .await;

    save_run_report(config, "publish-report", ctx.reporter().drain(), &summary)
}

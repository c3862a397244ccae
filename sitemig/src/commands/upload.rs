use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cli::UploadArgs;
use crate::config::RunConfig;
use crate::sync::policy::SyncMode;
use crate::sync::report::format_size;
use crate::sync::scheduler::Scheduler;
use crate::sync::store::{DriveStore, RemoteFileStore};
use crate::sync::tree::RemoteTree;
use crate::sync::uploader::{UploadContext, UploadOptions, scan_local};

use super::{drive_client, save_run_report};

pub async fn run(
    config: &RunConfig,
    args: UploadArgs,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mode: SyncMode = args.mode.parse()?;
    let token = config.resolve_token(args.token.as_deref())?;
    let scan = scan_local(&args.source)
        .with_context(|| format!("unable to read source {}", args.source.display()))?;
    info!(
        files = scan.files.len(),
        folders = scan.dirs.len(),
        size = %format_size(scan.total_size()),
        %mode,
        target = %args.target,
        "uploading"
    );

    let store: Arc<dyn RemoteFileStore> = Arc::new(DriveStore::with_config(
        drive_client(config, &token)?,
        config.store_config(),
    ));
    let options = UploadOptions {
        mode,
        convert: !args.no_convert,
        backoff: config.backoff(),
        max_retries: config.max_retries,
    };
    let ctx = Arc::new(UploadContext::new(Arc::clone(&store), &args.target, options));
    ctx.pre_resolve(&scan.dirs)
        .await
        .context("failed to prepare remote folders")?;

    let total_size = scan.total_size();
    let summary = Scheduler::new(config.schedule_options())
        .with_cancellation(cancel)
        .process_all(scan.files, Arc::clone(&ctx), |item, ctx| async move {
            ctx.process(item).await
        })
        .await;

    if mode == SyncMode::ScanOnly {
        info!(
            files = summary.total,
            size = %format_size(total_size),
            "scan complete"
        );
    }
    if args.print_target {
        let tree = RemoteTree::new(store.as_ref(), config.backoff(), config.max_retries);
        for line in tree.render(&args.target).await? {
            println!("{line}");
        }
    }

    save_run_report(config, "upload-report", ctx.reporter().drain(), &summary)
}

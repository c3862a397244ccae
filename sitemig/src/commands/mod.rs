pub mod import;
pub mod publish;
pub mod upload;
pub mod urls;

use anyhow::Context;
use sitemig_core::DriveClient;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cli::{Cli, Command};
use crate::config::RunConfig;
use crate::sync::report::{ReportSummary, TransferRecord, format_elapsed, save_report};
use crate::sync::scheduler::ScheduleSummary;

pub async fn run(cli: Cli, cancel: CancellationToken) -> anyhow::Result<()> {
    let config = RunConfig::from_env().apply(&cli.global);
    match cli.command {
        Command::Import(args) => import::run(&config, args, cancel).await,
        Command::Upload(args) => upload::run(&config, args, cancel).await,
        Command::Publish(args) => publish::run(&config, args, cancel).await,
        Command::Urls(args) => urls::run(&config, args, cancel).await,
    }
}

pub(crate) fn drive_client(config: &RunConfig, token: &str) -> anyhow::Result<DriveClient> {
    let http = reqwest::Client::builder()
        .timeout(config.http_timeout)
        .build()
        .context("failed to build http client")?;
    let base = config
        .drive_api_base
        .as_deref()
        .unwrap_or(sitemig_core::DRIVE_API_BASE);
    DriveClient::with_http(http, base, token).context("invalid drive api base url")
}

/// Persists the run's rows and logs the final tally.
pub(crate) fn save_run_report(
    config: &RunConfig,
    default_name: &str,
    records: Vec<TransferRecord>,
    summary: &ScheduleSummary,
) -> anyhow::Result<()> {
    let counts = ReportSummary::from_records(&records);
    let name = config.report_name_or(default_name);
    let path = save_report(&records, &config.report_dir, &name, config.concatenate)
        .with_context(|| format!("failed to save report {name}"))?;
    info!(
        processed = summary.completed,
        failed = counts.error,
        skipped = counts.skipped,
        cancelled = summary.cancelled,
        elapsed = %format_elapsed(summary.elapsed),
        report = %path.display(),
        "done"
    );
    Ok(())
}

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};

use anyhow::Context;
use regex::{Captures, Regex};
use sitemig_core::{FetchError, FetchedPage, PageFetcher};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli::ImportArgs;
use crate::config::RunConfig;
use crate::inputs;
use crate::sync::backoff::{Backoff, RetryDecision};
use crate::sync::report::{TransferRecord, TransferReporter, format_elapsed};
use crate::sync::scheduler::{Scheduler, WorkItem};

use super::save_run_report;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid: {0}")]
    Invalid(u16),
    #[error("unsupported output type: {0}")]
    UnsupportedType(OutputType),
    #[error("conversion failed: {0}")]
    Convert(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputType {
    Html,
    Md,
    Docx,
}

impl OutputType {
    pub fn extension(self) -> &'static str {
        match self {
            OutputType::Html => "html",
            OutputType::Md => "md",
            OutputType::Docx => "docx",
        }
    }

    /// Parses `md|docx` or `md,docx`.
    pub fn parse_list(value: &str) -> anyhow::Result<Vec<Self>> {
        let mut types = Vec::new();
        for part in value.split(['|', ',']).map(str::trim).filter(|p| !p.is_empty()) {
            let parsed: OutputType = part.parse()?;
            if !types.contains(&parsed) {
                types.push(parsed);
            }
        }
        anyhow::ensure!(!types.is_empty(), "no output type given");
        Ok(types)
    }
}

impl fmt::Display for OutputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for OutputType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "html" => Ok(OutputType::Html),
            "md" => Ok(OutputType::Md),
            "docx" => Ok(OutputType::Docx),
            other => anyhow::bail!("Invalid file type \"{other}\""),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Converted {
    /// Sanitized document path below the import target, without extension.
    pub path: String,
    pub outputs: HashMap<OutputType, Vec<u8>>,
}

/// Turns a fetched page into saveable documents.
pub trait PageConverter: Send + Sync {
    fn name(&self) -> &'static str;
    fn supports(&self, output: OutputType) -> bool;
    fn convert(&self, page: &FetchedPage) -> Result<Converted, ImportError>;
}

static RELATIVE_SCHEME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\b(src|srcset)\s*=\s*(["'])//"#).expect("valid regex")
});

/// Stores the page markup as-is, with protocol-relative `src`/`srcset`
/// references made absolute using the page's scheme.
#[derive(Debug, Default, Clone, Copy)]
pub struct HtmlSnapshotConverter;

impl PageConverter for HtmlSnapshotConverter {
    fn name(&self) -> &'static str {
        "html snapshot"
    }

    fn supports(&self, output: OutputType) -> bool {
        output == OutputType::Html
    }

    fn convert(&self, page: &FetchedPage) -> Result<Converted, ImportError> {
        let scheme = page.url.scheme();
        let html = page.text();
        let fixed = RELATIVE_SCHEME.replace_all(&html, |caps: &Captures<'_>| {
            format!("{}={}{scheme}://", &caps[1], &caps[2])
        });
        Ok(Converted {
            path: document_path(page.url.path()),
            outputs: HashMap::from([(OutputType::Html, fixed.into_owned().into_bytes())]),
        })
    }
}

/// Lowercased slash path with every other character run replaced by `-`.
/// `/` maps to `/index` and `.html` suffixes are dropped.
pub fn document_path(url_path: &str) -> String {
    let trimmed = url_path.trim_end_matches('/');
    let trimmed = trimmed
        .strip_suffix(".html")
        .or_else(|| trimmed.strip_suffix(".htm"))
        .unwrap_or(trimmed);
    let segments: Vec<String> = trimmed
        .split('/')
        .map(sanitize_name)
        .filter(|s| !s.is_empty())
        .collect();
    if segments.is_empty() {
        return "/index".to_string();
    }
    format!("/{}", segments.join("/"))
}

pub fn sanitize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches('-').to_string()
}

pub struct ImportContext {
    fetcher: PageFetcher,
    converter: Arc<dyn PageConverter>,
    types: Vec<OutputType>,
    target: PathBuf,
    reporter: TransferReporter,
    backoff: Backoff,
    max_retries: u32,
    done: AtomicUsize,
    started: Instant,
}

impl ImportContext {
    pub fn new(
        fetcher: PageFetcher,
        converter: Arc<dyn PageConverter>,
        types: Vec<OutputType>,
        target: PathBuf,
        max_retries: u32,
    ) -> Result<Self, ImportError> {
        if let Some(unsupported) = types.iter().find(|t| !converter.supports(**t)) {
            return Err(ImportError::UnsupportedType(*unsupported));
        }
        Ok(Self {
            fetcher,
            converter,
            types,
            target,
            reporter: TransferReporter::new(),
            backoff: Backoff::default(),
            max_retries,
            done: AtomicUsize::new(0),
            started: Instant::now(),
        })
    }

    pub fn reporter(&self) -> &TransferReporter {
        &self.reporter
    }

    pub async fn process(&self, item: WorkItem<String>) -> Result<(), ImportError> {
        let url = item.value.as_str();
        let outcome = self.import_page(url).await;
        let done = self.done.fetch_add(1, Ordering::SeqCst) + 1;
        let elapsed = format_elapsed(self.started.elapsed());
        match outcome {
            Ok(record) => {
                info!("{done}/{}. {url} {}. Elapsed time: {elapsed}", item.total, record.message);
                self.reporter.record(record);
                Ok(())
            }
            Err(err) => {
                warn!("{done}/{}. {url} {err}", item.total);
                let message = match &err {
                    ImportError::Invalid(_) => err.to_string(),
                    _ => format!("Error: {err}"),
                };
                self.reporter.record(TransferRecord::error(url, message));
                Err(err)
            }
        }
    }

    async fn import_page(&self, url: &str) -> Result<TransferRecord, ImportError> {
        let page = self
            .backoff
            .execute(
                self.max_retries,
                |err: &FetchError| {
                    if err.is_retryable() {
                        RetryDecision::retry_after(err.retry_after())
                    } else {
                        RetryDecision::STOP
                    }
                },
                || self.fetcher.fetch_checked(url),
            )
            .await?;
        if !page.ok() {
            return Err(ImportError::Invalid(page.status.as_u16()));
        }
        if page.redirected() {
            return Ok(TransferRecord::skipped(
                url,
                None,
                format!("Redirect: {}", page.final_url),
            ));
        }

        let converted = self.converter.convert(&page)?;
        let mut saved = Vec::new();
        let mut size = 0u64;
        for output in &self.types {
            let Some(bytes) = converted.outputs.get(output) else {
                return Err(ImportError::UnsupportedType(*output));
            };
            let file = output_file(&self.target, &converted.path, *output);
            save_file(&file, bytes).await?;
            size += bytes.len() as u64;
            saved.push(file.display().to_string());
        }
        Ok(TransferRecord::success(
            url,
            Some(size),
            format!("Imported to {}", saved.join(", ")),
        ))
    }
}

fn output_file(target: &Path, doc_path: &str, output: OutputType) -> PathBuf {
    target.join(format!(
        "{}.{}",
        doc_path.trim_start_matches('/'),
        output.extension()
    ))
}

async fn save_file(path: &Path, bytes: &[u8]) -> Result<(), ImportError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, bytes).await?;
    Ok(())
}

pub async fn run(
    config: &RunConfig,
    args: ImportArgs,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let types = OutputType::parse_list(&args.output_type)?;
    let fetcher = PageFetcher::new(config.http_timeout).context("failed to build http client")?;
    let urls = inputs::load_urls(&args.urls, &fetcher, args.start, args.end)
        .await
        .with_context(|| format!("failed to load URL list {}", args.urls))?;
    tokio::fs::create_dir_all(&args.target)
        .await
        .with_context(|| format!("failed to create {}", args.target.display()))?;

    let converter: Arc<dyn PageConverter> = Arc::new(HtmlSnapshotConverter);
    info!(
        urls = urls.len(),
        converter = converter.name(),
        target = %args.target.display(),
        "importing"
    );
    let ctx = Arc::new(
        ImportContext::new(fetcher, converter, types, args.target, config.max_retries)
            .context("invalid import options")?,
    );
    let summary = Scheduler::new(config.schedule_options())
        .with_cancellation(cancel)
        .process_all(urls, Arc::clone(&ctx), |item, ctx| async move {
            ctx.process(item).await
        })
        .await;

    save_run_report(config, "import-report", ctx.reporter().drain(), &summary)
}

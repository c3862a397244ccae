use std::io::Write;
use std::path::Path;

use anyhow::Context;
use sitemig_core::PageFetcher;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use crate::cli::UrlsArgs;
use crate::config::RunConfig;
use crate::sitemap::{SitemapCollector, SitemapUrl, parse_filter, passes_filter, rewrite_to_host};
use crate::sync::report::format_elapsed;

/// Filters entries by lastmod and moves them onto `host`. Entries whose
/// location is not a valid URL are dropped with a warning.
pub fn select_urls(
    entries: &[SitemapUrl],
    host: &str,
    after: Option<time::OffsetDateTime>,
) -> Vec<String> {
    entries
        .iter()
        .filter(|entry| passes_filter(entry, after))
        .filter_map(|entry| match rewrite_to_host(&entry.loc, host) {
            Ok(url) => Some(url),
            Err(err) => {
                warn!(error = %err, "skipping sitemap entry");
                None
            }
        })
        .collect()
}

/// `.json` targets get a JSON array, anything else one URL per line.
pub fn write_urls(path: &Path, urls: &[String]) -> anyhow::Result<()> {
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let body = if is_json {
        serde_json::to_string_pretty(urls)?
    } else {
        let mut lines = urls.join("\n");
        if !lines.is_empty() {
            lines.push('\n');
        }
        lines
    };
    std::fs::write(path, body).with_context(|| format!("failed to write {}", path.display()))
}

pub async fn run(
    config: &RunConfig,
    args: UrlsArgs,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let started = Instant::now();
    let source = Url::parse(&args.source)
        .with_context(|| format!("invalid sitemap url {}", args.source))?;
    let host = source
        .host_str()
        .context("sitemap url has no host")?
        .to_string();
    let after = args.lastmod.as_deref().map(parse_filter).transpose()?;
    info!(source = %args.source, "getting URLs from sitemap");

    let fetcher = PageFetcher::new(config.http_timeout).context("failed to build http client")?;
    let entries = SitemapCollector::new(fetcher, config.schedule_options(), config.max_retries)
        .with_cancellation(cancel)
        .collect(&args.source)
        .await?;
    let urls = select_urls(&entries, &host, after);

    match &args.out {
        Some(path) => {
            write_urls(path, &urls)?;
            info!(path = %path.display(), "output written");
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            for url in &urls {
                writeln!(stdout, "{url}")?;
            }
        }
    }
    info!(
        "Extracted {} in {}",
        urls.len(),
        format_elapsed(started.elapsed())
    );
    Ok(())
}

use std::collections::HashSet;
use std::sync::{Arc, LazyLock, Mutex};

use regex::Regex;
use sitemig_core::{FetchError, PageFetcher};
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::sync::backoff::{Backoff, RetryDecision};
use crate::sync::scheduler::{ScheduleOptions, Scheduler};

#[derive(Debug, Error)]
pub enum SitemapError {
    #[error("failed to fetch sitemap {0}: {1}")]
    Fetch(String, #[source] FetchError),
    #[error("sitemap {url} returned {status}")]
    Status { url: String, status: u16 },
    #[error("invalid url {0}: {1}")]
    Url(String, #[source] url::ParseError),
    #[error("invalid lastmod filter: {0}")]
    Date(String),
}

static SITEMAP_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<sitemap\b[^>]*>(.*?)</sitemap>").expect("valid regex"));
static URL_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<url\b[^>]*>(.*?)</url>").expect("valid regex"));
static LOC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<loc\b[^>]*>\s*(?:<!\[CDATA\[)?(.*?)(?:\]\]>)?\s*</loc>").expect("valid regex")
});
static LASTMOD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<lastmod\b[^>]*>\s*(.*?)\s*</lastmod>").expect("valid regex")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SitemapUrl {
    pub loc: String,
    pub lastmod: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SitemapDoc {
    /// Nested sitemaps listed by a sitemap index.
    pub sitemaps: Vec<String>,
    pub urls: Vec<SitemapUrl>,
}

pub fn parse_sitemap(xml: &str) -> SitemapDoc {
    let loc_of = |block: &str| {
        LOC.captures(block)
            .and_then(|c| c.get(1))
            .map(|m| unescape(m.as_str().trim()))
            .filter(|loc| !loc.is_empty())
    };

    let sitemaps = SITEMAP_BLOCK
        .captures_iter(xml)
        .filter_map(|c| c.get(1).and_then(|m| loc_of(m.as_str())))
        .collect();
    let urls = URL_BLOCK
        .captures_iter(xml)
        .filter_map(|c| {
            let block = c.get(1)?.as_str();
            Some(SitemapUrl {
                loc: loc_of(block)?,
                lastmod: LASTMOD
                    .captures(block)
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str().to_string()),
            })
        })
        .collect();
    SitemapDoc { sitemaps, urls }
}

fn unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Accepts RFC 3339 timestamps or plain `YYYY-MM-DD` dates (midnight UTC).
pub fn parse_lastmod(value: &str) -> Option<OffsetDateTime> {
    let value = value.trim();
    if let Ok(ts) = OffsetDateTime::parse(value, &Rfc3339) {
        return Some(ts);
    }
    let date = value.get(..10).unwrap_or(value);
    Date::parse(date, format_description!("[year]-[month]-[day]"))
        .ok()
        .map(|d| d.midnight().assume_utc())
}

pub fn parse_filter(value: &str) -> Result<OffsetDateTime, SitemapError> {
    parse_lastmod(value).ok_or_else(|| SitemapError::Date(value.to_string()))
}

/// Entries pass when no filter is set or they were modified strictly after it.
pub fn passes_filter(entry: &SitemapUrl, after: Option<OffsetDateTime>) -> bool {
    match after {
        None => true,
        Some(after) => entry
            .lastmod
            .as_deref()
            .and_then(parse_lastmod)
            .is_some_and(|modified| modified > after),
    }
}

/// Rewrites `loc` onto the sitemap's host, keeping scheme and path.
pub fn rewrite_to_host(loc: &str, host: &str) -> Result<String, SitemapError> {
    let url = Url::parse(loc).map_err(|err| SitemapError::Url(loc.to_string(), err))?;
    Ok(format!("{}://{}{}", url.scheme(), host, url.path()))
}

pub struct SitemapCollector {
    fetcher: PageFetcher,
    options: ScheduleOptions,
    backoff: Backoff,
    max_retries: u32,
    cancel: CancellationToken,
}

struct RoundContext {
    fetcher: PageFetcher,
    backoff: Backoff,
    max_retries: u32,
    docs: Mutex<Vec<Option<SitemapDoc>>>,
}

impl SitemapCollector {
    pub fn new(fetcher: PageFetcher, options: ScheduleOptions, max_retries: u32) -> Self {
        Self {
            fetcher,
            options,
            backoff: Backoff::default(),
            max_retries,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Page URLs from `source` and every sitemap it nests, in document order.
    /// Nested sitemaps are fetched one level at a time through the scheduler;
    /// a nested sitemap that cannot be read is logged and skipped.
    pub async fn collect(&self, source: &str) -> Result<Vec<SitemapUrl>, SitemapError> {
        let root = fetch_doc(&self.fetcher, &self.backoff, self.max_retries, source).await?;
        let mut seen: HashSet<String> = HashSet::from([source.to_string()]);
        let mut urls = root.urls;
        let mut pending: Vec<String> = root
            .sitemaps
            .into_iter()
            .filter(|loc| seen.insert(loc.clone()))
            .collect();

        while !pending.is_empty() && !self.cancel.is_cancelled() {
            debug!(sitemaps = pending.len(), "fetching nested sitemaps");
            let round = std::mem::take(&mut pending);
            let ctx = Arc::new(RoundContext {
                fetcher: self.fetcher.clone(),
                backoff: self.backoff,
                max_retries: self.max_retries,
                docs: Mutex::new(vec![None; round.len()]),
            });
            Scheduler::new(self.options)
                .with_cancellation(self.cancel.clone())
                .process_all(round, Arc::clone(&ctx), |item, ctx| async move {
                    let doc = fetch_doc(&ctx.fetcher, &ctx.backoff, ctx.max_retries, &item.value)
                        .await?;
                    if let Ok(mut docs) = ctx.docs.lock() {
                        docs[item.index] = Some(doc);
                    }
                    Ok::<(), SitemapError>(())
                })
                .await;

            let docs = match ctx.docs.lock() {
                Ok(mut docs) => std::mem::take(&mut *docs),
                Err(_) => Vec::new(),
            };
            for doc in docs.into_iter().flatten() {
                urls.extend(doc.urls);
                pending.extend(doc.sitemaps.into_iter().filter(|loc| seen.insert(loc.clone())));
            }
        }
        info!(urls = urls.len(), sitemaps = seen.len(), "sitemap expanded");
        Ok(urls)
    }
}

async fn fetch_doc(
    fetcher: &PageFetcher,
    backoff: &Backoff,
    max_retries: u32,
    url: &str,
) -> Result<SitemapDoc, SitemapError> {
    let page = backoff
        .execute(
            max_retries,
            |err: &FetchError| {
                if err.is_retryable() {
                    RetryDecision::retry_after(err.retry_after())
                } else {
                    RetryDecision::STOP
                }
            },
            || fetcher.fetch_checked(url),
        )
        .await
        .map_err(|err| SitemapError::Fetch(url.to_string(), err))?;
    if !page.ok() {
        return Err(SitemapError::Status {
            url: url.to_string(),
            status: page.status.as_u16(),
        });
    }
    Ok(parse_sitemap(&page.text()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use time::macros::datetime;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const URLSET: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <url>
    <loc>https://www.example.com/en/about?x=1&amp;y=2</loc>
    <lastmod>2024-03-01</lastmod>
  </url>
  <url><loc><![CDATA[https://www.example.com/en/news]]></loc><lastmod>2023-12-24T10:00:00+00:00</lastmod></url>
  <url><loc>https://www.example.com/en/legacy</loc></url>
</urlset>"#;

    #[test]
    fn parses_url_entries() {
        let doc = parse_sitemap(URLSET);
        assert!(doc.sitemaps.is_empty());
        assert_eq!(doc.urls.len(), 3);
        assert_eq!(doc.urls[0].loc, "https://www.example.com/en/about?x=1&y=2");
        assert_eq!(doc.urls[0].lastmod.as_deref(), Some("2024-03-01"));
        assert_eq!(doc.urls[1].loc, "https://www.example.com/en/news");
        assert_eq!(doc.urls[2].lastmod, None);
    }

    #[test]
    fn parses_sitemap_index() {
        let doc = parse_sitemap(
            "<sitemapindex><sitemap><loc> https://a.test/s1.xml </loc></sitemap>\
             <sitemap><loc>https://a.test/s2.xml</loc><lastmod>2024-01-01</lastmod></sitemap></sitemapindex>",
        );
        assert_eq!(doc.sitemaps, ["https://a.test/s1.xml", "https://a.test/s2.xml"]);
        assert!(doc.urls.is_empty());
    }

    #[test]
    fn filters_by_lastmod() {
        let doc = parse_sitemap(URLSET);
        let after = Some(parse_filter("2024-01-01").unwrap());
        let kept: Vec<_> = doc
            .urls
            .iter()
            .filter(|u| passes_filter(u, after))
            .map(|u| u.loc.as_str())
            .collect();
        assert_eq!(kept, ["https://www.example.com/en/about?x=1&y=2"]);
        assert!(doc.urls.iter().all(|u| passes_filter(u, None)));
        assert_eq!(
            parse_lastmod("2023-12-24T10:00:00+00:00"),
            Some(datetime!(2023-12-24 10:00 UTC))
        );
        assert!(parse_filter("last tuesday").is_err());
    }

    #[test]
    fn rewrites_onto_sitemap_host() {
        assert_eq!(
            rewrite_to_host("https://cdn.example.com/en/about?x=1", "www.example.com").unwrap(),
            "https://www.example.com/en/about"
        );
        assert!(rewrite_to_host("not a url", "www.example.com").is_err());
    }

    #[tokio::test]
    async fn expands_nested_sitemaps() {
        let server = MockServer::start().await;
        let base = server.uri();
        Mock::given(method("GET"))
            .and(path("/sitemap.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                "<sitemapindex><sitemap><loc>{base}/a.xml</loc></sitemap>\
                 <sitemap><loc>{base}/missing.xml</loc></sitemap>\
                 <sitemap><loc>{base}/a.xml</loc></sitemap></sitemapindex>"
            )))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/a.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                "<sitemapindex><sitemap><loc>{base}/b.xml</loc></sitemap></sitemapindex>\
                 <urlset><url><loc>{base}/one</loc></url></urlset>"
            )))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/b.xml"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(format!("<urlset><url><loc>{base}/two</loc></url></urlset>")),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/missing.xml"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let collector = SitemapCollector::new(
            PageFetcher::new(Duration::from_secs(5)).unwrap(),
            ScheduleOptions::new(4, Duration::ZERO),
            0,
        );
        let urls: Vec<_> = collector
            .collect(&format!("{base}/sitemap.xml"))
            .await
            .unwrap()
            .into_iter()
            .map(|u| u.loc)
            .collect();
        assert_eq!(urls, [format!("{base}/one"), format!("{base}/two")]);
    }

    #[tokio::test]
    async fn unreadable_root_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let collector = SitemapCollector::new(
            PageFetcher::new(Duration::from_secs(5)).unwrap(),
            ScheduleOptions::default(),
            0,
        );
        let err = collector
            .collect(&format!("{}/sitemap.xml", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, SitemapError::Status { status: 404, .. }));
    }
}

use std::time::Duration;

use reqwest::{Client, StatusCode};
use thiserror::Error;
use url::Url;

use crate::classify::{self, ApiErrorClass};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("server returned {status} for {url}")]
    Status {
        url: Url,
        status: StatusCode,
        retry_after: Option<Duration>,
    },
}

impl FetchError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            FetchError::Status { status, .. } => Some(classify::classify_api_status(*status, "")),
            FetchError::Request(err) => Some(classify::classify_request_error(err)),
            FetchError::Url(_) => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.classification()
            .is_some_and(ApiErrorClass::is_retryable)
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            FetchError::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: Url,
    pub final_url: Url,
    pub status: StatusCode,
    pub body: Vec<u8>,
}

impl FetchedPage {
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    pub fn redirected(&self) -> bool {
        self.final_url != self.url
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Fetches source pages and sitemaps. Redirects are followed by the client
/// and surfaced through [`FetchedPage::redirected`].
#[derive(Clone)]
pub struct PageFetcher {
    http: Client,
}

impl PageFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }

    pub fn with_http(http: Client) -> Self {
        Self { http }
    }

    pub async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let url = Url::parse(url)?;
        let response = self.http.get(url.clone()).send().await?;
        let status = response.status();
        let final_url = response.url().clone();
        let body = response.bytes().await?.to_vec();
        Ok(FetchedPage {
            url,
            final_url,
            status,
            body,
        })
    }

    /// Fetches and turns retryable statuses (429, 5xx) into errors so callers
    /// can hand them to a backoff loop; other statuses are returned as pages.
    pub async fn fetch_checked(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let url_parsed = Url::parse(url)?;
        let response = self.http.get(url_parsed.clone()).send().await?;
        let status = response.status();
        if classify::classify_api_status(status, "").is_retryable() {
            return Err(FetchError::Status {
                url: url_parsed,
                status,
                retry_after: classify::retry_after(response.headers()),
            });
        }
        let final_url = response.url().clone();
        let body = response.bytes().await?.to_vec();
        Ok(FetchedPage {
            url: url_parsed,
            final_url,
            status,
            body,
        })
    }
}

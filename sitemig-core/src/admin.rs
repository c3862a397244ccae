use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use reqwest::{Client, Method, StatusCode};
use thiserror::Error;
use url::Url;

use crate::classify::{self, ApiErrorClass};

pub const ADMIN_API_BASE: &str = "https://admin.hlx.page";

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("{operation} returned {status}: {body}")]
    Api {
        operation: AdminOperation,
        status: StatusCode,
        body: String,
        retry_after: Option<Duration>,
    },
    #[error("unknown admin operation: {0}")]
    UnknownOperation(String),
}

impl AdminError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            AdminError::Api { status, body, .. } => {
                Some(classify::classify_api_status(*status, body))
            }
            AdminError::Request(err) => Some(classify::classify_request_error(err)),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.classification()
            .is_some_and(ApiErrorClass::is_retryable)
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AdminError::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdminOperation {
    Preview,
    Live,
    Index,
    Cache,
    Status,
}

impl AdminOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            AdminOperation::Preview => "preview",
            AdminOperation::Live => "live",
            AdminOperation::Index => "index",
            AdminOperation::Cache => "cache",
            AdminOperation::Status => "status",
        }
    }

    pub fn method(self) -> Method {
        match self {
            AdminOperation::Status => Method::GET,
            _ => Method::POST,
        }
    }
}

impl fmt::Display for AdminOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AdminOperation {
    type Err = AdminError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "preview" => Ok(AdminOperation::Preview),
            "live" | "publish" => Ok(AdminOperation::Live),
            "index" => Ok(AdminOperation::Index),
            "cache" => Ok(AdminOperation::Cache),
            "status" => Ok(AdminOperation::Status),
            other => Err(AdminError::UnknownOperation(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteRef {
    pub owner: String,
    pub repo: String,
    pub branch: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminResponse {
    pub status: StatusCode,
    pub body: String,
}

impl AdminResponse {
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }
}

/// Client for per-document admin operations (preview, publish, index, ...).
#[derive(Clone)]
pub struct AdminClient {
    http: Client,
    base_url: Url,
    site: SiteRef,
}

impl AdminClient {
    pub fn new(site: SiteRef) -> Result<Self, AdminError> {
        Self::with_base_url(ADMIN_API_BASE, site)
    }

    pub fn with_base_url(base_url: &str, site: SiteRef) -> Result<Self, AdminError> {
        Self::with_http(Client::new(), base_url, site)
    }

    pub fn with_http(http: Client, base_url: &str, site: SiteRef) -> Result<Self, AdminError> {
        Ok(Self {
            http,
            base_url: Url::parse(base_url)?,
            site,
        })
    }

    /// `<base>/<operation>/<owner>/<repo>/<branch><path>`
    pub fn endpoint(&self, operation: AdminOperation, path: &str) -> Result<Url, AdminError> {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        let relative = format!(
            "/{}/{}/{}/{}{}",
            operation.as_str(),
            self.site.owner,
            self.site.repo,
            self.site.branch,
            path
        );
        Ok(self.base_url.join(&relative)?)
    }

    /// Returns the raw response; non-success statuses are reported through
    /// [`AdminResponse::ok`] rather than as an error.
    pub async fn invoke(
        &self,
        operation: AdminOperation,
        path: &str,
    ) -> Result<AdminResponse, AdminError> {
        let url = self.endpoint(operation, path)?;
        let response = self
            .http
            .request(operation.method(), url)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Ok(AdminResponse { status, body })
    }

    /// Like [`invoke`](Self::invoke) but converts non-success statuses into
    /// [`AdminError::Api`] so they can be classified for retry.
    pub async fn run(
        &self,
        operation: AdminOperation,
        path: &str,
    ) -> Result<AdminResponse, AdminError> {
        let url = self.endpoint(operation, path)?;
        let response = self
            .http
            .request(operation.method(), url)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Ok(AdminResponse { status, body });
        }
        let retry_after = classify::retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        Err(AdminError::Api {
            operation,
            status,
            body,
            retry_after,
        })
    }
}

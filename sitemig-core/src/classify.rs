use std::time::{Duration, SystemTime};

use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

impl ApiErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, ApiErrorClass::RateLimit | ApiErrorClass::Transient)
    }
}

// Drive reports quota exhaustion as 403 with one of these reasons in the body.
const RATE_LIMIT_REASONS: &[&str] = &["rateLimitExceeded", "userRateLimitExceeded"];

pub fn classify_api_status(status: StatusCode, body: &str) -> ApiErrorClass {
    if status == StatusCode::FORBIDDEN && RATE_LIMIT_REASONS.iter().any(|r| body.contains(r)) {
        ApiErrorClass::RateLimit
    } else if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(status, StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_EARLY)
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

pub fn classify_request_error(err: &reqwest::Error) -> ApiErrorClass {
    if err.is_timeout() || err.is_connect() {
        ApiErrorClass::Transient
    } else if let Some(status) = err.status() {
        classify_api_status(status, "")
    } else {
        ApiErrorClass::Permanent
    }
}

/// Reads a `Retry-After` header given either as delta-seconds or as an HTTP date.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = httpdate::parse_http_date(value).ok()?;
    Some(
        at.duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO),
    )
}

use std::path::Path;

use serde_json::Value;
use sitemig_core::{FetchError, PageFetcher};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InputError {
    #[error("failed to fetch {0}: {1}")]
    Fetch(String, #[source] FetchError),
    #[error("{url} returned {status}")]
    Status { url: String, status: u16 },
    #[error("failed to read {0}: {1}")]
    Io(String, #[source] std::io::Error),
    #[error("unable to load JSON for {0}: must be valid JSON, or a path or URL to a JSON file")]
    NotJson(String),
    #[error("expected a JSON array of URLs")]
    NotAnArray,
    #[error("entry {0} is not a URL string")]
    BadEntry(usize),
}

/// Loads JSON given inline, as a local path, or as an http(s) URL.
pub async fn as_json(arg: &str, fetcher: &PageFetcher) -> Result<Value, InputError> {
    if let Ok(value) = serde_json::from_str::<Value>(arg)
        && (value.is_array() || value.is_object())
    {
        return Ok(value);
    }

    let raw = if arg.starts_with("https://") || arg.starts_with("http://") {
        let page = fetcher
            .fetch(arg)
            .await
            .map_err(|err| InputError::Fetch(arg.to_string(), err))?;
        if !page.ok() {
            return Err(InputError::Status {
                url: arg.to_string(),
                status: page.status.as_u16(),
            });
        }
        page.text()
    } else {
        tokio::fs::read_to_string(Path::new(arg))
            .await
            .map_err(|err| InputError::Io(arg.to_string(), err))?
    };
    serde_json::from_str(&raw).map_err(|_| InputError::NotJson(arg.to_string()))
}

/// URL list entries are strings or objects carrying a `url`/`URL` field.
pub fn url_list(value: &Value) -> Result<Vec<String>, InputError> {
    let entries = value.as_array().ok_or(InputError::NotAnArray)?;
    entries
        .iter()
        .enumerate()
        .map(|(index, entry)| match entry {
            Value::String(url) => Ok(url.trim().to_string()),
            Value::Object(map) => map
                .get("url")
                .or_else(|| map.get("URL"))
                .and_then(Value::as_str)
                .map(|url| url.trim().to_string())
                .ok_or(InputError::BadEntry(index)),
            _ => Err(InputError::BadEntry(index)),
        })
        .collect()
}

/// `items[start..end]`, clamped to the list.
pub fn slice_range<T>(mut items: Vec<T>, start: Option<usize>, end: Option<usize>) -> Vec<T> {
    let len = items.len();
    let end = end.unwrap_or(len).min(len);
    let start = start.unwrap_or(0).min(end);
    items.truncate(end);
    items.drain(..start);
    items
}

pub async fn load_urls(
    arg: &str,
    fetcher: &PageFetcher,
    start: Option<usize>,
    end: Option<usize>,
) -> Result<Vec<String>, InputError> {
    let value = as_json(arg, fetcher).await?;
    Ok(slice_range(url_list(&value)?, start, end))
}

use std::path::Path;
use std::time::Duration;

use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tokio_util::io::ReaderStream;
use url::Url;

use crate::classify::{self, ApiErrorClass};

pub const DRIVE_API_BASE: &str = "https://www.googleapis.com";
const FILE_FIELDS: &str = "id,name,mimeType,size,modifiedTime,parents";
const PAGE_SIZE: &str = "1000";

pub const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
pub const DOCUMENT_MIME: &str = "application/vnd.google-apps.document";
pub const DOCX_MIME: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("api returned {status}: {body}")]
    Api {
        status: StatusCode,
        body: String,
        retry_after: Option<Duration>,
    },
    #[error("upload session response missing location header")]
    MissingUploadLocation,
}

impl DriveError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            DriveError::Api { status, body, .. } => {
                Some(classify::classify_api_status(*status, body))
            }
            DriveError::Request(err) => Some(classify::classify_request_error(err)),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.classification()
            .is_some_and(ApiErrorClass::is_retryable)
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            DriveError::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            DriveError::Api { status, .. } => Some(*status),
            DriveError::Request(err) => err.status(),
            _ => None,
        }
    }
}

/// Builder for the `q` expression of `files.list`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileQuery {
    pub parent: Option<String>,
    pub name: Option<String>,
    pub mime_type: Option<String>,
    pub include_trashed: bool,
}

impl FileQuery {
    pub fn in_folder(parent: impl Into<String>) -> Self {
        Self {
            parent: Some(parent.into()),
            ..Self::default()
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn to_q(&self) -> String {
        let mut clauses = Vec::new();
        if let Some(parent) = &self.parent {
            clauses.push(format!("'{}' in parents", escape_literal(parent)));
        }
        if let Some(name) = &self.name {
            clauses.push(format!("name = '{}'", escape_literal(name)));
        }
        if let Some(mime_type) = &self.mime_type {
            clauses.push(format!("mimeType = '{}'", escape_literal(mime_type)));
        }
        if !self.include_trashed {
            clauses.push("trashed = false".to_string());
        }
        clauses.join(" and ")
    }
}

fn escape_literal(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Metadata for a file or folder about to be created or copied.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<String>,
}

#[derive(Clone)]
pub struct DriveClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl DriveClient {
    pub fn new(token: impl Into<String>) -> Result<Self, DriveError> {
        Self::with_base_url(DRIVE_API_BASE, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, DriveError> {
        Self::with_http(Client::new(), base_url, token)
    }

    pub fn with_http(
        http: Client,
        base_url: &str,
        token: impl Into<String>,
    ) -> Result<Self, DriveError> {
        Ok(Self {
            http,
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    pub async fn get_file(&self, id: &str) -> Result<DriveFile, DriveError> {
        let mut url = self.endpoint(&format!("/drive/v3/files/{id}"))?;
        url.query_pairs_mut().append_pair("fields", FILE_FIELDS);
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn list_files_page(
        &self,
        query: &FileQuery,
        page_token: Option<&str>,
    ) -> Result<FileList, DriveError> {
        let mut url = self.endpoint("/drive/v3/files")?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("q", &query.to_q());
            pairs.append_pair("fields", &format!("nextPageToken,files({FILE_FIELDS})"));
            pairs.append_pair("pageSize", PAGE_SIZE);
            if let Some(token) = page_token {
                pairs.append_pair("pageToken", token);
            }
        }
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn list_files(&self, query: &FileQuery) -> Result<Vec<DriveFile>, DriveError> {
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let page = self.list_files_page(query, page_token.as_deref()).await?;
            files.extend(page.files);
            match page.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => break,
            }
        }
        Ok(files)
    }

    pub async fn create_folder(&self, parent_id: &str, name: &str) -> Result<DriveFile, DriveError> {
        let metadata = FileMetadata {
            name: name.to_string(),
            mime_type: Some(FOLDER_MIME.to_string()),
            parents: vec![parent_id.to_string()],
        };
        let mut url = self.endpoint("/drive/v3/files")?;
        url.query_pairs_mut().append_pair("fields", FILE_FIELDS);
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(&metadata)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Starts a resumable upload session and returns the session URL.
    pub async fn start_upload_session(
        &self,
        metadata: &FileMetadata,
        content_type: &str,
        content_length: u64,
    ) -> Result<Url, DriveError> {
        let mut url = self.endpoint("/upload/drive/v3/files")?;
        url.query_pairs_mut()
            .append_pair("uploadType", "resumable")
            .append_pair("fields", FILE_FIELDS);
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .header("X-Upload-Content-Type", content_type)
            .header("X-Upload-Content-Length", content_length)
            .json(metadata)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .ok_or(DriveError::MissingUploadLocation)?;
        Ok(Url::parse(location)?)
    }

    pub async fn upload_file(
        &self,
        metadata: &FileMetadata,
        content_type: &str,
        source: &Path,
    ) -> Result<DriveFile, DriveError> {
        let file = tokio::fs::File::open(source).await?;
        let length = file.metadata().await?.len();
        let session = self
            .start_upload_session(metadata, content_type, length)
            .await?;
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let response = self
            .http
            .put(session)
            .bearer_auth(&self.token)
            .header(CONTENT_TYPE, content_type)
            .header(CONTENT_LENGTH, length)
            .body(body)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn copy_file(
        &self,
        id: &str,
        metadata: &FileMetadata,
    ) -> Result<DriveFile, DriveError> {
        let mut url = self.endpoint(&format!("/drive/v3/files/{id}/copy"))?;
        url.query_pairs_mut().append_pair("fields", FILE_FIELDS);
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(metadata)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn delete_file(&self, id: &str) -> Result<(), DriveError> {
        let url = self.endpoint(&format!("/drive/v3/files/{id}"))?;
        let response = self
            .http
            .delete(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        if response.status().is_success() {
            return Ok(());
        }
        Err(Self::api_error(response).await)
    }

    fn endpoint(&self, path: &str) -> Result<Url, DriveError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, DriveError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            Err(Self::api_error(response).await)
        }
    }

    async fn api_error(response: reqwest::Response) -> DriveError {
        let status = response.status();
        let retry_after = classify::retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        DriveError::Api {
            status,
            body,
            retry_after,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default, deserialize_with = "size_from_string")]
    pub size: Option<u64>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub modified_time: Option<OffsetDateTime>,
    #[serde(default)]
    pub parents: Vec<String>,
}

impl DriveFile {
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileList {
    #[serde(default)]
    pub files: Vec<DriveFile>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

// Drive encodes int64 fields as JSON strings.
fn size_from_string<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Text(String),
        Number(u64),
    }

    match Option::<Size>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Size::Number(n)) => Ok(Some(n)),
        Some(Size::Text(s)) => s.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_escapes_quotes_and_excludes_trash() {
        let q = FileQuery::in_folder("root")
            .named("Bob's notes")
            .with_mime_type(FOLDER_MIME)
            .to_q();
        assert_eq!(
            q,
            "'root' in parents and name = 'Bob\\'s notes' and \
             mimeType = 'application/vnd.google-apps.folder' and trashed = false"
        );
    }

    #[test]
    fn drive_file_parses_string_size() {
        let file: DriveFile = serde_json::from_str(
            r#"{"id":"1","name":"a.docx","mimeType":"x","size":"42",
                "modifiedTime":"2024-01-05T00:00:00.000Z"}"#,
        )
        .unwrap();
        assert_eq!(file.size, Some(42));
        assert_eq!(file.modified_time.unwrap().unix_timestamp(), 1_704_412_800);
        assert!(file.parents.is_empty());
    }
}

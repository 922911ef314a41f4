//! Drive-style REST implementation of [`BlobStore`].
//!
//! Objects live in the provider's `appDataFolder` space, which is private
//! to this OAuth client and invisible in the user's file browser. Creates
//! use a `multipart/related` upload (metadata + media); replacements PATCH
//! the media of the existing file id.

use crate::blob_store::{BlobInfo, BlobStore, BlobStoreError, BlobStoreResult};
use crate::config::SyncConfig;
use crate::error::{CloudError, CloudResult};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const APP_DATA_FOLDER: &str = "appDataFolder";
const MULTIPART_BOUNDARY: &str = "tabsync-upload-boundary";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<FileEntry>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct FileEntry {
    id: String,
    name: String,
    /// Drive reports sizes as decimal strings.
    size: Option<String>,
}

#[derive(Deserialize)]
struct FileId {
    id: String,
}

/// Blob store backed by a Drive-compatible REST API.
pub struct DriveBlobStore {
    client: Client,
    api_base_url: String,
    upload_base_url: String,
}

impl DriveBlobStore {
    pub fn new(config: &SyncConfig) -> CloudResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .map_err(|e| CloudError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_base_url: config.drive_api_base_url.trim_end_matches('/').to_string(),
            upload_base_url: config.drive_upload_base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn query_files(&self, access_token: &str, query: &str) -> BlobStoreResult<Vec<BlobInfo>> {
        let url = format!("{}/files", self.api_base_url);
        let mut page_token: Option<String> = None;
        let mut out = Vec::new();

        loop {
            let mut request = self
                .client
                .get(&url)
                .bearer_auth(access_token)
                .query(&[
                    ("spaces", APP_DATA_FOLDER),
                    ("q", query),
                    ("fields", "nextPageToken, files(id, name, size)"),
                    ("pageSize", "1000"),
                ]);
            if let Some(ref token) = page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }

            let resp = check_status(request.send().await.map_err(transport_error)?).await?;
            let page: FileList = resp.json().await.map_err(transport_error)?;

            out.extend(page.files.into_iter().map(|f| BlobInfo {
                size: f.size.and_then(|s| s.parse().ok()).unwrap_or(0),
                id: f.id,
                name: f.name,
            }));

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(out)
    }

    async fn create(
        &self,
        access_token: &str,
        name: &str,
        bytes: Vec<u8>,
        parent: &str,
    ) -> BlobStoreResult<String> {
        let metadata = serde_json::json!({ "name": name, "parents": [parent] });
        let body = multipart_related_body(&metadata.to_string(), &bytes);

        let url = format!("{}/files", self.upload_base_url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(access_token)
            .query(&[("uploadType", "multipart"), ("fields", "id")])
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={MULTIPART_BOUNDARY}"),
            )
            .body(body)
            .send()
            .await
            .map_err(transport_error)?;

        let created: FileId = check_status(resp).await?.json().await.map_err(transport_error)?;
        Ok(created.id)
    }

    async fn replace(&self, access_token: &str, id: &str, bytes: Vec<u8>) -> BlobStoreResult<String> {
        let url = format!("{}/files/{id}", self.upload_base_url);
        let resp = self
            .client
            .patch(&url)
            .bearer_auth(access_token)
            .query(&[("uploadType", "media"), ("fields", "id")])
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes)
            .send()
            .await
            .map_err(transport_error)?;

        let updated: FileId = check_status(resp).await?.json().await.map_err(transport_error)?;
        Ok(updated.id)
    }
}

#[async_trait]
impl BlobStore for DriveBlobStore {
    async fn upload(
        &self,
        access_token: &str,
        name: &str,
        bytes: Vec<u8>,
        parent: Option<&str>,
    ) -> BlobStoreResult<String> {
        let size = bytes.len();
        let id = match self.find_by_name(access_token, name, parent).await? {
            Some(existing) => self.replace(access_token, &existing, bytes).await?,
            None => {
                self.create(access_token, name, bytes, parent.unwrap_or(APP_DATA_FOLDER))
                    .await?
            }
        };
        debug!("uploaded {size} bytes as {name} ({id})");
        Ok(id)
    }

    async fn download(&self, access_token: &str, id: &str) -> BlobStoreResult<Vec<u8>> {
        let url = format!("{}/files/{id}", self.api_base_url);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(access_token)
            .query(&[("alt", "media")])
            .send()
            .await
            .map_err(transport_error)?;

        let bytes = check_status(resp).await?.bytes().await.map_err(transport_error)?;
        debug!("downloaded {} bytes from {id}", bytes.len());
        Ok(bytes.to_vec())
    }

    async fn delete(&self, access_token: &str, id: &str) -> BlobStoreResult<()> {
        let url = format!("{}/files/{id}", self.api_base_url);
        let resp = self
            .client
            .delete(&url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(transport_error)?;

        check_status(resp).await?;
        Ok(())
    }

    async fn find_by_name(
        &self,
        access_token: &str,
        name: &str,
        parent: Option<&str>,
    ) -> BlobStoreResult<Option<String>> {
        let query = format!(
            "name = '{}' and '{}' in parents and trashed = false",
            escape_query(name),
            escape_query(parent.unwrap_or(APP_DATA_FOLDER))
        );
        let files = self.query_files(access_token, &query).await?;
        Ok(files.into_iter().next().map(|f| f.id))
    }

    async fn list(&self, access_token: &str, parent: Option<&str>) -> BlobStoreResult<Vec<BlobInfo>> {
        let query = format!(
            "'{}' in parents and trashed = false",
            escape_query(parent.unwrap_or(APP_DATA_FOLDER))
        );
        self.query_files(access_token, &query).await
    }
}

/// Escapes a value for a Drive `q` string literal.
fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

fn multipart_related_body(metadata_json: &str, media: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(media.len() + metadata_json.len() + 256);
    body.extend_from_slice(
        format!(
            "--{MULTIPART_BOUNDARY}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{metadata_json}\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(
        format!("--{MULTIPART_BOUNDARY}\r\nContent-Type: application/octet-stream\r\n\r\n").as_bytes(),
    );
    body.extend_from_slice(media);
    body.extend_from_slice(format!("\r\n--{MULTIPART_BOUNDARY}--\r\n").as_bytes());
    body
}

fn transport_error(err: reqwest::Error) -> BlobStoreError {
    BlobStoreError::Other(err.to_string())
}

/// Maps non-success responses onto the transport error taxonomy.
async fn check_status(resp: Response) -> BlobStoreResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let body = resp.text().await.unwrap_or_default();
    Err(map_status(status, &body))
}

pub(crate) fn map_status(status: StatusCode, body: &str) -> BlobStoreError {
    match status {
        StatusCode::UNAUTHORIZED => BlobStoreError::Unauthorized,
        StatusCode::FORBIDDEN if body.contains("storageQuotaExceeded") => BlobStoreError::StorageFull,
        StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS => {
            BlobStoreError::ForbiddenOrRateLimited(format!("HTTP {}", status.as_u16()))
        }
        StatusCode::NOT_FOUND => BlobStoreError::NotFound(body.chars().take(200).collect()),
        StatusCode::PAYLOAD_TOO_LARGE => BlobStoreError::PayloadTooLarge,
        StatusCode::INSUFFICIENT_STORAGE => BlobStoreError::StorageFull,
        other => BlobStoreError::Other(format!(
            "HTTP {}: {}",
            other.as_u16(),
            body.chars().take(200).collect::<String>()
        )),
    }
}

//! Google Drive v3 REST client scoped to the application data folder.
//!
//! Handles bearer authentication, exponential backoff retry on throttling and
//! server errors, multipart/related uploads, and mapping HTTP failures onto the
//! blob store error categories.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use pv_core::config::{RemoteConfig, ENV_ACCESS_TOKEN};
use pv_core::constants::APP_DATA_FOLDER;
use pv_core::error::{PvError, PvResult};

use crate::blob::{BlobQuery, BlobStore, NewBlob, RemoteBlob};

const FILE_FIELDS: &str = "id,name,mimeType,properties";
const LIST_FIELDS: &str = "nextPageToken,files(id,name,mimeType,properties)";

/// Retry configuration for Drive requests.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts.
    pub max_retries: u32,
    /// Base delay between retries (doubles each attempt).
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
    /// HTTP status codes that trigger a retry.
    pub retryable_statuses: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
            retryable_statuses: vec![429, 500, 502, 503, 504],
        }
    }
}

/// Request body that can be replayed on retry.
#[derive(Debug, Clone)]
struct RequestBody {
    content_type: String,
    bytes: Vec<u8>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<RemoteBlob>,
    next_page_token: Option<String>,
}

/// Drive client implementing [`BlobStore`].
#[derive(Clone)]
pub struct DriveClient {
    inner: Client,
    api_root: String,
    upload_root: String,
    access_token: String,
    retry_config: RetryConfig,
}

impl DriveClient {
    /// Create a client from the `[remote]` section, resolving the token from
    /// the environment or the config file.
    pub fn new(config: &RemoteConfig) -> PvResult<Self> {
        let token = config.effective_access_token().ok_or_else(|| {
            PvError::Config(format!("no Drive access token configured (set {ENV_ACCESS_TOKEN})"))
        })?;
        Self::with_token(config, token)
    }

    /// Create a client with an explicit bearer token.
    pub fn with_token(config: &RemoteConfig, access_token: impl Into<String>) -> PvResult<Self> {
        let inner = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .connect_timeout(Duration::from_secs(15))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| PvError::Http(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            inner,
            api_root: config.api_root.trim_end_matches('/').to_string(),
            upload_root: config.upload_root.trim_end_matches('/').to_string(),
            access_token: access_token.into(),
            retry_config: RetryConfig::default(),
        })
    }

    /// Set custom retry configuration.
    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = config;
        self
    }

    pub fn api_root(&self) -> &str {
        &self.api_root
    }

    /// Execute a request with exponential backoff retry.
    async fn request_with_retry(
        &self,
        method: Method,
        url: &str,
        query: &[(&str, String)],
        body: Option<&RequestBody>,
    ) -> PvResult<Response> {
        debug!("{method} {url}");

        let mut last_error: Option<PvError> = None;

        for attempt in 0..=self.retry_config.max_retries {
            if attempt > 0 {
                let delay = self.calculate_retry_delay(attempt - 1);
                warn!(
                    "retrying {method} {url} (attempt {}/{}) after {:.1}s",
                    attempt + 1,
                    self.retry_config.max_retries + 1,
                    delay.as_secs_f64()
                );
                tokio::time::sleep(delay).await;
            }

            let mut builder = self
                .inner
                .request(method.clone(), url)
                .bearer_auth(&self.access_token)
                .query(query);
            if let Some(b) = body {
                builder = builder
                    .header(reqwest::header::CONTENT_TYPE, b.content_type.as_str())
                    .body(b.bytes.clone());
            }

            match builder.send().await {
                Ok(response) => {
                    let status = response.status();
                    if self.retry_config.retryable_statuses.contains(&status.as_u16())
                        && attempt < self.retry_config.max_retries
                    {
                        warn!("retryable status {} from {url}", status.as_u16());
                        last_error = Some(PvError::Http(format!("retryable status {status}")));
                        continue;
                    }
                    return Self::check_status(response).await;
                }
                Err(e) => {
                    let is_retryable = e.is_timeout() || e.is_connect();
                    let err = PvError::Http(e.to_string());
                    if is_retryable && attempt < self.retry_config.max_retries {
                        warn!("retryable error on {url}: {err}");
                        last_error = Some(err);
                        continue;
                    }
                    return Err(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| PvError::Http("max retries exceeded".into())))
    }

    /// Calculate retry delay with exponential backoff.
    fn calculate_retry_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.retry_config.base_delay.as_millis() as u64;
        let delay_ms = base_ms.saturating_mul(1u64 << attempt.min(16));
        let max_ms = self.retry_config.max_delay.as_millis() as u64;
        Duration::from_millis(delay_ms.min(max_ms))
    }

    async fn check_status(response: Response) -> PvResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        match status {
            StatusCode::NOT_FOUND => Err(PvError::RemoteUnavailable(format!("blob not found: {body}"))),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(PvError::RemoteUnavailable(
                format!("Drive rejected credentials ({status}): {body}"),
            )),
            _ => Err(PvError::Http(format!("Drive returned {status}: {body}"))),
        }
    }

    async fn json_blob(response: Response) -> PvResult<RemoteBlob> {
        response
            .json::<RemoteBlob>()
            .await
            .map_err(|e| PvError::Serialization(format!("failed to parse Drive file: {e}")))
    }

    fn file_url(&self, id: &str) -> String {
        format!("{}/files/{id}", self.api_root)
    }
}

/// Drive query language expression for a [`BlobQuery`].
fn drive_query(query: &BlobQuery) -> String {
    let mut clauses = vec!["trashed = false".to_string()];
    if let Some(name) = &query.name {
        clauses.push(format!("name = '{}'", escape_query(name)));
    }
    if let Some(fragment) = &query.name_contains {
        clauses.push(format!("name contains '{}'", escape_query(fragment)));
    }
    clauses.join(" and ")
}

fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Build a multipart/related body: JSON metadata part, then the media part.
fn multipart_related(metadata: &serde_json::Value, media_type: &str, bytes: &[u8]) -> RequestBody {
    let boundary = format!("pv-boundary-{}", uuid::Uuid::new_v4().simple());
    let mut body = Vec::with_capacity(bytes.len() + 512);
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{metadata}\r\n\
             --{boundary}\r\nContent-Type: {media_type}\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

    RequestBody {
        content_type: format!("multipart/related; boundary={boundary}"),
        bytes: body,
    }
}

/// Listing, metadata and upload failures all mean the remote is unusable.
fn unavailable(e: PvError) -> PvError {
    match e {
        PvError::Http(msg) | PvError::Serialization(msg) => PvError::RemoteUnavailable(msg),
        other => other,
    }
}

#[async_trait]
impl BlobStore for DriveClient {
    fn backend(&self) -> &'static str {
        "drive"
    }

    async fn list_files(&self, query: &BlobQuery) -> PvResult<Vec<RemoteBlob>> {
        let url = format!("{}/files", self.api_root);
        let q = drive_query(query);
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut params = vec![
                ("spaces", APP_DATA_FOLDER.to_string()),
                ("q", q.clone()),
                ("fields", LIST_FIELDS.to_string()),
                ("pageSize", "100".to_string()),
            ];
            if let Some(token) = page_token.take() {
                params.push(("pageToken", token));
            }

            let response = self
                .request_with_retry(Method::GET, &url, &params, None)
                .await
                .map_err(unavailable)?;
            let page: FileList = response
                .json()
                .await
                .map_err(|e| PvError::RemoteUnavailable(format!("failed to parse file list: {e}")))?;

            files.extend(page.files);
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        debug!("Drive query [{q}] matched {} file(s)", files.len());
        Ok(files)
    }

    async fn get_metadata(&self, id: &str) -> PvResult<RemoteBlob> {
        let params = [("fields", FILE_FIELDS.to_string())];
        let response = self
            .request_with_retry(Method::GET, &self.file_url(id), &params, None)
            .await
            .map_err(unavailable)?;
        Self::json_blob(response).await.map_err(unavailable)
    }

    async fn download(&self, id: &str) -> PvResult<Vec<u8>> {
        let params = [("alt", "media".to_string())];
        let response = self
            .request_with_retry(Method::GET, &self.file_url(id), &params, None)
            .await
            .map_err(|e| PvError::DownloadFailed(e.to_string()))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| PvError::DownloadFailed(format!("failed to read body: {e}")))?;
        debug!("downloaded {} bytes of blob {id}", bytes.len());
        Ok(bytes.to_vec())
    }

    async fn create(&self, blob: NewBlob) -> PvResult<RemoteBlob> {
        let metadata = json!({
            "name": blob.name,
            "mimeType": blob.mime_type,
            "parents": [blob.parent],
            "properties": blob.properties,
        });
        let body = multipart_related(&metadata, &blob.mime_type, &blob.bytes);
        let url = format!("{}/files", self.upload_root);
        let params = [
            ("uploadType", "multipart".to_string()),
            ("fields", FILE_FIELDS.to_string()),
        ];

        let response = self
            .request_with_retry(Method::POST, &url, &params, Some(&body))
            .await
            .map_err(unavailable)?;
        let created = Self::json_blob(response).await.map_err(unavailable)?;
        debug!("created Drive file {} ({})", created.id, created.name);
        Ok(created)
    }

    async fn update(
        &self,
        id: &str,
        properties: HashMap<String, String>,
        bytes: Vec<u8>,
    ) -> PvResult<RemoteBlob> {
        let metadata = json!({ "properties": properties });
        let body = multipart_related(&metadata, "application/octet-stream", &bytes);
        let url = format!("{}/files/{id}", self.upload_root);
        let params = [
            ("uploadType", "multipart".to_string()),
            ("fields", FILE_FIELDS.to_string()),
        ];

        let response = self
            .request_with_retry(Method::PATCH, &url, &params, Some(&body))
            .await
            .map_err(unavailable)?;
        Self::json_blob(response).await.map_err(unavailable)
    }

    async fn delete(&self, id: &str) -> PvResult<()> {
        self.request_with_retry(Method::DELETE, &self.file_url(id), &[], None)
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::timestamp_properties;
    use mockito::Matcher;

    fn client(server: &mockito::Server) -> DriveClient {
        let config = RemoteConfig {
            api_root: server.url(),
            upload_root: format!("{}/upload", server.url()),
            ..RemoteConfig::default()
        };
        DriveClient::with_token(&config, "tok")
            .unwrap()
            .with_retry_config(RetryConfig {
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                ..RetryConfig::default()
            })
    }

    #[test]
    fn test_drive_query_escapes_quotes() {
        let q = drive_query(&BlobQuery::named("o'brien.sqlite"));
        assert_eq!(q, "trashed = false and name = 'o\\'brien.sqlite'");
        assert_eq!(
            drive_query(&BlobQuery::containing("db")),
            "trashed = false and name contains 'db'"
        );
    }

    #[test]
    fn test_multipart_body_layout() {
        let body = multipart_related(&json!({"name": "x"}), "application/x-sqlite3", b"DATA");
        let text = String::from_utf8(body.bytes).unwrap();
        let boundary = body.content_type.trim_start_matches("multipart/related; boundary=");
        assert!(text.starts_with(&format!("--{boundary}\r\n")));
        assert!(text.contains("{\"name\":\"x\"}"));
        assert!(text.contains("Content-Type: application/x-sqlite3\r\n\r\nDATA\r\n"));
        assert!(text.ends_with(&format!("--{boundary}--\r\n")));
    }

    #[test]
    fn test_retry_delay_is_capped() {
        let client = DriveClient::with_token(&RemoteConfig::default(), "t").unwrap();
        assert_eq!(client.calculate_retry_delay(0), Duration::from_secs(1));
        assert_eq!(client.calculate_retry_delay(2), Duration::from_secs(4));
        assert_eq!(client.calculate_retry_delay(10), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn test_list_files_scopes_to_app_data_folder() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/files")
            .match_header("authorization", "Bearer tok")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("spaces".into(), "appDataFolder".into()),
                Matcher::UrlEncoded("q".into(), "trashed = false and name = 'patients.sqlite'".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"files":[{"id":"f1","name":"patients.sqlite","mimeType":"application/x-sqlite3","properties":{"lastModified":"200"}}]}"#,
            )
            .create_async()
            .await;

        let files = client(&server).list_files(&BlobQuery::named("patients.sqlite")).await.unwrap();
        mock.assert_async().await;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].id, "f1");
        assert_eq!(files[0].last_modified().unwrap(), 200);
    }

    #[tokio::test]
    async fn test_missing_file_is_remote_unavailable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/files/gone")
            .match_query(Matcher::Any)
            .with_status(404)
            .with_body("not found")
            .create_async()
            .await;

        let err = client(&server).get_metadata("gone").await.unwrap_err();
        assert!(matches!(err, PvError::RemoteUnavailable(_)));
    }

    #[tokio::test]
    async fn test_download_retries_server_errors() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/files/f1")
            .match_query(Matcher::UrlEncoded("alt".into(), "media".into()))
            .with_status(503)
            .expect(4)
            .create_async()
            .await;

        let err = client(&server).download("f1").await.unwrap_err();
        mock.assert_async().await;
        assert!(matches!(err, PvError::DownloadFailed(_)));
    }

    #[tokio::test]
    async fn test_download_returns_body() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/files/f1")
            .match_query(Matcher::UrlEncoded("alt".into(), "media".into()))
            .with_status(200)
            .with_body("SQLite format 3\0rest")
            .create_async()
            .await;

        let bytes = client(&server).download("f1").await.unwrap();
        assert!(bytes.starts_with(b"SQLite format 3"));
    }

    #[tokio::test]
    async fn test_create_uploads_into_app_data_folder() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/upload/files")
            .match_query(Matcher::UrlEncoded("uploadType".into(), "multipart".into()))
            .match_header("content-type", Matcher::Regex("^multipart/related; boundary=".into()))
            .match_body(Matcher::Regex(r#""parents":\["appDataFolder"\]"#.into()))
            .with_status(200)
            .with_body(r#"{"id":"new1","name":"patients.sqlite","properties":{"lastModified":"5"}}"#)
            .create_async()
            .await;

        let created = client(&server)
            .create(NewBlob {
                name: "patients.sqlite".into(),
                mime_type: "application/x-sqlite3".into(),
                parent: APP_DATA_FOLDER.into(),
                properties: timestamp_properties(5),
                bytes: b"payload".to_vec(),
            })
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(created.id, "new1");
    }

    #[tokio::test]
    async fn test_update_patches_properties() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PATCH", "/upload/files/f1")
            .match_query(Matcher::Any)
            .match_body(Matcher::Regex(r#""lastModified":"300""#.into()))
            .with_status(200)
            .with_body(r#"{"id":"f1","name":"patients.sqlite","properties":{"lastModified":"300"}}"#)
            .create_async()
            .await;

        let updated = client(&server)
            .update("f1", timestamp_properties(300), b"new".to_vec())
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(updated.last_modified().unwrap(), 300);
    }
}

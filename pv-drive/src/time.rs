//! Trusted time from an HTTP `Date` header.

use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use reqwest::Client;
use tracing::debug;

use pv_core::error::{PvError, PvResult};

/// A source of time that all devices agree on.
#[async_trait]
pub trait TimeSource: Send + Sync {
    /// Seconds since the Unix epoch.
    async fn now(&self) -> PvResult<i64>;
}

/// Reads the `Date` header of a HEAD request to a well-known server.
#[derive(Debug, Clone)]
pub struct HttpDateTimeSource {
    client: Client,
    url: String,
}

impl HttpDateTimeSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> PvResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PvError::Http(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, url: url.into() })
    }
}

#[async_trait]
impl TimeSource for HttpDateTimeSource {
    async fn now(&self) -> PvResult<i64> {
        let response = self
            .client
            .head(&self.url)
            .send()
            .await
            .map_err(|e| PvError::Http(format!("time request to {} failed: {e}", self.url)))?;

        let header = response
            .headers()
            .get(reqwest::header::DATE)
            .ok_or_else(|| PvError::Http(format!("{} sent no Date header", self.url)))?
            .to_str()
            .map_err(|e| PvError::Http(format!("unreadable Date header: {e}")))?;

        let now = parse_http_date(header)?;
        debug!("trusted time from {}: {now}", self.url);
        Ok(now)
    }
}

/// Parse an IMF-fixdate such as `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn parse_http_date(value: &str) -> PvResult<i64> {
    DateTime::parse_from_rfc2822(value.trim())
        .map(|dt| dt.timestamp())
        .map_err(|e| PvError::Http(format!("invalid Date header {value:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_http_date() {
        assert_eq!(parse_http_date("Sun, 06 Nov 1994 08:49:37 GMT").unwrap(), 784_111_777);
        assert!(parse_http_date("yesterday").is_err());
    }

    #[tokio::test]
    async fn test_reads_date_header() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("HEAD", "/")
            .with_status(200)
            .with_header("date", "Tue, 14 Nov 2023 22:13:20 GMT")
            .create_async()
            .await;

        let source = HttpDateTimeSource::new(server.url(), Duration::from_secs(5)).unwrap();
        assert_eq!(source.now().await.unwrap(), 1_700_000_000);
    }
}

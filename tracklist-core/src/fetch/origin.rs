//! Origin artwork download.

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use crate::error::{ArtworkError, Result};

const ACCEPTED_CONTENT_TYPES: &[&str] = &[
    "image/jpeg",
    "image/jpg",
    "image/png",
    "image/gif",
    "image/webp",
    "image/bmp",
];

/// Raw image bytes as served by the origin.
#[derive(Debug, Clone)]
pub struct FetchedImage {
    /// Response body.
    pub bytes: Vec<u8>,
    /// `Content-Type` header, or empty.
    pub content_type: String,
    /// `ETag` header, if any.
    pub etag: Option<String>,
}

/// Fetch-by-URL provider for origin artwork.
#[async_trait]
pub trait OriginFetcher: Send + Sync {
    /// Downloads `url`, failing on non-success statuses and oversized bodies.
    async fn fetch(&self, url: &str) -> Result<FetchedImage>;
}

/// HTTP client settings for origin downloads.
#[derive(Debug, Clone)]
pub struct FetchSettings {
    /// Per-request timeout.
    pub timeout: Duration,
    /// Larger bodies are rejected.
    pub max_bytes: usize,
    /// `User-Agent` header.
    pub user_agent: String,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_bytes: 10 * 1024 * 1024,
            user_agent: concat!("tracklist/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// `reqwest`-backed origin client.
#[derive(Debug, Clone)]
pub struct HttpOriginFetcher {
    client: reqwest::Client,
    max_bytes: usize,
}

impl HttpOriginFetcher {
    /// Builds the underlying HTTP client.
    pub fn new(settings: &FetchSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .user_agent(settings.user_agent.clone())
            .build()
            .map_err(|e| {
                ArtworkError::Internal(format!("Failed to create HTTP client: {e}"))
            })?;

        Ok(Self {
            client,
            max_bytes: settings.max_bytes,
        })
    }
}

/// Strips parameters and normalizes case, rejecting non-image types.
fn accepted_content_type(raw: &str) -> Option<String> {
    let essence = raw.split(';').next()?.trim().to_ascii_lowercase();
    ACCEPTED_CONTENT_TYPES
        .contains(&essence.as_str())
        .then_some(essence)
}

#[async_trait]
impl OriginFetcher for HttpOriginFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedImage> {
        let parsed = url::Url::parse(url)
            .map_err(|e| ArtworkError::Fetch(format!("Invalid artwork URL {url}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ArtworkError::Fetch(format!(
                "Unsupported artwork URL scheme: {}",
                parsed.scheme()
            )));
        }

        let response = self
            .client
            .get(parsed)
            .send()
            .await
            .map_err(|e| ArtworkError::Fetch(format!("Failed to download {url}: {e}")))?;

        if !response.status().is_success() {
            return Err(ArtworkError::Fetch(format!(
                "Failed to download {url}: HTTP {}",
                response.status()
            )));
        }

        if let Some(length) = response.content_length()
            && length as usize > self.max_bytes
        {
            return Err(ArtworkError::Fetch(format!(
                "Artwork at {url} is too large ({length} bytes)"
            )));
        }

        let raw_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let content_type = accepted_content_type(&raw_type).ok_or_else(|| {
            ArtworkError::Fetch(format!("Unsupported content type {raw_type:?} for {url}"))
        })?;
        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ArtworkError::Fetch(format!("Failed to read {url}: {e}")))?;
        if bytes.len() > self.max_bytes {
            return Err(ArtworkError::Fetch(format!(
                "Artwork at {url} is too large ({} bytes)",
                bytes.len()
            )));
        }
        if bytes.is_empty() {
            return Err(ArtworkError::Fetch(format!("Empty artwork body from {url}")));
        }

        debug!(url, bytes = bytes.len(), content_type = %content_type, "downloaded artwork");
        Ok(FetchedImage {
            bytes: bytes.to_vec(),
            content_type,
            etag,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_filtering() {
        assert_eq!(
            accepted_content_type("image/JPEG; charset=binary").as_deref(),
            Some("image/jpeg")
        );
        assert_eq!(accepted_content_type("image/webp").as_deref(), Some("image/webp"));
        assert!(accepted_content_type("text/html").is_none());
        assert!(accepted_content_type("").is_none());
    }

    #[tokio::test]
    async fn rejects_non_http_urls_without_network() {
        let fetcher = HttpOriginFetcher::new(&FetchSettings::default()).unwrap();
        let err = fetcher.fetch("file:///etc/passwd").await.unwrap_err();
        assert_eq!(err.kind(), "fetch");
        let err = fetcher.fetch("not a url").await.unwrap_err();
        assert_eq!(err.kind(), "fetch");
    }
}

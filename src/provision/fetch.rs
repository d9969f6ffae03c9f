use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{header::LOCATION, redirect::Policy, Client};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::{DownlyError, Result};

/// Maximum number of redirects followed before a download is abandoned
pub const MAX_REDIRECTS: usize = 5;

/// Downloads a tool binary byte-for-byte to a destination path
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BinaryFetcher: Send + Sync {
    /// Fetch `url` into `dest`, returning the number of bytes written
    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64>;
}

/// reqwest-backed fetcher that follows redirects itself
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .redirect(Policy::none())
            .connect_timeout(Duration::from_secs(30))
            .user_agent(concat!("downly/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DownlyError::Provision(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self { client })
    }

    /// Follow redirects until a non-redirect response arrives
    async fn resolve(&self, url: &str) -> Result<reqwest::Response> {
        let mut current = Url::parse(url)
            .map_err(|_| DownlyError::Provision(format!("Invalid download URL: {url}")))?;
        let mut hops = 0;

        loop {
            let response = self
                .client
                .get(current.clone())
                .send()
                .await
                .map_err(|e| DownlyError::Provision(format!("Request to {current} failed: {e}")))?;

            let status = response.status();
            if !status.is_redirection() {
                if !status.is_success() {
                    return Err(DownlyError::Provision(format!(
                        "Download from {current} failed: HTTP {status}"
                    )));
                }
                return Ok(response);
            }

            hops += 1;
            if hops > MAX_REDIRECTS {
                return Err(DownlyError::Provision(format!(
                    "Too many redirects (more than {MAX_REDIRECTS}) fetching {url}"
                )));
            }

            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
                .ok_or_else(|| {
                    DownlyError::Provision(format!("Redirect from {current} without Location"))
                })?;

            current = current.join(location).map_err(|_| {
                DownlyError::Provision(format!("Invalid redirect location: {location}"))
            })?;
            tracing::debug!("Following redirect to {}", current);
        }
    }
}

#[async_trait]
impl BinaryFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64> {
        let response = self.resolve(url).await?;

        let write_err =
            |e: std::io::Error| DownlyError::Provision(format!("Failed to write {}: {e}", dest.display()));

        let mut file = tokio::fs::File::create(dest).await.map_err(write_err)?;
        let mut written = 0u64;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| DownlyError::Provision(format!("Download interrupted: {e}")))?;
            file.write_all(&chunk).await.map_err(write_err)?;
            written += chunk.len() as u64;
        }

        file.flush().await.map_err(write_err)?;
        file.sync_all().await.map_err(write_err)?;

        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ELF: &[u8] = &[0x7F, b'E', b'L', b'F', 2, 1, 1, 0];

    #[tokio::test]
    async fn test_follows_redirects() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/latest/yt-dlp"))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", "/assets/yt-dlp"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/assets/yt-dlp"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(ELF))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("yt-dlp");
        let fetcher = HttpFetcher::new().unwrap();

        let written = fetcher
            .fetch(&format!("{}/latest/yt-dlp", server.uri()), &dest)
            .await
            .unwrap();

        assert_eq!(written, ELF.len() as u64);
        assert_eq!(std::fs::read(&dest).unwrap(), ELF);
    }

    #[tokio::test]
    async fn test_redirect_bound() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/loop"))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", "/loop"))
            .expect((MAX_REDIRECTS + 1) as u64)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let fetcher = HttpFetcher::new().unwrap();

        let err = fetcher
            .fetch(&format!("{}/loop", server.uri()), &dir.path().join("bin"))
            .await
            .unwrap_err();

        assert!(matches!(err, DownlyError::Provision(ref msg) if msg.contains("Too many redirects")));
        assert!(!dir.path().join("bin").exists());
    }

    #[tokio::test]
    async fn test_non_success_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let fetcher = HttpFetcher::new().unwrap();

        let err = fetcher
            .fetch(&format!("{}/missing", server.uri()), &dir.path().join("bin"))
            .await
            .unwrap_err();

        assert!(matches!(err, DownlyError::Provision(ref msg) if msg.contains("404")));
    }
}

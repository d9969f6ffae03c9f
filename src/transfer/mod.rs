//! Turning a byte source into an HTTP response body.
//!
//! Live sources are primed with their first chunk before any header is committed, so a tool
//! that fails up front still produces a proper error response. File sources report when the
//! body is finished with the file, which is what the artifact manager waits for.

use axum::body::Body;
use axum::http::{header, HeaderValue, Response, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use bytes::Bytes;
use futures_util::{stream, Stream, StreamExt};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tokio_util::io::ReaderStream;

use crate::process::ByteSource;
use crate::{DownlyError, Result};

/// How a file-backed transfer ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed,
    Failed,
    Aborted,
}

/// Sending half of a transfer's completion signal. Fires `Aborted` if dropped unfired.
pub struct CompletionSignal {
    tx: Option<oneshot::Sender<TransferOutcome>>,
}

impl CompletionSignal {
    pub fn fire(&mut self, outcome: TransferOutcome) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(outcome);
        }
    }
}

impl Drop for CompletionSignal {
    fn drop(&mut self) {
        self.fire(TransferOutcome::Aborted);
    }
}

/// Receiving half of a transfer's completion signal
pub struct TransferDone {
    rx: oneshot::Receiver<TransferOutcome>,
}

impl TransferDone {
    pub async fn wait(self) -> TransferOutcome {
        self.rx.await.unwrap_or(TransferOutcome::Aborted)
    }
}

pub fn completion() -> (CompletionSignal, TransferDone) {
    let (tx, rx) = oneshot::channel();
    (CompletionSignal { tx: Some(tx) }, TransferDone { rx })
}

#[derive(Debug, Clone)]
pub struct TransferMetadata {
    pub content_type: String,
    pub content_length: Option<u64>,
    pub filename: String,
}

/// Where the bytes of a download come from
pub enum Source {
    /// Output of a running extractor
    Live(ByteSource),
    /// Finished file on disk; `signal` fires once the body is done with it
    File {
        path: PathBuf,
        signal: CompletionSignal,
    },
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Source::Live(source) => f.debug_tuple("Live").field(&source.pid()).finish(),
            Source::File { path, .. } => f.debug_struct("File").field("path", path).finish(),
        }
    }
}

/// Build the download response for `source`.
///
/// Fails without committing anything when a live source errors or ends before its first byte.
pub async fn deliver(source: Source, metadata: TransferMetadata) -> Result<Response<Body>> {
    match source {
        Source::Live(mut live) => {
            let first = match live.next_chunk().await {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(DownlyError::Extraction(
                        "Extractor finished without producing any data".to_string(),
                    ))
                }
            };

            let body = stream::once(async move { Ok::<Bytes, DownlyError>(first) }).chain(live);
            build_response(&metadata, None, Body::from_stream(body))
        }
        Source::File { path, signal } => {
            let file = File::open(&path).await?;
            let length = match metadata.content_length {
                Some(length) => length,
                None => file.metadata().await?.len(),
            };

            let body = FileStream {
                inner: Some(ReaderStream::new(file)),
                signal,
            };
            build_response(&metadata, Some(length), Body::from_stream(body))
        }
    }
}

/// Drain `source` into `dest`, returning the number of bytes written
pub async fn write_to(source: Source, dest: &Path) -> Result<u64> {
    match source {
        Source::Live(mut live) => {
            let mut out = File::create(dest).await?;
            let mut written = 0u64;

            while let Some(chunk) = live.next_chunk().await {
                let chunk = chunk?;
                out.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }

            out.flush().await?;
            Ok(written)
        }
        Source::File { path, mut signal } => match tokio::fs::copy(&path, dest).await {
            Ok(written) => {
                signal.fire(TransferOutcome::Completed);
                Ok(written)
            }
            Err(e) => {
                signal.fire(TransferOutcome::Failed);
                Err(e.into())
            }
        },
    }
}

/// JSON error body with the status the error maps to
pub fn error_response(err: &DownlyError) -> Response<Body> {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
}

fn build_response(metadata: &TransferMetadata, length: Option<u64>, body: Body) -> Result<Response<Body>> {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, metadata.content_type.as_str())
        .header(
            header::CONTENT_DISPOSITION,
            crate::utils::content_disposition(&metadata.filename),
        )
        .header(header::CACHE_CONTROL, "no-store")
        .header("X-Download-Response", HeaderValue::from_static("1"));

    if let Some(length) = length {
        builder = builder.header(header::CONTENT_LENGTH, length);
    }

    builder
        .body(body)
        .map_err(|e| DownlyError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
}

/// File body that reports how it ended. The file is closed before the signal fires.
struct FileStream {
    inner: Option<ReaderStream<File>>,
    signal: CompletionSignal,
}

impl Stream for FileStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };

        match Pin::new(inner).poll_next(cx) {
            Poll::Ready(None) => {
                this.inner = None;
                this.signal.fire(TransferOutcome::Completed);
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(e))) => {
                this.inner = None;
                this.signal.fire(TransferOutcome::Failed);
                Poll::Ready(Some(Err(e)))
            }
            other => other,
        }
    }
}

impl Drop for FileStream {
    fn drop(&mut self) {
        self.inner = None;
        self.signal.fire(TransferOutcome::Aborted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    fn metadata(filename: &str) -> TransferMetadata {
        TransferMetadata {
            content_type: "video/mp4".to_string(),
            content_length: None,
            filename: filename.to_string(),
        }
    }

    fn file_source(contents: &[u8]) -> (tempfile::TempDir, PathBuf, Source, TransferDone) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r_out.mp4");
        std::fs::write(&path, contents).unwrap();

        let (signal, done) = completion();
        let source = Source::File {
            path: path.clone(),
            signal,
        };
        (dir, path, source, done)
    }

    #[tokio::test]
    async fn test_file_transfer_headers_and_body() {
        let (_dir, _path, source, done) = file_source(b"movie bytes");

        let response = deliver(source, metadata("Downly_abc.mp4")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let headers = response.headers();
        assert_eq!(headers[header::CONTENT_TYPE], "video/mp4");
        assert_eq!(headers[header::CONTENT_LENGTH], "11");
        assert_eq!(headers[header::CACHE_CONTROL], "no-store");
        assert_eq!(headers["x-download-response"], "1");
        assert!(headers[header::CONTENT_DISPOSITION]
            .to_str()
            .unwrap()
            .starts_with("attachment; filename=\"Downly_abc.mp4\""));

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"movie bytes");
        assert_eq!(done.wait().await, TransferOutcome::Completed);
    }

    #[tokio::test]
    async fn test_dropped_body_signals_abort() {
        let (_dir, path, source, done) = file_source(b"movie bytes");

        let response = deliver(source, metadata("Downly_abc.mp4")).await.unwrap();
        drop(response);

        assert_eq!(done.wait().await, TransferOutcome::Aborted);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_missing_file_fails_and_signals() {
        let (_dir, path, source, done) = file_source(b"");
        std::fs::remove_file(&path).unwrap();

        let err = deliver(source, metadata("Downly_abc.mp4")).await.unwrap_err();
        assert!(matches!(err, DownlyError::Io(_)));
        assert_eq!(done.wait().await, TransferOutcome::Aborted);
    }

    #[tokio::test]
    async fn test_write_to_copies_file() {
        let (dir, _path, source, done) = file_source(b"audio");
        let dest = dir.path().join("saved.mp3");

        assert_eq!(write_to(source, &dest).await.unwrap(), 5);
        assert_eq!(std::fs::read(&dest).unwrap(), b"audio");
        assert_eq!(done.wait().await, TransferOutcome::Completed);
    }

    #[tokio::test]
    async fn test_error_response_shape() {
        let response = error_response(&DownlyError::Validation("Missing url".to_string()));
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "Missing url");
    }

    #[cfg(unix)]
    mod live {
        use super::*;
        use crate::process::ProcessOrchestrator;
        use crate::provision::{Tool, ToolResolver};
        use async_trait::async_trait;
        use std::sync::Arc;
        use std::time::Duration;

        struct ShellTools;

        #[async_trait]
        impl ToolResolver for ShellTools {
            async fn resolve(&self, _tool: Tool) -> crate::Result<PathBuf> {
                Ok(PathBuf::from("/bin/sh"))
            }
        }

        async fn live(script: &str, timeout: Duration) -> Source {
            let orchestrator = ProcessOrchestrator::new(Arc::new(ShellTools), timeout);
            let args = vec!["-c".to_string(), script.to_string()];
            Source::Live(orchestrator.stream(Tool::Extractor, &args).await.unwrap())
        }

        #[tokio::test]
        async fn test_live_transfer_streams_all_bytes() {
            let source = live("printf 'abc'; sleep 0.1; printf 'def'", Duration::from_secs(5)).await;

            let response = deliver(source, metadata("Downly_x.mp4")).await.unwrap();
            assert!(response.headers().get(header::CONTENT_LENGTH).is_none());

            let body = response.into_body().collect().await.unwrap().to_bytes();
            assert_eq!(&body[..], b"abcdef");
        }

        #[tokio::test]
        async fn test_live_failure_before_first_byte_is_an_error() {
            let source = live("echo 'ERROR: Private video' >&2; exit 1", Duration::from_secs(5)).await;

            let err = deliver(source, metadata("Downly_x.mp4")).await.unwrap_err();
            assert_eq!(err.status_code(), 502);
            assert!(err.to_string().contains("Private video"));
        }

        #[tokio::test]
        async fn test_live_timeout_maps_to_gateway_timeout() {
            let source = live("sleep 5", Duration::from_millis(100)).await;

            let err = deliver(source, metadata("Downly_x.mp4")).await.unwrap_err();
            assert!(matches!(err, DownlyError::Timeout(_)));
            assert_eq!(error_response(&err).status(), StatusCode::GATEWAY_TIMEOUT);
        }

        #[tokio::test]
        async fn test_live_truncation_surfaces_as_body_error() {
            let source = live("printf 'partial'; exit 3", Duration::from_secs(5)).await;

            let response = deliver(source, metadata("Downly_x.mp4")).await.unwrap();
            assert!(response.into_body().collect().await.is_err());
        }

        #[tokio::test]
        async fn test_live_write_to() {
            let dir = tempfile::tempdir().unwrap();
            let dest = dir.path().join("out.mp4");
            let source = live("printf 'stream'", Duration::from_secs(5)).await;

            assert_eq!(write_to(source, &dest).await.unwrap(), 6);
            assert_eq!(std::fs::read(&dest).unwrap(), b"stream");
        }
    }
}

//! Inspect and download flows built from the tool, transfer and artifact layers.
//!
//! TikTok and Facebook downloads go through scratch files: the extractor writes the media,
//! the transcoder rewrites it into a faststart mp4, and the finished file is served with its
//! size. YouTube downloads stream straight from the extractor's stdout.

use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::artifacts::{new_request_id, ArtifactManager, Purpose, TempArtifact};
use crate::config::Config;
use crate::formats::{self, InspectResult};
use crate::process::{remux_args, ExtractorArgs, OutputKind, Platform, ProcessOrchestrator};
use crate::provision::{Provisioner, Tool, ToolResolver};
use crate::transfer::{completion, Source, TransferMetadata};
use crate::utils;
use crate::{DownlyError, Result};

/// Inspection request as accepted by the API
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InspectRequest {
    /// Page URL of the video
    pub url: String,

    /// Source platform, inferred from the URL when absent
    pub platform: Option<Platform>,

    /// Session cookie, only used for Facebook
    pub cookie: Option<String>,
}

/// Download request as accepted by the API
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DownloadRequest {
    /// Page URL of the video
    pub url: String,

    /// Encoding chosen from an earlier inspection
    pub format_id: String,

    /// Source platform, inferred from the URL when absent
    pub platform: Option<Platform>,

    /// Session cookie, only used for Facebook
    pub cookie: Option<String>,

    /// Container delivered to the client
    pub output: OutputKind,
}

/// A download ready to be delivered
#[derive(Debug)]
pub struct DownloadPayload {
    pub metadata: TransferMetadata,
    pub source: Source,
    /// Scratch file removal, finishes after the source is done with the file
    pub cleanup: Option<JoinHandle<std::io::Result<()>>>,
}

/// Main acquisition pipeline
pub struct Pipeline {
    orchestrator: ProcessOrchestrator,
    artifacts: ArtifactManager,
    retries: u32,
    cleanup_grace: Duration,
}

impl Pipeline {
    /// Build a pipeline around an existing tool resolver
    pub fn new(tools: Arc<dyn ToolResolver>, config: &Config) -> Self {
        Self {
            orchestrator: ProcessOrchestrator::new(tools, config.transfer.first_byte_timeout()),
            artifacts: ArtifactManager::from_config(config),
            retries: config.tools.retries,
            cleanup_grace: config.transfer.cleanup_grace(),
        }
    }

    /// Build a pipeline that provisions its own tools
    pub fn from_config(config: &Config) -> Result<Self> {
        let provisioner = Provisioner::from_config(config)?;
        Ok(Self::new(Arc::new(provisioner), config))
    }

    pub fn artifacts(&self) -> &ArtifactManager {
        &self.artifacts
    }

    /// Formats and quality tiers available for a URL
    pub async fn inspect(&self, request: &InspectRequest) -> Result<InspectResult> {
        let url = required_url(&request.url)?;
        let platform = request.platform.unwrap_or_else(|| Platform::detect(url));

        tracing::info!(
            "Inspecting {} ({})",
            utils::extract_domain(url).unwrap_or_else(|| url.to_string()),
            platform
        );

        let args = ExtractorArgs::new(platform, request.cookie.as_deref(), self.retries);
        let payload = self.orchestrator.inspect_json(&args.inspect(url)).await?;
        let result = formats::resolve(&payload, platform);

        tracing::info!(
            "Found {} formats, {} tiers for \"{}\"",
            result.formats.len(),
            result.tiers.len(),
            result.title
        );

        Ok(result)
    }

    /// Start a download; the payload is delivered by the caller
    pub async fn download(&self, request: &DownloadRequest) -> Result<DownloadPayload> {
        let url = required_url(&request.url)?;
        let format_id = request.format_id.trim();
        if format_id.is_empty() {
            return Err(DownlyError::Validation("Missing formatId".to_string()));
        }

        let platform = request.platform.unwrap_or_else(|| Platform::detect(url));
        let kind = request.output;
        let args = ExtractorArgs::new(platform, request.cookie.as_deref(), self.retries);

        tracing::info!("Downloading {} format {} as {} ({})", url, format_id, kind, platform);

        let filename = self.suggested_filename(&args, url, format_id, kind).await;
        let metadata = TransferMetadata {
            content_type: kind.content_type().to_string(),
            content_length: None,
            filename,
        };

        let ffmpeg = self.ffmpeg_location().await;

        if platform.streams_live() {
            let stream_args = args.download_to_stdout(url, format_id, kind, ffmpeg.as_deref());
            let source = self.orchestrator.stream(Tool::Extractor, &stream_args).await?;
            return Ok(DownloadPayload {
                metadata,
                source: Source::Live(source),
                cleanup: None,
            });
        }

        self.download_file(&args, url, format_id, kind, ffmpeg, metadata).await
    }

    /// Download through scratch files and hand back the finished one
    async fn download_file(
        &self,
        args: &ExtractorArgs,
        url: &str,
        format_id: &str,
        kind: OutputKind,
        ffmpeg: Option<PathBuf>,
        mut metadata: TransferMetadata,
    ) -> Result<DownloadPayload> {
        // dropped with the request future if the client goes away mid-download
        let mut scratch = self.artifacts.scratch(new_request_id());
        let input = scratch.allocate(Purpose::Input, "mp4").await?;
        let output = scratch.allocate(Purpose::Output, kind.ext()).await?;

        let finished = match self
            .produce_file(args, url, format_id, kind, ffmpeg, &input, &output)
            .await
        {
            Ok(path) => path,
            Err(e) => {
                if let Err(cleanup) = scratch.release_now().await {
                    tracing::warn!("Cleanup after failed download: {}", cleanup);
                }
                return Err(e);
            }
        };

        metadata.content_length = tokio::fs::metadata(&finished).await.ok().map(|m| m.len());

        let (signal, done) = completion();
        let cleanup = scratch.release_on(done, self.cleanup_grace);

        Ok(DownloadPayload {
            metadata,
            source: Source::File {
                path: finished,
                signal,
            },
            cleanup: Some(cleanup),
        })
    }

    /// Run the extractor (and for video the remux) and return the file to serve
    #[allow(clippy::too_many_arguments)]
    async fn produce_file(
        &self,
        args: &ExtractorArgs,
        url: &str,
        format_id: &str,
        kind: OutputKind,
        ffmpeg: Option<PathBuf>,
        input: &TempArtifact,
        output: &TempArtifact,
    ) -> Result<PathBuf> {
        match kind {
            OutputKind::Mp3 => {
                let extract = args.download_to_file(url, format_id, kind, &output.path, ffmpeg.as_deref());
                self.orchestrator.run(Tool::Extractor, &extract).await?;

                if !output.exists() {
                    return Err(DownlyError::Transcode("Failed to produce mp3 file".to_string()));
                }
                Ok(output.path.clone())
            }
            OutputKind::Mp4 => {
                let fetch = args.download_to_file(url, format_id, kind, &input.path, ffmpeg.as_deref());
                self.orchestrator.run(Tool::Extractor, &fetch).await?;

                if !input.exists() {
                    return Err(DownlyError::Extraction("Failed to produce merged file".to_string()));
                }

                // the merged file is already playable; the remux only improves it
                match self
                    .orchestrator
                    .transcode(&remux_args(&input.path, &output.path))
                    .await
                {
                    Ok(()) if output.exists() => Ok(output.path.clone()),
                    Ok(()) => Ok(input.path.clone()),
                    Err(e) => {
                        tracing::warn!("Remux failed, serving the merged file: {}", e);
                        Ok(input.path.clone())
                    }
                }
            }
        }
    }

    /// `Downly_<id>.<ext>` from a metadata lookup, or a generic name if the lookup fails
    async fn suggested_filename(
        &self,
        args: &ExtractorArgs,
        url: &str,
        format_id: &str,
        kind: OutputKind,
    ) -> String {
        let lookup = self
            .orchestrator
            .inspect_json(&args.inspect_format(url, format_id))
            .await;

        match lookup {
            Ok(payload) => utils::download_filename(formats::content_id(&payload).as_deref(), kind.ext()),
            Err(e) => {
                tracing::debug!("Filename lookup failed: {}", e);
                kind.fallback_filename().to_string()
            }
        }
    }

    /// Transcoder path for the extractor, if it can be provisioned
    async fn ffmpeg_location(&self) -> Option<PathBuf> {
        match self.orchestrator.tool_path(Tool::Transcoder).await {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::warn!("Continuing without {}: {}", Tool::Transcoder, e);
                None
            }
        }
    }
}

fn required_url(url: &str) -> Result<&str> {
    let url = url.trim();
    if url.is_empty() {
        return Err(DownlyError::Validation("Missing url".to_string()));
    }
    utils::validate_and_normalize_url(url)?;
    Ok(url)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::transfer;
    use async_trait::async_trait;
    use http_body_util::BodyExt;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    const INSPECT_JSON: &str = r#"{"id":"abc/def:123","title":"Clip","thumbnails":[{"url":"https://t/1.jpg","width":100,"height":100}],"formats":[{"format_id":"sd","vcodec":"h264","acodec":"aac","height":480},{"format_id":"hd","vcodec":"h264","acodec":"aac","height":1080}]}"#;

    /// Fake extractor: prints metadata for `-J`, otherwise writes `file-bytes` to `-o`
    const EXTRACTOR: &str = r#"
meta='__META__'
out=""; prev=""
for a in "$@"; do
  if [ "$prev" = "-o" ]; then out="$a"; fi
  prev="$a"
done
if [ "$1" = "-J" ]; then
  printf '%s' "$meta"
  exit 0
fi
if [ "$out" = "-" ]; then printf 'live-bytes'; else printf 'file-bytes' > "$out"; fi
"#;

    /// Fake transcoder: copies `-i` to the last argument with a prefix
    const TRANSCODER: &str = r#"
in=""; prev=""; last=""
for a in "$@"; do
  if [ "$prev" = "-i" ]; then in="$a"; fi
  prev="$a"; last="$a"
done
{ printf 'remuxed:'; cat "$in"; } > "$last"
"#;

    struct ScriptTools {
        extractor: PathBuf,
        transcoder: Option<PathBuf>,
    }

    #[async_trait]
    impl ToolResolver for ScriptTools {
        async fn resolve(&self, tool: Tool) -> Result<PathBuf> {
            match tool {
                Tool::Extractor => Ok(self.extractor.clone()),
                Tool::Transcoder => self
                    .transcoder
                    .clone()
                    .ok_or_else(|| DownlyError::Provision("offline".to_string())),
            }
        }
    }

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        let body = body.replace("__META__", INSPECT_JSON);
        std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    struct Harness {
        dir: tempfile::TempDir,
        pipeline: Pipeline,
    }

    fn harness(extractor: &str, transcoder: Option<&str>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let tools = ScriptTools {
            extractor: script(dir.path(), "yt-dlp", extractor),
            transcoder: transcoder.map(|body| script(dir.path(), "ffmpeg", body)),
        };

        let mut config = Config::default();
        config.cache.root = Some(dir.path().join("cache"));
        config.transfer.cleanup_grace_secs = 0;

        Harness {
            pipeline: Pipeline::new(Arc::new(tools), &config),
            dir,
        }
    }

    fn request(url: &str, output: OutputKind) -> DownloadRequest {
        DownloadRequest {
            url: url.to_string(),
            format_id: "hd".to_string(),
            output,
            ..Default::default()
        }
    }

    async fn body_of(payload: DownloadPayload) -> Vec<u8> {
        let response = transfer::deliver(payload.source, payload.metadata).await.unwrap();
        response.into_body().collect().await.unwrap().to_bytes().to_vec()
    }

    async fn wait_until_empty(manager: &ArtifactManager) {
        for _ in 0..100 {
            if manager.live_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("artifacts were never released");
    }

    #[tokio::test]
    async fn test_inspect_resolves_tiers() {
        let h = harness(EXTRACTOR, None);
        let request = InspectRequest {
            url: "https://www.tiktok.com/@u/video/1".to_string(),
            ..Default::default()
        };

        let result = h.pipeline.inspect(&request).await.unwrap();
        assert_eq!(result.title, "Clip");
        assert_eq!(result.formats[0].format_id, "hd");
        assert_eq!(result.tiers[0].format_id, "hd");
        assert_eq!(result.thumbnail.as_deref(), Some("https://t/1.jpg"));
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let h = harness(EXTRACTOR, None);

        let err = h.pipeline.inspect(&InspectRequest::default()).await.unwrap_err();
        assert!(matches!(err, DownlyError::Validation(ref m) if m == "Missing url"));

        let mut req = request("https://www.tiktok.com/@u/video/1", OutputKind::Mp4);
        req.format_id = "  ".to_string();
        let err = h.pipeline.download(&req).await.unwrap_err();
        assert!(matches!(err, DownlyError::Validation(ref m) if m == "Missing formatId"));

        let err = h
            .pipeline
            .download(&request("file:///etc/passwd", OutputKind::Mp4))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn test_video_download_is_remuxed_and_cleaned_up() {
        let h = harness(EXTRACTOR, Some(TRANSCODER));

        let payload = h
            .pipeline
            .download(&request("https://www.tiktok.com/@u/video/1", OutputKind::Mp4))
            .await
            .unwrap();

        assert_eq!(payload.metadata.filename, "Downly_abc_def_123.mp4");
        assert_eq!(payload.metadata.content_type, "video/mp4");
        assert_eq!(payload.metadata.content_length, Some("remuxed:file-bytes".len() as u64));
        assert_eq!(body_of(payload).await, b"remuxed:file-bytes");

        wait_until_empty(h.pipeline.artifacts()).await;
        let leftovers = std::fs::read_dir(h.pipeline.artifacts().dir()).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_remux_failure_falls_back_to_merged_file() {
        let h = harness(EXTRACTOR, Some("exit 1"));

        let payload = h
            .pipeline
            .download(&request("https://www.facebook.com/reel/1", OutputKind::Mp4))
            .await
            .unwrap();

        assert_eq!(body_of(payload).await, b"file-bytes");
    }

    #[tokio::test]
    async fn test_video_download_without_transcoder() {
        let h = harness(EXTRACTOR, None);

        let payload = h
            .pipeline
            .download(&request("https://www.tiktok.com/@u/video/1", OutputKind::Mp4))
            .await
            .unwrap();

        assert_eq!(body_of(payload).await, b"file-bytes");
    }

    #[tokio::test]
    async fn test_audio_download_writes_output_artifact() {
        let h = harness(EXTRACTOR, Some(TRANSCODER));

        let payload = h
            .pipeline
            .download(&request("https://www.tiktok.com/@u/video/1", OutputKind::Mp3))
            .await
            .unwrap();

        assert_eq!(payload.metadata.content_type, "audio/mpeg");
        assert!(payload.metadata.filename.ends_with(".mp3"));
        assert_eq!(body_of(payload).await, b"file-bytes");
    }

    #[tokio::test]
    async fn test_audio_download_without_output_is_transcode_error() {
        // metadata works, the download itself writes nothing
        let h = harness("[ \"$1\" = \"-J\" ] && printf '{}'; exit 0", None);

        let err = h
            .pipeline
            .download(&request("https://www.tiktok.com/@u/video/1", OutputKind::Mp3))
            .await
            .unwrap_err();

        assert!(matches!(err, DownlyError::Transcode(_)));
        assert_eq!(h.pipeline.artifacts().live_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_extraction_releases_artifacts() {
        let h = harness("echo 'ERROR: Video unavailable' >&2; exit 1", None);

        let err = h
            .pipeline
            .download(&request("https://www.tiktok.com/@u/video/1", OutputKind::Mp4))
            .await
            .unwrap_err();

        assert!(matches!(err, DownlyError::Extraction(ref m) if m.contains("Video unavailable")));
        assert_eq!(h.pipeline.artifacts().live_count(), 0);
    }

    #[tokio::test]
    async fn test_filename_falls_back_when_lookup_fails() {
        let h = harness(
            "[ \"$1\" = \"-J\" ] && exit 1; printf 'live-bytes'",
            None,
        );

        let payload = h
            .pipeline
            .download(&request("https://youtu.be/x", OutputKind::Mp4))
            .await
            .unwrap();

        assert_eq!(payload.metadata.filename, "Downly_video.mp4");
        assert!(matches!(payload.source, Source::Live(_)));
        assert_eq!(body_of(payload).await, b"live-bytes");
    }

    #[tokio::test]
    async fn test_youtube_streams_live() {
        let h = harness(EXTRACTOR, None);

        let payload = h
            .pipeline
            .download(&request("https://www.youtube.com/watch?v=abc", OutputKind::Mp4))
            .await
            .unwrap();

        assert_eq!(payload.metadata.content_length, None);
        assert_eq!(body_of(payload).await, b"live-bytes");
        assert_eq!(h.pipeline.artifacts().live_count(), 0);
        assert!(h.dir.path().exists());
    }

    #[tokio::test]
    async fn test_abandoned_download_releases_artifacts() {
        // writes a partial file plus a side file, then hangs until killed
        let slow = r#"
meta='__META__'
out=""; prev=""
for a in "$@"; do
  if [ "$prev" = "-o" ]; then out="$a"; fi
  prev="$a"
done
if [ "$1" = "-J" ]; then
  printf '%s' "$meta"
  exit 0
fi
printf 'partial' > "$out.part"
printf 'partial' > "$out"
exec sleep 30
"#;
        let h = harness(slow, None);
        let req = request("https://www.tiktok.com/@u/video/1", OutputKind::Mp4);

        let outcome = tokio::time::timeout(
            Duration::from_millis(1500),
            h.pipeline.download(&req),
        )
        .await;
        assert!(outcome.is_err(), "download should still be running");

        wait_until_empty(h.pipeline.artifacts()).await;
        let leftovers = std::fs::read_dir(h.pipeline.artifacts().dir())
            .map(|d| d.count())
            .unwrap_or(0);
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_cli_style_delivery_releases_artifacts() {
        let h = harness(EXTRACTOR, Some(TRANSCODER));
        let dest = h.dir.path().join("saved.mp4");

        let payload = h
            .pipeline
            .download(&request("https://www.tiktok.com/@u/video/1", OutputKind::Mp4))
            .await
            .unwrap();
        transfer::write_to(payload.source, &dest).await.unwrap();
        payload.cleanup.unwrap().await.unwrap().unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"remuxed:file-bytes");
        assert_eq!(h.pipeline.artifacts().live_count(), 0);
    }
}

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Desktop browser identity sent with every extractor request
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0.0.0 Safari/537.36";

/// Container delivered to the client
#[derive(ValueEnum, Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    /// Video with audio
    #[default]
    Mp4,
    /// Audio only
    Mp3,
}

impl OutputKind {
    pub fn ext(&self) -> &'static str {
        match self {
            OutputKind::Mp4 => "mp4",
            OutputKind::Mp3 => "mp3",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            OutputKind::Mp4 => "video/mp4",
            OutputKind::Mp3 => "audio/mpeg",
        }
    }

    /// Name used when the content id cannot be looked up
    pub fn fallback_filename(&self) -> &'static str {
        match self {
            OutputKind::Mp4 => "Downly_video.mp4",
            OutputKind::Mp3 => "Downly_audio.mp3",
        }
    }
}

impl std::fmt::Display for OutputKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.ext())
    }
}

/// Source platforms the pipeline knows how to talk to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Tiktok,
    Facebook,
    Youtube,
}

impl Platform {
    /// Infer the platform from a URL, defaulting to TikTok
    pub fn detect(url: &str) -> Self {
        let url_lower = url.to_lowercase();

        if url_lower.contains("youtube.com") || url_lower.contains("youtu.be") {
            Platform::Youtube
        } else if url_lower.contains("facebook.com") || url_lower.contains("fb.watch") {
            Platform::Facebook
        } else {
            Platform::Tiktok
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Tiktok => "tiktok",
            Platform::Facebook => "facebook",
            Platform::Youtube => "youtube",
        }
    }

    pub fn referer(&self) -> &'static str {
        match self {
            Platform::Tiktok => "https://www.tiktok.com/",
            Platform::Facebook => "https://www.facebook.com/",
            Platform::Youtube => "https://www.youtube.com/",
        }
    }

    /// Whether a session cookie can unlock private content here
    pub fn accepts_cookie(&self) -> bool {
        matches!(self, Platform::Facebook)
    }

    /// Whether candidates must already carry audio (no server-side merge)
    pub fn requires_muxed_audio(&self) -> bool {
        matches!(self, Platform::Tiktok)
    }

    /// Whether downloads are streamed straight from the extractor's stdout
    pub fn streams_live(&self) -> bool {
        matches!(self, Platform::Youtube)
    }

    /// Fallback thumbnail address keyed by content id
    pub fn default_thumbnail(&self, id: &str) -> Option<String> {
        match self {
            Platform::Youtube if !id.is_empty() => {
                Some(format!("https://i.ytimg.com/vi/{id}/hqdefault.jpg"))
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds extractor argument vectors for one request
#[derive(Debug, Clone)]
pub struct ExtractorArgs {
    platform: Platform,
    cookie: Option<String>,
    retries: u32,
}

impl ExtractorArgs {
    pub fn new(platform: Platform, cookie: Option<&str>, retries: u32) -> Self {
        let cookie = cookie
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string);

        Self {
            platform,
            cookie,
            retries,
        }
    }

    /// Flags shared by every extractor invocation
    fn common(&self) -> Vec<String> {
        let mut args = vec![
            "--no-playlist".to_string(),
            "--retries".to_string(),
            self.retries.to_string(),
            "--geo-bypass".to_string(),
        ];

        if self.platform == Platform::Youtube {
            args.extend(["--socket-timeout", "15", "--force-ipv4"].map(String::from));
        }

        args.push("--add-header".to_string());
        args.push(format!("User-Agent:{USER_AGENT}"));
        args.push("--add-header".to_string());
        args.push(format!("Referer:{}", self.platform.referer()));

        if self.platform.accepts_cookie() {
            if let Some(cookie) = &self.cookie {
                args.push("--add-header".to_string());
                args.push(format!("Cookie:{cookie}"));
            }
        }

        args
    }

    /// Flags shared by downloads, which must not leave .part files or chatter on stdout
    fn download_common(&self, ffmpeg: Option<&Path>) -> Vec<String> {
        let mut args = vec![
            "--no-part".to_string(),
            "--quiet".to_string(),
            "--no-warnings".to_string(),
        ];
        args.extend(self.common());

        if let Some(ffmpeg) = ffmpeg {
            args.push("--ffmpeg-location".to_string());
            args.push(ffmpeg.to_string_lossy().into_owned());
        }

        args
    }

    /// Dump the full metadata document for `url`
    pub fn inspect(&self, url: &str) -> Vec<String> {
        let mut args = vec!["-J".to_string(), url.to_string()];
        args.extend(self.common());
        args
    }

    /// Metadata for one specific format, used to name the download
    pub fn inspect_format(&self, url: &str, format_id: &str) -> Vec<String> {
        let mut args = vec![
            "-J".to_string(),
            url.to_string(),
            "-f".to_string(),
            format_id.to_string(),
        ];
        args.extend(self.common());
        args
    }

    /// Download into `output`, merging video with the best audio or extracting mp3
    pub fn download_to_file(
        &self,
        url: &str,
        format_id: &str,
        kind: OutputKind,
        output: &Path,
        ffmpeg: Option<&Path>,
    ) -> Vec<String> {
        let mut args = vec![url.to_string()];

        match kind {
            OutputKind::Mp3 => args.extend(audio_selection()),
            OutputKind::Mp4 => args.extend([
                "-f".to_string(),
                format!("{format_id}+bestaudio/best"),
                "--merge-output-format".to_string(),
                "mp4".to_string(),
            ]),
        }

        args.push("-o".to_string());
        args.push(output.to_string_lossy().into_owned());
        args.extend(self.download_common(ffmpeg));
        args
    }

    /// Download to stdout; prefers pre-merged formats so bytes start flowing early
    pub fn download_to_stdout(
        &self,
        url: &str,
        format_id: &str,
        kind: OutputKind,
        ffmpeg: Option<&Path>,
    ) -> Vec<String> {
        let mut args = vec![url.to_string()];

        match kind {
            OutputKind::Mp3 => args.extend(audio_selection()),
            OutputKind::Mp4 => args.extend([
                "-f".to_string(),
                format!("{format_id}/best[height<=1080]/best"),
                "--merge-output-format".to_string(),
                "mp4".to_string(),
            ]),
        }

        args.push("-o".to_string());
        args.push("-".to_string());
        args.extend(self.download_common(ffmpeg));
        args
    }
}

fn audio_selection() -> [String; 7] {
    [
        "-f",
        "bestaudio/best",
        "-x",
        "--audio-format",
        "mp3",
        "--audio-quality",
        "0",
    ]
    .map(String::from)
}

/// Rewrite into a faststart mp4, copying video and re-encoding audio to AAC
pub fn remux_args(input: &Path, output: &Path) -> Vec<String> {
    vec![
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
        "-y".to_string(),
        "-i".to_string(),
        input.to_string_lossy().into_owned(),
        "-c:v".to_string(),
        "copy".to_string(),
        "-c:a".to_string(),
        "aac".to_string(),
        "-b:a".to_string(),
        "160k".to_string(),
        "-movflags".to_string(),
        "+faststart".to_string(),
        output.to_string_lossy().into_owned(),
    ]
}

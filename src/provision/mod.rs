//! On-demand provisioning of the extractor and transcoder binaries.
//!
//! Each tool is resolved to a cached executable under the first writable tools directory.
//! Missing or structurally invalid binaries are downloaded again, staged next to their final
//! location and renamed into place, so concurrent hosts sharing a directory never observe a
//! half-written file.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;

pub mod fetch;

pub use fetch::{BinaryFetcher, HttpFetcher, MAX_REDIRECTS};

use crate::config::Config;
use crate::{DownlyError, Result};

const EXTRACTOR_RELEASE: &str = "https://github.com/yt-dlp/yt-dlp/releases/latest/download";
const TRANSCODER_RELEASE: &str = "https://github.com/eugeneware/ffmpeg-static/releases/download/b6.0";

/// External tools the pipeline depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tool {
    Extractor,
    Transcoder,
}

impl Tool {
    pub fn name(&self) -> &'static str {
        match self {
            Tool::Extractor => "yt-dlp",
            Tool::Transcoder => "ffmpeg",
        }
    }
}

impl std::fmt::Display for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Operating system family, which decides the executable header we accept
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOs {
    Windows,
    MacOs,
    Linux,
}

impl HostOs {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            HostOs::Windows
        } else if cfg!(target_os = "macos") {
            HostOs::MacOs
        } else {
            HostOs::Linux
        }
    }

    /// Check the first bytes of a file against this OS's executable format
    pub fn header_matches(&self, header: &[u8]) -> bool {
        match self {
            HostOs::Windows => header.starts_with(b"MZ"),
            HostOs::MacOs => {
                let Some(magic) = header.get(..4) else {
                    return false;
                };
                matches!(
                    u32::from_be_bytes([magic[0], magic[1], magic[2], magic[3]]),
                    // thin 32/64-bit, both byte orders
                    0xFEED_FACE | 0xFEED_FACF | 0xCEFA_EDFE | 0xCFFA_EDFE
                    // universal
                    | 0xCAFE_BABE | 0xBEBA_FECA
                )
            }
            HostOs::Linux => header.starts_with(&[0x7F, b'E', b'L', b'F']),
        }
    }
}

/// Static description of one external tool on one host
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub tool: Tool,
    pub binary_name: String,
    pub download_url: String,
    pub os: HostOs,
}

impl ToolSpec {
    /// Default release asset for the given host
    pub fn for_host(tool: Tool, os: HostOs, arch: &str) -> Self {
        let arm = matches!(arch, "aarch64" | "arm64");

        let (binary_name, download_url) = match (tool, os) {
            (Tool::Extractor, HostOs::Windows) => {
                ("yt-dlp.exe", format!("{EXTRACTOR_RELEASE}/yt-dlp.exe"))
            }
            (Tool::Extractor, HostOs::MacOs) => ("yt-dlp", format!("{EXTRACTOR_RELEASE}/yt-dlp_macos")),
            (Tool::Extractor, HostOs::Linux) => {
                let asset = if arm { "yt-dlp_linux_aarch64" } else { "yt-dlp_linux" };
                ("yt-dlp", format!("{EXTRACTOR_RELEASE}/{asset}"))
            }
            (Tool::Transcoder, HostOs::Windows) => {
                ("ffmpeg.exe", format!("{TRANSCODER_RELEASE}/ffmpeg-win32-x64"))
            }
            (Tool::Transcoder, HostOs::MacOs) => {
                let asset = if arm { "ffmpeg-darwin-arm64" } else { "ffmpeg-darwin-x64" };
                ("ffmpeg", format!("{TRANSCODER_RELEASE}/{asset}"))
            }
            (Tool::Transcoder, HostOs::Linux) => {
                let asset = if arm { "ffmpeg-linux-arm64" } else { "ffmpeg-linux-x64" };
                ("ffmpeg", format!("{TRANSCODER_RELEASE}/{asset}"))
            }
        };

        Self {
            tool,
            binary_name: binary_name.to_string(),
            download_url,
            os,
        }
    }

    pub fn current(tool: Tool) -> Self {
        Self::for_host(tool, HostOs::current(), std::env::consts::ARCH)
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.download_url = url.into();
        self
    }
}

/// A provisioned binary
#[derive(Debug, Clone)]
pub struct ToolHandle {
    pub path: PathBuf,
    pub validated: bool,
}

/// Resolves a tool to an executable path; the orchestrator only sees this seam
#[async_trait]
pub trait ToolResolver: Send + Sync {
    async fn resolve(&self, tool: Tool) -> Result<PathBuf>;
}

struct ToolSlot {
    spec: ToolSpec,
    handle: Mutex<Option<ToolHandle>>,
}

/// Downloads, validates and memoizes tool binaries
pub struct Provisioner {
    extractor: ToolSlot,
    transcoder: ToolSlot,
    dir_override: Option<PathBuf>,
    fetcher: Arc<dyn BinaryFetcher>,
}

impl Provisioner {
    pub fn new(
        extractor: ToolSpec,
        transcoder: ToolSpec,
        dir_override: Option<PathBuf>,
        fetcher: Arc<dyn BinaryFetcher>,
    ) -> Self {
        Self {
            extractor: ToolSlot {
                spec: extractor,
                handle: Mutex::new(None),
            },
            transcoder: ToolSlot {
                spec: transcoder,
                handle: Mutex::new(None),
            },
            dir_override,
            fetcher,
        }
    }

    /// Build a provisioner for this host from configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut extractor = ToolSpec::current(Tool::Extractor);
        if let Some(url) = &config.tools.extractor_url {
            extractor = extractor.with_url(url);
        }

        let mut transcoder = ToolSpec::current(Tool::Transcoder);
        if let Some(url) = &config.tools.transcoder_url {
            transcoder = transcoder.with_url(url);
        }

        Ok(Self::new(
            extractor,
            transcoder,
            config.tools.dir.clone(),
            Arc::new(HttpFetcher::new()?),
        ))
    }

    fn slot(&self, tool: Tool) -> &ToolSlot {
        match tool {
            Tool::Extractor => &self.extractor,
            Tool::Transcoder => &self.transcoder,
        }
    }

    /// Candidate directories in preference order
    fn candidate_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        if let Some(dir) = &self.dir_override {
            dirs.push(dir.clone());
        }
        dirs.push(std::env::temp_dir().join("downly").join("bin"));
        if let Some(cache) = dirs::cache_dir() {
            dirs.push(cache.join("downly").join("bin"));
        }
        dirs
    }

    /// First candidate directory that can be created and written to
    async fn tools_dir(&self) -> Result<PathBuf> {
        for dir in self.candidate_dirs() {
            match check_writable(&dir).await {
                Ok(()) => return Ok(dir),
                Err(e) => tracing::debug!("Tools dir {} not usable: {}", dir.display(), e),
            }
        }

        Err(DownlyError::Provision(
            "No writable directory for tool binaries".to_string(),
        ))
    }

    /// Return a validated path for `tool`, downloading it if necessary
    pub async fn ensure(&self, tool: Tool) -> Result<PathBuf> {
        let slot = self.slot(tool);
        let mut handle = slot.handle.lock().await;

        if let Some(cached) = handle.as_ref() {
            if has_valid_header(&cached.path, slot.spec.os).await {
                return Ok(cached.path.clone());
            }
            tracing::warn!(
                "Cached {} at {} failed validation, provisioning again",
                tool,
                cached.path.display()
            );
            *handle = None;
        }

        let path = self.provision(&slot.spec).await?;
        *handle = Some(ToolHandle {
            path: path.clone(),
            validated: true,
        });

        Ok(path)
    }

    async fn provision(&self, spec: &ToolSpec) -> Result<PathBuf> {
        let dir = self.tools_dir().await?;
        let dest = dir.join(&spec.binary_name);

        match read_header(&dest).await {
            Ok(header) if spec.os.header_matches(&header) => {
                tracing::debug!("Using cached {} at {}", spec.tool, dest.display());
                return Ok(dest);
            }
            Ok(_) => {
                tracing::warn!("Removing invalid {} binary at {}", spec.tool, dest.display());
                tokio::fs::remove_file(&dest).await.map_err(|e| {
                    DownlyError::Provision(format!("Failed to remove {}: {e}", dest.display()))
                })?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(DownlyError::Provision(format!(
                    "Cannot inspect {}: {e}",
                    dest.display()
                )))
            }
        }

        tracing::info!("Downloading {} from {}", spec.tool, spec.download_url);

        // Removed on drop unless persisted, so failed attempts leave nothing behind
        let staging = tempfile::Builder::new()
            .prefix(&format!(".{}-", spec.binary_name))
            .suffix(".part")
            .tempfile_in(&dir)
            .map_err(|e| DownlyError::Provision(format!("Failed to create staging file: {e}")))?
            .into_temp_path();

        let written = self.fetcher.fetch(&spec.download_url, &staging).await?;
        make_executable(&staging).await?;

        if !has_valid_header(&staging, spec.os).await {
            return Err(DownlyError::Provision(format!(
                "Downloaded {} is not a valid {:?} executable",
                spec.tool, spec.os
            )));
        }

        staging.persist(&dest).map_err(|e| {
            DownlyError::Provision(format!("Failed to install {}: {}", dest.display(), e.error))
        })?;

        if !has_valid_header(&dest, spec.os).await {
            let _ = tokio::fs::remove_file(&dest).await;
            return Err(DownlyError::Provision(format!(
                "Installed {} failed validation",
                spec.tool
            )));
        }

        tracing::info!(
            "Installed {} ({}) at {}",
            spec.tool,
            crate::utils::format_file_size(written),
            dest.display()
        );

        Ok(dest)
    }
}

#[async_trait]
impl ToolResolver for Provisioner {
    async fn resolve(&self, tool: Tool) -> Result<PathBuf> {
        self.ensure(tool).await
    }
}

async fn check_writable(dir: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let marker = dir.join(format!(".write-check-{}", uuid::Uuid::new_v4()));
    tokio::fs::write(&marker, b"").await?;
    tokio::fs::remove_file(&marker).await
}

async fn read_header(path: &Path) -> std::io::Result<Vec<u8>> {
    let file = tokio::fs::File::open(path).await?;
    let mut header = Vec::with_capacity(4);
    file.take(4).read_to_end(&mut header).await?;
    Ok(header)
}

async fn has_valid_header(path: &Path, os: HostOs) -> bool {
    read_header(path)
        .await
        .map(|header| os.header_matches(&header))
        .unwrap_or(false)
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .await
        .map_err(|e| DownlyError::Provision(format!("Failed to mark {} executable: {e}", path.display())))
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

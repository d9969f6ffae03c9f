//! Scratch files owned by a single request.
//!
//! Paths are namespaced by a request id so concurrent requests can share one directory. The
//! extractor leaves intermediates next to the paths it is given (`<id>_in.f137.mp4`,
//! `<id>_in.mp4.part`), so ownership and deletion work on the whole `<id>_` prefix rather than
//! on single paths.
//!
//! Deletion never fails a request: every removal returns an `io::Result` that callers log and
//! drop. Files handed to a transfer are removed only after the transfer reports that it is done
//! with them.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::transfer::TransferDone;
use crate::Result;

/// What a scratch file is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    Input,
    Output,
}

impl Purpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Purpose::Input => "in",
            Purpose::Output => "out",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TempArtifact {
    pub request_id: String,
    pub path: PathBuf,
    pub purpose: Purpose,
    pub created_at: DateTime<Utc>,
}

impl TempArtifact {
    pub fn exists(&self) -> bool {
        self.path.exists()
    }
}

/// Request-unique id: unix millis plus a random suffix
pub fn new_request_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", Utc::now().timestamp_millis(), &suffix[..8])
}

/// What a sweep removed
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: usize,
    pub freed_bytes: u64,
}

/// Allocates, tracks and deletes scratch files
#[derive(Clone)]
pub struct ArtifactManager {
    dir: PathBuf,
    max_bytes: u64,
    max_age: Duration,
    /// Request ids whose files must not be swept
    live: Arc<Mutex<HashSet<String>>>,
}

impl ArtifactManager {
    pub fn new(dir: impl Into<PathBuf>, max_bytes: u64, max_age: Duration) -> Self {
        Self {
            dir: dir.into(),
            max_bytes,
            max_age,
            live: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.cache.downloads_dir(),
            config.cache.max_bytes,
            config.cache.max_age(),
        )
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Reserve a path for `request_id`; the file itself is created by whoever writes it
    pub async fn allocate(&self, request_id: &str, purpose: Purpose, ext: &str) -> Result<TempArtifact> {
        tokio::fs::create_dir_all(&self.dir).await?;

        // registered before sweeping so the sweep spares this request's earlier files
        self.lock_live().insert(request_id.to_string());

        if let Err(e) = self.sweep().await {
            tracing::warn!("Sweeping {} failed: {}", self.dir.display(), e);
        }

        let path = self
            .dir
            .join(format!("{request_id}_{}.{ext}", purpose.as_str()));

        Ok(TempArtifact {
            request_id: request_id.to_string(),
            path,
            purpose,
            created_at: Utc::now(),
        })
    }

    /// Scratch set for one request, released on drop unless handed off
    pub fn scratch(&self, request_id: impl Into<String>) -> Scratch {
        Scratch {
            manager: self.clone(),
            request_id: request_id.into(),
            artifacts: Vec::new(),
            armed: true,
        }
    }

    /// Delete `artifacts` and every other file of their requests now.
    /// Every file is attempted and the first error is returned.
    pub async fn release_now(&self, artifacts: &[TempArtifact]) -> std::io::Result<()> {
        let mut first_err = None;

        for artifact in artifacts {
            match remove_if_present(&artifact.path).await {
                Ok(true) => tracing::debug!("Removed {}", artifact.path.display()),
                Ok(false) => {}
                Err(e) => {
                    tracing::debug!("Could not remove {}: {}", artifact.path.display(), e);
                    first_err.get_or_insert(e);
                }
            }
        }

        let requests: HashSet<&str> = artifacts.iter().map(|a| a.request_id.as_str()).collect();
        for request_id in requests {
            if let Err(e) = self.remove_request_files(request_id).await {
                tracing::debug!("Could not clear files of {}: {}", request_id, e);
                first_err.get_or_insert(e);
            }
            self.lock_live().remove(request_id);
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Delete `artifacts` after `delay`
    pub fn release_after(&self, artifacts: Vec<TempArtifact>, delay: Duration) -> JoinHandle<std::io::Result<()>> {
        let manager = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.release_now(&artifacts).await
        })
    }

    /// Delete `artifacts` `delay` after `done` fires (or its transfer is dropped)
    pub fn release_on(
        &self,
        artifacts: Vec<TempArtifact>,
        done: TransferDone,
        delay: Duration,
    ) -> JoinHandle<std::io::Result<()>> {
        let manager = self.clone();
        tokio::spawn(async move {
            let outcome = done.wait().await;
            tracing::debug!("Transfer {:?}, releasing {} artifacts", outcome, artifacts.len());
            match manager.release_after(artifacts, delay).await {
                Ok(result) => result,
                Err(e) => Err(std::io::Error::new(std::io::ErrorKind::Other, e)),
            }
        })
    }

    /// Remove stale files, then the oldest ones while the directory is over budget.
    /// Files of live requests count toward the budget but are never touched.
    pub async fn sweep(&self) -> std::io::Result<SweepReport> {
        let mut entries = Vec::new();
        let mut reader = match tokio::fs::read_dir(&self.dir).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(SweepReport::default()),
            Err(e) => return Err(e),
        };

        while let Some(entry) = reader.next_entry().await? {
            let metadata = match entry.metadata().await {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            entries.push((entry.path(), modified, metadata.len()));
        }

        let mut total: u64 = entries.iter().map(|(_, _, len)| len).sum();

        let live: Vec<String> = self.lock_live().iter().map(|id| format!("{id}_")).collect();
        entries.retain(|(path, _, _)| !owned_by_any(path, &live));
        entries.sort_by_key(|(_, modified, _)| *modified);

        let now = SystemTime::now();
        let mut report = SweepReport::default();

        for (path, modified, len) in entries {
            let stale = now
                .duration_since(modified)
                .map(|age| age > self.max_age)
                .unwrap_or(false);
            if !stale && total <= self.max_bytes {
                continue;
            }

            if remove_if_present(&path).await.unwrap_or(false) {
                total = total.saturating_sub(len);
                report.removed += 1;
                report.freed_bytes += len;
            }
        }

        if report.removed > 0 {
            tracing::info!(
                "Swept {} stale artifacts ({})",
                report.removed,
                crate::utils::format_file_size(report.freed_bytes)
            );
        }

        Ok(report)
    }

    /// Number of requests currently owning artifacts
    pub fn live_count(&self) -> usize {
        self.lock_live().len()
    }

    /// Remove every file named `<request_id>_*`
    async fn remove_request_files(&self, request_id: &str) -> std::io::Result<()> {
        let prefix = format!("{request_id}_");
        let mut reader = match tokio::fs::read_dir(&self.dir).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };

        let mut first_err = None;
        while let Some(entry) = reader.next_entry().await? {
            let path = entry.path();
            if !owned_by_any(&path, std::slice::from_ref(&prefix)) {
                continue;
            }
            if !entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            match remove_if_present(&path).await {
                Ok(true) => tracing::debug!("Removed {}", path.display()),
                Ok(false) => {}
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn lock_live(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.live.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Artifacts of one request that are removed when the set is dropped, unless they were
/// released or handed to a transfer first. Dropping happens when a request future is
/// cancelled mid-download.
pub struct Scratch {
    manager: ArtifactManager,
    request_id: String,
    artifacts: Vec<TempArtifact>,
    armed: bool,
}

impl Scratch {
    /// Allocate another artifact for this request
    pub async fn allocate(&mut self, purpose: Purpose, ext: &str) -> Result<TempArtifact> {
        let artifact = self.manager.allocate(&self.request_id, purpose, ext).await?;
        self.artifacts.push(artifact.clone());
        Ok(artifact)
    }

    /// Delete everything now
    pub async fn release_now(mut self) -> std::io::Result<()> {
        // stays armed until done, so a cancelled release is retried on drop
        let result = self.manager.release_now(&self.artifacts).await;
        self.armed = false;
        result
    }

    /// Hand the set to a transfer; deletion follows `done` by `delay`
    pub fn release_on(mut self, done: TransferDone, delay: Duration) -> JoinHandle<std::io::Result<()>> {
        self.armed = false;
        let artifacts = std::mem::take(&mut self.artifacts);
        self.manager.release_on(artifacts, done, delay)
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if self.artifacts.is_empty() {
            self.manager.lock_live().remove(&self.request_id);
            return;
        }

        let artifacts = std::mem::take(&mut self.artifacts);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::debug!("Request {} abandoned, releasing its artifacts", self.request_id);
                let manager = self.manager.clone();
                handle.spawn(async move {
                    if let Err(e) = manager.release_now(&artifacts).await {
                        tracing::warn!("Cleanup after abandoned download: {}", e);
                    }
                });
            }
            Err(_) => {
                // no runtime to delete on; unregister so the age sweep reclaims the files
                self.manager.lock_live().remove(&self.request_id);
            }
        }
    }
}

/// Whether the file name starts with one of `prefixes`
fn owned_by_any(path: &Path, prefixes: &[String]) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map_or(false, |name| prefixes.iter().any(|p| name.starts_with(p.as_str())))
}

/// `Ok(false)` when there was nothing to remove
async fn remove_if_present(path: &Path) -> std::io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

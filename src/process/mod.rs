//! Running the extractor and transcoder as child processes.
//!
//! Bounded calls (`run`, `inspect_json`, `transcode`) wait for the process to exit and capture
//! its output. Streaming calls hand back a [`ByteSource`] immediately; a single driver task owns
//! the child and walks it through `Starting -> Streaming -> Completed | Failed | TimedOut | Killed`,
//! releasing the timer, the pipe and the process on whichever terminal transition happens.

use bytes::{Bytes, BytesMut};
use futures_util::Stream;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

pub mod args;

pub use args::{remux_args, ExtractorArgs, OutputKind, Platform, USER_AGENT};

use crate::provision::{Tool, ToolResolver};
use crate::{DownlyError, Result};

/// Read size for subprocess stdout
const CHUNK_SIZE: usize = 64 * 1024;

/// Chunks buffered between the driver task and the consumer
const CHANNEL_CAPACITY: usize = 4;

/// Lines of stderr kept for error messages
const STDERR_TAIL_LINES: usize = 20;

/// Lifecycle of a streaming subprocess
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    Starting,
    Streaming,
    Completed,
    Failed(Option<i32>),
    TimedOut,
    Killed,
}

impl ProcessState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProcessState::Starting | ProcessState::Streaming)
    }
}

/// Live output of a streaming subprocess.
///
/// Dropping the source cancels it, which kills the subprocess.
pub struct ByteSource {
    rx: mpsc::Receiver<Result<Bytes>>,
    cancel: CancellationToken,
    state: watch::Receiver<ProcessState>,
    pid: Option<u32>,
    _guard: DropGuard,
}

impl ByteSource {
    /// Next chunk in arrival order, `None` once the process has finished cleanly
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes>> {
        self.rx.recv().await
    }

    /// Kill the subprocess and release its pipe
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Watch the process state machine
    pub fn state(&self) -> watch::Receiver<ProcessState> {
        self.state.clone()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl Stream for ByteSource {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Spawns tools and supervises them
pub struct ProcessOrchestrator {
    tools: Arc<dyn ToolResolver>,
    first_byte_timeout: Duration,
}

impl ProcessOrchestrator {
    pub fn new(tools: Arc<dyn ToolResolver>, first_byte_timeout: Duration) -> Self {
        Self {
            tools,
            first_byte_timeout,
        }
    }

    /// Resolve (and provision if needed) the binary for `tool`
    pub async fn tool_path(&self, tool: Tool) -> Result<PathBuf> {
        self.tools.resolve(tool).await
    }

    /// Run to completion and return stdout
    pub async fn run(&self, tool: Tool, args: &[String]) -> Result<String> {
        let program = self.tool_path(tool).await?;
        tracing::debug!("Running {} {:?}", tool, args);

        let started = Instant::now();
        let output = Command::new(&program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| failure(tool, format!("Failed to start {}: {e}", program.display())))?;

        tracing::debug!(
            "{} exited with {} after {:?}",
            tool,
            output.status,
            started.elapsed()
        );

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(failure(
                tool,
                format!("{tool} failed ({}): {}", output.status, tail(&stderr)),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run the extractor and parse its stdout as a JSON document
    pub async fn inspect_json(&self, args: &[String]) -> Result<serde_json::Value> {
        let stdout = self.run(Tool::Extractor, args).await?;

        serde_json::from_str(stdout.trim()).map_err(|e| {
            DownlyError::Extraction(format!("{} returned unparseable metadata: {e}", Tool::Extractor))
        })
    }

    /// Run the transcoder to completion
    pub async fn transcode(&self, args: &[String]) -> Result<()> {
        self.run(Tool::Transcoder, args).await.map(|_| ())
    }

    /// Spawn `tool` with stdout piped and return its output as a live source
    pub async fn stream(&self, tool: Tool, args: &[String]) -> Result<ByteSource> {
        let program = self.tool_path(tool).await?;
        tracing::debug!("Streaming {} {:?}", tool, args);

        let mut child = Command::new(&program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| failure(tool, format!("Failed to start {}: {e}", program.display())))?;

        let pid = child.id();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| failure(tool, "stdout was not captured".to_string()))?;
        let stderr = child.stderr.take().map(collect_stderr);

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ProcessState::Starting);
        let cancel = CancellationToken::new();

        let driver = Driver {
            tool,
            child,
            stdout,
            stderr,
            tx,
            cancel: cancel.clone(),
            state: state_tx,
            first_byte_timeout: self.first_byte_timeout,
            produced: 0,
        };
        tokio::spawn(driver.run());

        Ok(ByteSource {
            rx,
            cancel: cancel.clone(),
            state: state_rx,
            pid,
            _guard: cancel.drop_guard(),
        })
    }
}

enum ReadOutcome {
    Eof,
    Cancelled,
    TimedOut,
    ReadError(std::io::Error),
}

/// Sole owner of one streaming subprocess
struct Driver {
    tool: Tool,
    child: Child,
    stdout: ChildStdout,
    stderr: Option<JoinHandle<String>>,
    tx: mpsc::Sender<Result<Bytes>>,
    cancel: CancellationToken,
    state: watch::Sender<ProcessState>,
    first_byte_timeout: Duration,
    produced: u64,
}

impl Driver {
    async fn run(mut self) {
        let deadline = tokio::time::sleep(self.first_byte_timeout);
        tokio::pin!(deadline);

        let outcome = self.pump(deadline.as_mut()).await;

        match outcome {
            ReadOutcome::Cancelled => {
                self.kill().await;
                tracing::info!("{} cancelled after {} bytes", self.tool, self.produced);
                self.finish(ProcessState::Killed, None).await;
            }
            ReadOutcome::TimedOut => {
                self.kill().await;
                tracing::warn!(
                    "{} produced no data within {:?}, killed",
                    self.tool,
                    self.first_byte_timeout
                );
                let err = DownlyError::Timeout(self.first_byte_timeout);
                self.finish(ProcessState::TimedOut, Some(err)).await;
            }
            ReadOutcome::ReadError(e) => {
                self.kill().await;
                let err = failure(self.tool, format!("Reading {} output failed: {e}", self.tool));
                self.finish(ProcessState::Failed(None), Some(err)).await;
            }
            ReadOutcome::Eof => self.reap(deadline).await,
        }
    }

    /// Move stdout into the channel until EOF, cancellation, timeout or a read error
    async fn pump(&mut self, mut deadline: Pin<&mut tokio::time::Sleep>) -> ReadOutcome {
        let mut buf = BytesMut::with_capacity(CHUNK_SIZE);

        loop {
            buf.reserve(CHUNK_SIZE);

            let read = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return ReadOutcome::Cancelled,
                _ = &mut deadline, if self.produced == 0 => return ReadOutcome::TimedOut,
                read = self.stdout.read_buf(&mut buf) => read,
            };

            match read {
                Ok(0) => return ReadOutcome::Eof,
                Ok(n) => {
                    if self.produced == 0 {
                        tracing::debug!("{} first byte received, timeout disarmed", self.tool);
                        self.state.send_replace(ProcessState::Streaming);
                    }
                    self.produced += n as u64;
                    let chunk = buf.split().freeze();

                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return ReadOutcome::Cancelled,
                        sent = self.tx.send(Ok(chunk)) => {
                            // consumer went away
                            if sent.is_err() {
                                return ReadOutcome::Cancelled;
                            }
                        }
                    }
                }
                Err(e) => return ReadOutcome::ReadError(e),
            }
        }
    }

    /// stdout closed; wait for the exit status and report it
    async fn reap(mut self, mut deadline: Pin<&mut tokio::time::Sleep>) {
        let status = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.kill().await;
                self.finish(ProcessState::Killed, None).await;
                return;
            }
            _ = &mut deadline, if self.produced == 0 => {
                self.kill().await;
                let err = DownlyError::Timeout(self.first_byte_timeout);
                self.finish(ProcessState::TimedOut, Some(err)).await;
                return;
            }
            status = self.child.wait() => status,
        };

        let stderr = match self.stderr.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        match status {
            Ok(status) if status.success() => {
                tracing::info!("{} completed, {} bytes", self.tool, self.produced);
                self.finish(ProcessState::Completed, None).await;
            }
            Ok(status) => {
                let message = if self.produced == 0 {
                    format!("{} failed ({status}): {stderr}", self.tool)
                } else {
                    format!(
                        "{} exited ({status}) after {} bytes, output truncated: {stderr}",
                        self.tool, self.produced
                    )
                };
                tracing::warn!("{}", message);
                let err = failure(self.tool, message);
                self.finish(ProcessState::Failed(status.code()), Some(err)).await;
            }
            Err(e) => {
                let err = failure(self.tool, format!("Waiting for {} failed: {e}", self.tool));
                self.finish(ProcessState::Failed(None), Some(err)).await;
            }
        }
    }

    async fn kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            tracing::debug!("{} kill: {}", self.tool, e);
        }
        let _ = self.child.wait().await;
        if let Some(task) = self.stderr.take() {
            task.abort();
        }
    }

    /// Publish the terminal state, then hand the error (if any) to the consumer
    async fn finish(self, state: ProcessState, err: Option<DownlyError>) {
        self.state.send_replace(state);

        if let Some(err) = err {
            tokio::select! {
                _ = self.cancel.cancelled() => {}
                _ = self.tx.send(Err(err)) => {}
            }
        }
    }
}

fn collect_stderr(stderr: ChildStderr) -> JoinHandle<String> {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut lines = VecDeque::with_capacity(STDERR_TAIL_LINES);
        let mut line = Vec::new();

        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    if lines.len() == STDERR_TAIL_LINES {
                        lines.pop_front();
                    }
                    lines.push_back(String::from_utf8_lossy(&line).trim_end().to_string());
                }
            }
        }

        Vec::from(lines).join("\n").trim().to_string()
    })
}

/// Last few lines of tool output
fn tail(text: &str) -> String {
    let lines: Vec<&str> = text.trim().lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

/// Failure of `tool`, classified by which tool it was
fn failure(tool: Tool, message: String) -> DownlyError {
    match tool {
        Tool::Extractor => DownlyError::Extraction(message),
        Tool::Transcoder => DownlyError::Transcode(message),
    }
}

//! Real-time follower for the engine access log
//!
//! Starts at the end of the file and polls for appended bytes. A file that
//! shrinks (truncated in place) or is replaced by a new file is read again
//! from its beginning.

use crate::access_log::parse_line;
use crate::client_ips::ClientIpState;
use crate::engine_config::ConfigProvider;
use crate::jobs::Job;
use async_trait::async_trait;
use chrono::Local;
use parking_lot::Mutex;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Incremental reader over a growing log file
pub struct LogTail {
    path: PathBuf,
    file: Option<File>,
    file_id: Option<u64>,
    pos: u64,
    partial: Vec<u8>,
    start_at_end: bool,
}

impl LogTail {
    /// `start_at_end` skips what is already in the file on the first open
    pub fn new(path: impl Into<PathBuf>, start_at_end: bool) -> Self {
        Self {
            path: path.into(),
            file: None,
            file_id: None,
            pos: 0,
            partial: Vec::new(),
            start_at_end,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Complete lines appended since the previous call
    pub async fn read_new_lines(&mut self) -> std::io::Result<Vec<String>> {
        let metadata = match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if self.file.take().is_some() {
                    debug!(path = %self.path.display(), "Access log removed, waiting for it to reappear");
                }
                // Whatever appears next is a new file
                self.start_at_end = false;
                self.reset();
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let id = file_id(&metadata);
        if self.file.is_some() && id.is_some() && id != self.file_id {
            debug!(path = %self.path.display(), "Access log replaced, reopening");
            self.file = None;
            self.reset();
        }

        if self.file.is_none() {
            let file = File::open(&self.path).await?;
            self.file_id = id;
            self.pos = if self.start_at_end { metadata.len() } else { 0 };
            self.start_at_end = false;
            self.file = Some(file);
        }

        if metadata.len() < self.pos {
            debug!(path = %self.path.display(), "Access log truncated, reading from start");
            self.reset();
        }
        if metadata.len() == self.pos {
            return Ok(Vec::new());
        }

        let Some(file) = self.file.as_mut() else {
            return Ok(Vec::new());
        };
        file.seek(SeekFrom::Start(self.pos)).await?;
        let mut buf = Vec::new();
        let read = file.read_to_end(&mut buf).await?;
        self.pos += read as u64;

        Ok(self.split_lines(buf))
    }

    fn reset(&mut self) {
        self.pos = 0;
        self.partial.clear();
    }

    fn split_lines(&mut self, buf: Vec<u8>) -> Vec<String> {
        let mut data = std::mem::take(&mut self.partial);
        data.extend_from_slice(&buf);

        let mut lines = Vec::new();
        let mut start = 0;
        for (i, byte) in data.iter().enumerate() {
            if *byte == b'\n' {
                let line = String::from_utf8_lossy(&data[start..i]);
                lines.push(line.trim_end_matches('\r').to_string());
                start = i + 1;
            }
        }
        self.partial = data[start..].to_vec();
        lines
    }
}

#[cfg(unix)]
fn file_id(metadata: &std::fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(metadata.ino())
}

#[cfg(not(unix))]
fn file_id(_metadata: &std::fs::Metadata) -> Option<u64> {
    None
}

/// Streaming path feeding [`ClientIpState`] from the live access log
pub struct LogStreamer {
    provider: Arc<dyn ConfigProvider>,
    state: Arc<ClientIpState>,
    poll_interval: Duration,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl LogStreamer {
    pub fn new(
        provider: Arc<dyn ConfigProvider>,
        state: Arc<ClientIpState>,
        poll_interval: Duration,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            provider,
            state,
            poll_interval,
            shutdown_tx,
            handle: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Job for LogStreamer {
    fn name(&self) -> &str {
        "access-log-streamer"
    }

    fn start(&self) -> anyhow::Result<()> {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            anyhow::bail!("log streamer is already started");
        }

        let path = self
            .provider
            .engine_config()?
            .access_log_path()
            .ok_or_else(|| anyhow::anyhow!("engine access log is disabled"))?;

        info!(path = %path.display(), "Following engine access log");
        let tail = LogTail::new(path, true);
        let state = Arc::clone(&self.state);
        let shutdown_rx = self.shutdown_tx.subscribe();
        *handle = Some(tokio::spawn(follow(tail, state, self.poll_interval, shutdown_rx)));
        Ok(())
    }

    async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Log streamer task ended abnormally");
            }
        }
    }
}

async fn follow(
    mut tail: LogTail,
    state: Arc<ClientIpState>,
    poll_interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        match tail.read_new_lines().await {
            Ok(lines) => {
                let now = Local::now();
                for line in lines {
                    if let Some(observation) = parse_line(&line) {
                        state.observe(&observation, now);
                    }
                }
            }
            Err(e) => debug!(path = %tail.path().display(), error = %e, "Access log not readable"),
        }

        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
    debug!("Log streamer stopped");
}

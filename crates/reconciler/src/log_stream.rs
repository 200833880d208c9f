//! Per-instance device log capture.
//!
//! [`LogStreamer`] owns one background task per streamed instance. Each
//! task drains the driver's log stream into a [`RotatingLogFile`] until
//! the stream ends or its cancellation token fires. Starting is keyed by
//! instance name, so a second `start` for a live stream is a no-op.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use droidfleet_core::driver::{DeviceError, LogStream};
use futures::StreamExt;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// RotatingLogFile
// ---------------------------------------------------------------------------

/// Append-only log file that keeps a single previous generation.
///
/// Once a write would push the file past `max_bytes`, the current file is
/// renamed to `<path>.1` (replacing any older generation) and a fresh file
/// is started.
pub struct RotatingLogFile {
    path: PathBuf,
    max_bytes: u64,
    file: File,
    written: u64,
}

impl RotatingLogFile {
    pub async fn open(path: impl Into<PathBuf>, max_bytes: u64) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = open_append(&path).await?;
        let written = file.metadata().await?.len();
        Ok(Self {
            path,
            max_bytes,
            file,
            written,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write_line(&mut self, line: &str) -> io::Result<()> {
        let len = line.len() as u64 + 1;
        if self.written > 0 && self.written + len > self.max_bytes {
            self.rotate().await?;
        }
        self.file.write_all(line.as_bytes()).await?;
        self.file.write_all(b"\n").await?;
        self.written += len;
        Ok(())
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        self.file.flush().await
    }

    async fn rotate(&mut self) -> io::Result<()> {
        self.file.flush().await?;
        tokio::fs::rename(&self.path, rotated_path(&self.path)).await?;
        self.file = open_append(&self.path).await?;
        self.written = 0;
        tracing::debug!(path = %self.path.display(), "Rotated device log");
        Ok(())
    }
}

async fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path).await
}

/// `<path>.1`
pub fn rotated_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".1");
    PathBuf::from(name)
}

/// Last `lines` lines of the file at `path`. A missing file reads as empty.
pub async fn tail(path: &Path, lines: usize) -> io::Result<Vec<String>> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let all: Vec<&str> = contents.lines().collect();
    let start = all.len().saturating_sub(lines);
    Ok(all[start..].iter().map(|l| l.to_string()).collect())
}

/// Truncate the file at `path` and delete its rotated sibling.
pub async fn clear(path: &Path) -> io::Result<()> {
    if tokio::fs::try_exists(path).await? {
        File::create(path).await?;
    }
    match tokio::fs::remove_file(rotated_path(path)).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// LogStreamer
// ---------------------------------------------------------------------------

struct ActiveStream {
    address: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Tracks the running log capture task per instance.
pub struct LogStreamer {
    dir: PathBuf,
    max_bytes: u64,
    active: Mutex<HashMap<String, ActiveStream>>,
}

impl LogStreamer {
    pub fn new(dir: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            dir: dir.into(),
            max_bytes,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Log file for `instance`. Characters outside `[A-Za-z0-9._-]` are
    /// replaced so hypervisor titles cannot escape the log directory.
    pub fn log_path(&self, instance: &str) -> PathBuf {
        let safe: String = instance
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{safe}.log"))
    }

    /// Whether a capture task for `instance` is still alive. Finished
    /// tasks are pruned here.
    pub async fn is_streaming(&self, instance: &str) -> bool {
        let mut active = self.active.lock().await;
        match active.get(instance) {
            Some(stream) if !stream.handle.is_finished() => true,
            Some(_) => {
                active.remove(instance);
                false
            }
            None => false,
        }
    }

    /// Begin capturing `stream` for `instance`. Returns `false` if a
    /// capture is already running.
    pub async fn start(
        &self,
        instance: &str,
        address: &str,
        stream: LogStream,
    ) -> Result<bool, DeviceError> {
        let mut active = self.active.lock().await;
        if let Some(existing) = active.get(instance) {
            if !existing.handle.is_finished() {
                return Ok(false);
            }
        }

        let path = self.log_path(instance);
        let file = RotatingLogFile::open(&path, self.max_bytes)
            .await
            .map_err(|e| DeviceError::Unavailable(format!("cannot open {}: {e}", path.display())))?;

        let cancel = CancellationToken::new();
        let name = instance.to_string();
        let handle = tokio::spawn(capture(name, stream, file, cancel.clone()));

        tracing::info!(instance = %instance, address = %address, "Started log streaming");
        active.insert(
            instance.to_string(),
            ActiveStream {
                address: address.to_string(),
                cancel,
                handle,
            },
        );
        Ok(true)
    }

    /// Stop capturing for `instance`. Returns `true` if a capture existed.
    pub async fn stop(&self, instance: &str) -> bool {
        let removed = self.active.lock().await.remove(instance);
        match removed {
            Some(stream) => {
                stream.cancel.cancel();
                let _ = stream.handle.await;
                tracing::info!(instance = %instance, address = %stream.address, "Stopped log streaming");
                true
            }
            None => false,
        }
    }

    pub async fn stop_all(&self) {
        let drained: Vec<(String, ActiveStream)> = self.active.lock().await.drain().collect();
        for (instance, stream) in drained {
            stream.cancel.cancel();
            let _ = stream.handle.await;
            tracing::debug!(instance = %instance, "Log stream stopped");
        }
    }
}

async fn capture(
    instance: String,
    mut stream: LogStream,
    mut file: RotatingLogFile,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => match next {
                Some(line) => {
                    if let Err(e) = file.write_line(&line).await {
                        tracing::error!(
                            instance = %instance,
                            path = %file.path().display(),
                            error = %e,
                            "Device log write failed",
                        );
                        break;
                    }
                }
                None => {
                    tracing::debug!(instance = %instance, "Device log stream ended");
                    break;
                }
            },
        }
    }
    if let Err(e) = file.flush().await {
        tracing::warn!(instance = %instance, error = %e, "Device log flush failed");
    }
}

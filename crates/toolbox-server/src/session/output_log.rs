//! Terminal output logs.
//!
//! Every shell session appends its raw output to
//! `<log_dir>/<place>/<placeId or "_">/<workerId>.log`. Appending is
//! best-effort: a dedicated writer task drains a bounded channel, and when the
//! channel is full the chunk is dropped rather than stalling the relay.

use super::backend::Place;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use toolbox_core::{ToolboxError, ToolboxResult};
use tracing::{debug, error, warn};

/// Chunks queued for the writer before output starts being dropped.
const LOG_QUEUE: usize = 256;

/// Replace anything that could climb out of the log directory.
fn sanitize(component: &str) -> String {
    let cleaned: String = component
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@') {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
        .replace("..", "__");
    let trimmed = cleaned.trim_matches('.');
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Resolves log paths under one root directory.
#[derive(Debug, Clone)]
pub struct LogStore {
    root: PathBuf,
}

/// A log file as reported by [`LogStore::list`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogFileInfo {
    pub worker_id: String,
    pub size: u64,
    pub modified: Option<u64>,
}

impl LogStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir(&self, place: Place, place_id: Option<&str>) -> PathBuf {
        self.root
            .join(place.as_str())
            .join(sanitize(place_id.unwrap_or("_")))
    }

    /// Log file for one worker; the same inputs always give the same path.
    pub fn path(&self, place: Place, place_id: Option<&str>, worker_id: &str) -> PathBuf {
        self.dir(place, place_id)
            .join(format!("{}.log", sanitize(worker_id)))
    }

    /// Logs kept for one place, sorted by worker id.
    pub async fn list(&self, place: Place, place_id: Option<&str>) -> ToolboxResult<Vec<LogFileInfo>> {
        let dir = self.dir(place, place_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("log") {
                continue;
            }
            let Some(worker_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let meta = entry.metadata().await?;
            files.push(LogFileInfo {
                worker_id: worker_id.to_string(),
                size: meta.len(),
                modified: meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_secs()),
            });
        }
        files.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        Ok(files)
    }

    /// Remove one log file.
    pub async fn delete(&self, place: Place, place_id: Option<&str>, worker_id: &str) -> ToolboxResult<()> {
        let path = self.path(place, place_id, worker_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ToolboxError::NotFound(format!("log {worker_id}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Truncate one log file, keeping it in place.
    pub async fn clean(&self, place: Place, place_id: Option<&str>, worker_id: &str) -> ToolboxResult<()> {
        let path = self.path(place, place_id, worker_id);
        match OpenOptions::new().write(true).truncate(true).open(&path).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ToolboxError::NotFound(format!("log {worker_id}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Full contents of one log file.
    pub async fn read(&self, place: Place, place_id: Option<&str>, worker_id: &str) -> ToolboxResult<Vec<u8>> {
        let path = self.path(place, place_id, worker_id);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ToolboxError::NotFound(format!("log {worker_id}")))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Handle for appending one session's output. Dropping it stops the writer
/// once the queue is drained.
#[derive(Clone)]
pub struct OutputLog {
    path: PathBuf,
    tx: mpsc::Sender<Vec<u8>>,
}

impl OutputLog {
    /// Start a writer task appending to `path`.
    pub fn open(path: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(LOG_QUEUE);
        let writer_path = path.clone();
        tokio::spawn(async move {
            let mut file = match open_append(&writer_path).await {
                Ok(file) => file,
                Err(e) => {
                    error!(path = %writer_path.display(), error = %e, "cannot open terminal log");
                    // Drain so appends keep succeeding silently.
                    while rx.recv().await.is_some() {}
                    return;
                }
            };
            while let Some(chunk) = rx.recv().await {
                let written = match file.write_all(&chunk).await {
                    Ok(()) => file.flush().await,
                    Err(e) => Err(e),
                };
                if let Err(e) = written {
                    error!(path = %writer_path.display(), error = %e, "failed to write terminal log");
                }
            }
            debug!(path = %writer_path.display(), "terminal log closed");
        });
        Self { path, tx }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue `data` for appending; never waits.
    pub fn append(&self, data: &[u8]) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.tx.try_send(data.to_vec()) {
            warn!(path = %self.path.display(), bytes = data.len(), "terminal log queue full, dropping output");
        }
    }
}

async fn open_append(path: &Path) -> std::io::Result<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    OpenOptions::new().create(true).append(true).open(path).await
}

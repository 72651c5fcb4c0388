//! What a terminal session is attached to.
//!
//! A [`TerminalBackend`] is a byte pipe to a shell (local PTY or SSH channel).
//! A [`FileChannel`] is an SFTP-style file transfer channel. Both are
//! blocking interfaces: callers run them on `spawn_blocking` workers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::Arc;
use toolbox_core::{ToolboxError, ToolboxResult, WindowSize};

/// Where a session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Place {
    Local,
    Ssh,
    Sftp,
}

impl Place {
    pub fn as_str(&self) -> &'static str {
        match self {
            Place::Local => "local",
            Place::Ssh => "ssh",
            Place::Sftp => "sftp",
        }
    }
}

impl fmt::Display for Place {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Place {
    type Err = ToolboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Place::Local),
            "ssh" => Ok(Place::Ssh),
            "sftp" => Ok(Place::Sftp),
            other => Err(ToolboxError::InvalidMessage(format!("unknown place: {other}"))),
        }
    }
}

/// Identifies what a session connects to and where its output log goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTarget {
    pub place: Place,
    /// Host id for `ssh`/`sftp`; unused for `local`.
    pub place_id: Option<String>,
    /// Client-chosen tab/worker name; names the log file.
    pub worker_id: String,
}

impl SessionTarget {
    pub fn local(worker_id: &str) -> Self {
        Self {
            place: Place::Local,
            place_id: None,
            worker_id: worker_id.to_string(),
        }
    }

    pub fn remote(place: Place, place_id: &str, worker_id: &str) -> Self {
        Self {
            place,
            place_id: Some(place_id.to_string()),
            worker_id: worker_id.to_string(),
        }
    }

    /// The host id, required for remote places.
    pub fn require_place_id(&self) -> ToolboxResult<&str> {
        self.place_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ToolboxError::InvalidMessage(format!("{} session requires a placeId", self.place)))
    }
}

/// A running shell.
///
/// `read` blocks until output is available and returns `Ok(0)` at end of
/// stream. `close` must unblock a concurrent `read`.
pub trait TerminalBackend: Send + Sync {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&self, data: &[u8]) -> io::Result<()>;

    fn resize(&self, size: WindowSize) -> ToolboxResult<()>;

    fn close(&self) -> ToolboxResult<()>;

    /// Whether the shell on the other end is a Windows shell.
    fn is_windows(&self) -> bool {
        false
    }
}

/// One directory entry returned by [`FileChannel::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    /// Seconds since the Unix epoch.
    pub modified: Option<u64>,
}

/// An open file-transfer channel.
pub trait FileChannel: Send + Sync {
    fn list(&self, dir: &str) -> ToolboxResult<Vec<FileEntry>>;

    fn put(&self, path: &str, data: &[u8]) -> ToolboxResult<()>;

    fn get(&self, path: &str) -> ToolboxResult<Vec<u8>>;

    fn close(&self) -> ToolboxResult<()>;
}

/// Opens backends for session targets.
#[async_trait]
pub trait BackendResolver: Send + Sync {
    async fn open_shell(
        &self,
        target: &SessionTarget,
        size: WindowSize,
    ) -> ToolboxResult<Arc<dyn TerminalBackend>>;

    async fn open_files(&self, target: &SessionTarget) -> ToolboxResult<Arc<dyn FileChannel>>;

    /// Dial and authenticate `target` once without keeping anything open.
    async fn check(&self, target: &SessionTarget) -> ToolboxResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn place_parses_known_names() {
        assert_eq!("ssh".parse::<Place>().unwrap(), Place::Ssh);
        assert_eq!(Place::Sftp.to_string(), "sftp");
        assert!("telnet".parse::<Place>().is_err());
    }

    #[test]
    fn remote_target_needs_place_id() {
        let target = SessionTarget {
            place: Place::Ssh,
            place_id: Some(String::new()),
            worker_id: "w".into(),
        };
        assert!(target.require_place_id().is_err());
        let target = SessionTarget::remote(Place::Ssh, "web-1", "w");
        assert_eq!(target.require_place_id().unwrap(), "web-1");
    }
}

//! Local shell backend using portable-pty.
//!
//! Opens a pseudo-terminal running the configured shell at a given size.
//! All methods block; the bridge calls them from `spawn_blocking`.

use super::backend::TerminalBackend;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use toolbox_core::{ToolboxError, ToolboxResult, WindowSize};
use tracing::{debug, info};

fn pty_size(size: WindowSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// A shell process attached to a local PTY.
pub struct LocalShell {
    reader: Mutex<Box<dyn Read + Send>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    /// Mutex because MasterPty is not Sync; `None` once closed.
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    closed: AtomicBool,
    windows: bool,
}

impl LocalShell {
    /// Spawn `command` (or the user's default shell) in a new PTY.
    pub fn spawn(command: Option<&str>, size: WindowSize) -> ToolboxResult<Self> {
        let pair = native_pty_system()
            .openpty(pty_size(size))
            .map_err(|e| ToolboxError::Backend(format!("failed to open PTY: {e}")))?;

        let mut cmd = match command {
            Some(command) => {
                let parts: Vec<&str> = command.split_whitespace().collect();
                let Some((program, args)) = parts.split_first() else {
                    return Err(ToolboxError::Config("empty shell command".into()));
                };
                let mut builder = CommandBuilder::new(program);
                builder.args(args);
                builder
            }
            None => CommandBuilder::new(default_shell()),
        };
        cmd.env("TERM", "xterm-256color");
        if let Some(home) = dirs::home_dir() {
            cmd.cwd(home);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| ToolboxError::Backend(format!("failed to spawn shell: {e}")))?;
        // The child holds its own slave fd; ours would keep reads from seeing EOF.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| ToolboxError::Backend(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| ToolboxError::Backend(format!("failed to take PTY writer: {e}")))?;

        info!(pid = ?child.process_id(), %size, "local shell spawned");

        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(Some(writer)),
            master: Mutex::new(Some(pair.master)),
            child: Mutex::new(child),
            closed: AtomicBool::new(false),
            windows: cfg!(windows),
        })
    }
}

fn default_shell() -> String {
    if cfg!(windows) {
        std::env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".to_string())
    } else {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
    }
}

fn poisoned() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "PTY lock poisoned")
}

impl TerminalBackend for LocalShell {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(0);
        }
        let mut reader = self.reader.lock().map_err(|_| poisoned())?;
        match reader.read(buf) {
            Ok(n) => Ok(n),
            // Linux reports EIO on the master once the child is gone.
            Err(_) if self.closed.load(Ordering::SeqCst) => Ok(0),
            Err(e) if e.raw_os_error() == Some(5) => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn write(&self, data: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().map_err(|_| poisoned())?;
        let writer = writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "shell closed"))?;
        writer.write_all(data)?;
        writer.flush()
    }

    fn resize(&self, size: WindowSize) -> ToolboxResult<()> {
        let master = self
            .master
            .lock()
            .map_err(|_| ToolboxError::Backend("PTY master lock poisoned".into()))?;
        let master = master
            .as_ref()
            .ok_or_else(|| ToolboxError::Backend("shell closed".into()))?;
        master
            .resize(pty_size(size))
            .map_err(|e| ToolboxError::Backend(format!("PTY resize failed: {e}")))?;
        debug!(%size, "PTY resized");
        Ok(())
    }

    fn close(&self) -> ToolboxResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Ok(mut writer) = self.writer.lock() {
            writer.take();
        }
        let killed = match self.child.lock() {
            Ok(mut child) => {
                let result = child.kill();
                let _ = child.try_wait();
                result
            }
            Err(_) => Ok(()),
        };
        if let Ok(mut master) = self.master.lock() {
            master.take();
        }
        debug!("local shell closed");
        // Kill fails with an error if the child already exited.
        if let Err(e) = killed {
            debug!(error = %e, "shell already exited");
        }
        Ok(())
    }

    fn is_windows(&self) -> bool {
        self.windows
    }
}

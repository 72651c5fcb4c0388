//! SSH client adapter built on libssh2.
//!
//! One authenticated [`ssh2::Session`] per host and credential set lives in
//! the [`ResourceCache`]. Shells and SFTP channels are opened on the shared
//! session, which runs in non-blocking mode so that channels do not hold the
//! session lock while they wait for data. Every libssh2 call goes through
//! [`retry`], which polls until the call stops returning `EAGAIN`.

use crate::config::HostEntry;
use crate::session::backend::{FileChannel, FileEntry, TerminalBackend};
use async_trait::async_trait;
use ssh2::{Channel, ErrorCode, Session, Sftp};
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use toolbox_core::{
    service_key, short_key, BackendKind, ResourceCache, Service, ToolboxError, ToolboxResult,
    WindowSize,
};
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT_MS: u32 = 15_000;
const KEEPALIVE_SECS: u32 = 30;
const POLL: Duration = Duration::from_millis(5);
/// Longest wait between reads of an idle shell.
const IDLE_POLL_MAX: Duration = Duration::from_millis(100);
/// Upper bound on polls for calls made while tearing down.
const CLOSE_POLLS: usize = 200;
const LIBSSH2_ERROR_EAGAIN: i32 = -37;

fn would_block(e: &ssh2::Error) -> bool {
    matches!(e.code(), ErrorCode::Session(LIBSSH2_ERROR_EAGAIN))
}

/// Call `op` until it stops returning `EAGAIN`.
fn retry<T>(mut op: impl FnMut() -> Result<T, ssh2::Error>) -> Result<T, ssh2::Error> {
    loop {
        match op() {
            Err(e) if would_block(&e) => std::thread::sleep(POLL),
            other => return other,
        }
    }
}

/// Like [`retry`] but gives up after [`CLOSE_POLLS`] attempts.
fn retry_bounded(mut op: impl FnMut() -> Result<(), ssh2::Error>) -> Result<(), ssh2::Error> {
    let mut attempts = 0;
    loop {
        match op() {
            Err(e) if would_block(&e) && attempts < CLOSE_POLLS => {
                attempts += 1;
                std::thread::sleep(POLL);
            }
            other => return other,
        }
    }
}

fn ssh_err(context: &str, e: ssh2::Error) -> ToolboxError {
    ToolboxError::Backend(format!("{context}: {e}"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SshAuth {
    Password(String),
    KeyFile {
        path: PathBuf,
        passphrase: Option<String>,
    },
}

/// A host plus the credentials used to log into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    /// Always `host:port`.
    pub address: String,
    pub username: String,
    pub auth: SshAuth,
}

impl SshTarget {
    pub fn from_host(host: &HostEntry) -> ToolboxResult<Self> {
        let auth = match (&host.private_key, &host.password) {
            (Some(key), _) if !key.is_empty() => SshAuth::KeyFile {
                path: crate::config::expand_tilde_str(key),
                passphrase: host.passphrase.clone().filter(|p| !p.is_empty()),
            },
            (_, Some(password)) => SshAuth::Password(password.clone()),
            _ => {
                return Err(ToolboxError::Config(format!(
                    "host {} has neither a password nor a private key",
                    host.id
                )))
            }
        };
        Ok(Self {
            address: with_default_port(&host.address),
            username: host.username.clone(),
            auth,
        })
    }

    /// Cache key; changes whenever the address or any credential changes.
    pub fn cache_key(&self) -> String {
        match &self.auth {
            SshAuth::Password(password) => service_key(
                BackendKind::Ssh,
                &[&self.address, &self.username, "password", password],
            ),
            SshAuth::KeyFile { path, passphrase } => service_key(
                BackendKind::Ssh,
                &[
                    &self.address,
                    &self.username,
                    "key",
                    &path.to_string_lossy(),
                    passphrase.as_deref().unwrap_or(""),
                ],
            ),
        }
    }
}

fn with_default_port(address: &str) -> String {
    let address = address.trim();
    if address.rsplit_once(':').is_some_and(|(_, port)| port.parse::<u16>().is_ok()) {
        address.to_string()
    } else {
        format!("{address}:22")
    }
}

/// An authenticated SSH connection shared through the cache.
pub struct SshService {
    label: String,
    session: Session,
    idle_timeout: Duration,
    last_used: Mutex<Instant>,
    open_channels: AtomicUsize,
}

impl SshService {
    /// Dial, handshake and authenticate. Blocks.
    pub fn connect(target: &SshTarget, idle_timeout: Duration) -> ToolboxResult<Self> {
        let addr = target
            .address
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| ToolboxError::Backend(format!("cannot resolve {}", target.address)))?;
        let tcp = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
            .map_err(|e| ToolboxError::Backend(format!("connect to {} failed: {e}", target.address)))?;

        let mut session = Session::new().map_err(|e| ssh_err("ssh session init failed", e))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(HANDSHAKE_TIMEOUT_MS);
        session
            .handshake()
            .map_err(|e| ssh_err("ssh handshake failed", e))?;

        match &target.auth {
            SshAuth::Password(password) => session.userauth_password(&target.username, password),
            SshAuth::KeyFile { path, passphrase } => session.userauth_pubkey_file(
                &target.username,
                None,
                path,
                passphrase.as_deref(),
            ),
        }
        .map_err(|e| ssh_err("ssh authentication failed", e))?;
        if !session.authenticated() {
            return Err(ToolboxError::Backend(format!(
                "ssh authentication failed for {}@{}",
                target.username, target.address
            )));
        }

        session.set_timeout(0);
        session.set_keepalive(true, KEEPALIVE_SECS);
        session.set_blocking(false);

        info!(address = %target.address, user = %target.username, "ssh session established");
        Ok(Self {
            label: format!("{}@{}", target.username, target.address),
            session,
            idle_timeout,
            last_used: Mutex::new(Instant::now()),
            open_channels: AtomicUsize::new(0),
        })
    }

    /// Log in to `target` on a throwaway connection and disconnect. Blocks.
    pub fn verify(target: &SshTarget) -> ToolboxResult<()> {
        let service = Self::connect(target, Duration::ZERO)?;
        retry_bounded(|| service.session.disconnect(None, "toolbox: check done", None))
            .map_err(|e| ssh_err("ssh disconnect failed", e))?;
        debug!(remote = %service.label, "ssh check passed");
        Ok(())
    }

    /// The cached connection for `target`, dialing it if needed.
    pub async fn cached(
        cache: &ResourceCache,
        target: SshTarget,
        idle_timeout: Duration,
    ) -> ToolboxResult<Arc<SshService>> {
        let key = target.cache_key();
        debug!(key = %short_key(&key), "resolving ssh service");
        cache
            .get_or_create(&key, move || async move {
                tokio::task::spawn_blocking(move || SshService::connect(&target, idle_timeout)).await?
            })
            .await
    }

    fn touch(&self) {
        if let Ok(mut last) = self.last_used.lock() {
            *last = Instant::now();
        }
    }

    fn lease(self: &Arc<Self>) -> Lease {
        self.open_channels.fetch_add(1, Ordering::SeqCst);
        self.touch();
        Lease {
            service: self.clone(),
        }
    }

    /// Open an interactive shell with a PTY of `size`.
    pub async fn open_shell(self: &Arc<Self>, size: WindowSize) -> ToolboxResult<SshShell> {
        let service = self.clone();
        tokio::task::spawn_blocking(move || {
            let session = &service.session;
            let mut channel =
                retry(|| session.channel_session()).map_err(|e| ssh_err("open channel failed", e))?;
            retry(|| {
                channel.request_pty(
                    "xterm-256color",
                    None,
                    Some((size.cols as u32, size.rows as u32, 0, 0)),
                )
            })
            .map_err(|e| ssh_err("pty request failed", e))?;
            retry(|| channel.shell()).map_err(|e| ssh_err("shell request failed", e))?;
            debug!(remote = %service.label, %size, "ssh shell opened");
            Ok(SshShell {
                channel: Mutex::new(channel),
                closed: AtomicBool::new(false),
                _lease: service.lease(),
            })
        })
        .await?
    }

    /// Open an SFTP channel.
    pub async fn open_sftp(self: &Arc<Self>) -> ToolboxResult<SftpFiles> {
        let service = self.clone();
        tokio::task::spawn_blocking(move || {
            let sftp = retry(|| service.session.sftp()).map_err(|e| ssh_err("sftp init failed", e))?;
            debug!(remote = %service.label, "sftp channel opened");
            Ok(SftpFiles {
                sftp: Mutex::new(Some(sftp)),
                _lease: service.lease(),
            })
        })
        .await?
    }
}

#[async_trait]
impl Service for SshService {
    fn kind(&self) -> BackendKind {
        BackendKind::Ssh
    }

    fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// A session with open channels counts as in use right now.
    fn last_used(&self) -> Option<Instant> {
        if self.open_channels.load(Ordering::SeqCst) > 0 {
            return Some(Instant::now());
        }
        self.last_used.lock().ok().map(|last| *last)
    }

    async fn stop(&self) -> ToolboxResult<()> {
        let session = self.session.clone();
        let label = self.label.clone();
        tokio::task::spawn_blocking(move || {
            retry_bounded(|| session.disconnect(None, "toolbox: connection closed", None))
                .map_err(|e| ssh_err("ssh disconnect failed", e))
        })
        .await??;
        info!(remote = %label, "ssh session closed");
        Ok(())
    }
}

/// Keeps the owning session marked busy while a channel is open.
struct Lease {
    service: Arc<SshService>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.service.open_channels.fetch_sub(1, Ordering::SeqCst);
        self.service.touch();
    }
}

/// Interactive shell on an SSH channel.
pub struct SshShell {
    channel: Mutex<Channel>,
    closed: AtomicBool,
    _lease: Lease,
}

/// Back off while a channel has nothing to read.
fn next_idle_wait(wait: Duration) -> Duration {
    (wait * 2).min(IDLE_POLL_MAX)
}

fn poisoned() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "ssh channel lock poisoned")
}

impl TerminalBackend for SshShell {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut wait = POLL;
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Ok(0);
            }
            let result = {
                let mut channel = self.channel.lock().map_err(|_| poisoned())?;
                channel.read(buf)
            };
            match result {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(wait);
                    wait = next_idle_wait(wait);
                }
                Err(_) if self.closed.load(Ordering::SeqCst) => return Ok(0),
                Err(e) => return Err(e),
            }
        }
    }

    fn write(&self, data: &[u8]) -> io::Result<()> {
        let mut written = 0;
        while written < data.len() {
            if self.closed.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "ssh shell closed"));
            }
            let result = {
                let mut channel = self.channel.lock().map_err(|_| poisoned())?;
                channel.write(&data[written..])
            };
            match result {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "ssh channel closed")),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => std::thread::sleep(POLL),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn resize(&self, size: WindowSize) -> ToolboxResult<()> {
        let mut channel = self
            .channel
            .lock()
            .map_err(|_| ToolboxError::Backend("ssh channel lock poisoned".into()))?;
        retry(|| channel.request_pty_size(size.cols as u32, size.rows as u32, None, None))
            .map_err(|e| ssh_err("pty resize failed", e))
    }

    fn close(&self) -> ToolboxResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut channel = self
            .channel
            .lock()
            .map_err(|_| ToolboxError::Backend("ssh channel lock poisoned".into()))?;
        if let Err(e) = retry_bounded(|| channel.close()) {
            warn!(error = %e, "ssh channel close failed");
        }
        Ok(())
    }
}

/// SFTP channel on a cached SSH session.
pub struct SftpFiles {
    sftp: Mutex<Option<Sftp>>,
    _lease: Lease,
}

impl SftpFiles {
    fn with_sftp<T>(&self, f: impl FnOnce(&Sftp) -> ToolboxResult<T>) -> ToolboxResult<T> {
        let guard = self
            .sftp
            .lock()
            .map_err(|_| ToolboxError::Backend("sftp lock poisoned".into()))?;
        let sftp = guard
            .as_ref()
            .ok_or_else(|| ToolboxError::Backend("sftp channel closed".into()))?;
        f(sftp)
    }
}

fn sftp_err(path: &str, e: ssh2::Error) -> ToolboxError {
    match e.code() {
        // LIBSSH2_FX_NO_SUCH_FILE, LIBSSH2_FX_NO_SUCH_PATH
        ErrorCode::SFTP(2) | ErrorCode::SFTP(10) => ToolboxError::NotFound(path.to_string()),
        _ => ssh_err(path, e),
    }
}

impl FileChannel for SftpFiles {
    fn list(&self, dir: &str) -> ToolboxResult<Vec<FileEntry>> {
        self.with_sftp(|sftp| {
            let entries = retry(|| sftp.readdir(Path::new(dir))).map_err(|e| sftp_err(dir, e))?;
            let mut files: Vec<FileEntry> = entries
                .into_iter()
                .filter_map(|(path, stat)| {
                    let name = path.file_name()?.to_string_lossy().into_owned();
                    Some(FileEntry {
                        name,
                        path: path.to_string_lossy().into_owned(),
                        is_dir: stat.is_dir(),
                        size: stat.size.unwrap_or(0),
                        modified: stat.mtime,
                    })
                })
                .collect();
            files.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));
            Ok(files)
        })
    }

    fn put(&self, path: &str, data: &[u8]) -> ToolboxResult<()> {
        self.with_sftp(|sftp| {
            let mut file = retry(|| sftp.create(Path::new(path))).map_err(|e| sftp_err(path, e))?;
            let mut written = 0;
            while written < data.len() {
                match file.write(&data[written..]) {
                    Ok(0) => return Err(ToolboxError::Backend(format!("{path}: write returned zero"))),
                    Ok(n) => written += n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => std::thread::sleep(POLL),
                    Err(e) => return Err(e.into()),
                }
            }
            debug!(path, bytes = data.len(), "sftp upload complete");
            Ok(())
        })
    }

    fn get(&self, path: &str) -> ToolboxResult<Vec<u8>> {
        self.with_sftp(|sftp| {
            let mut file = retry(|| sftp.open(Path::new(path))).map_err(|e| sftp_err(path, e))?;
            let mut data = Vec::new();
            let mut buf = [0u8; 32 * 1024];
            loop {
                match file.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => data.extend_from_slice(&buf[..n]),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => std::thread::sleep(POLL),
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(data)
        })
    }

    fn close(&self) -> ToolboxResult<()> {
        let mut guard = self
            .sftp
            .lock()
            .map_err(|_| ToolboxError::Backend("sftp lock poisoned".into()))?;
        guard.take();
        Ok(())
    }
}

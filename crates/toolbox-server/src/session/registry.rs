//! Terminal session lifecycle.
//!
//! One entry per live session, keyed by an opaque client-supplied token.
//! A key is reserved before the backend is dialed, so a second `start` for
//! the same key fails while the first is still connecting. Closing moves a
//! session `Active → Closing → Terminated`; exactly one caller performs the
//! teardown, and the entry leaves the map only after its backend and
//! transport have been released.

use super::backend::{BackendResolver, FileChannel, Place, SessionTarget, TerminalBackend};
use super::bridge;
use super::output_log::{LogStore, OutputLog};
use crate::transport::{FrameSink, Transport};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};
use toolbox_core::{ServerNotice, ToolboxError, ToolboxResult, WindowSize};
use tracing::{debug, info, warn};

/// Upper bound on delivering the final notice to a client.
const NOTICE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Active,
    Closing,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Shell,
    Files,
}

/// Why a session ended, as reported to its client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub reason: String,
    pub error: bool,
}

impl CloseReason {
    pub fn clean(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            error: false,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            error: true,
        }
    }

    fn notice(&self) -> ServerNotice {
        ServerNotice::closed(self.reason.clone(), self.error)
    }
}

enum Attachment {
    Shell(Arc<dyn TerminalBackend>),
    Files(Arc<dyn FileChannel>),
}

/// A registered session.
pub struct TerminalSession {
    key: String,
    target: SessionTarget,
    attachment: Attachment,
    sink: Option<Arc<dyn FrameSink>>,
    log: Mutex<Option<OutputLog>>,
    log_path: Option<PathBuf>,
    state: Mutex<SessionState>,
    size: Mutex<WindowSize>,
    stop_tx: watch::Sender<bool>,
    created_at: Instant,
}

/// Information returned when listing sessions.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub key: String,
    pub kind: SessionKind,
    pub place: Place,
    pub place_id: Option<String>,
    pub worker_id: String,
    pub state: SessionState,
    pub cols: u16,
    pub rows: u16,
    pub is_windows: bool,
    pub log_path: Option<PathBuf>,
    pub age_secs: u64,
}

impl TerminalSession {
    fn new(
        key: &str,
        target: SessionTarget,
        attachment: Attachment,
        sink: Option<Arc<dyn FrameSink>>,
        log: Option<OutputLog>,
        size: WindowSize,
    ) -> Self {
        let log_path = log.as_ref().map(|l| l.path().to_path_buf());
        Self {
            key: key.to_string(),
            target,
            attachment,
            sink,
            log: Mutex::new(log),
            log_path,
            state: Mutex::new(SessionState::Created),
            size: Mutex::new(size),
            stop_tx: watch::channel(false).0,
            created_at: Instant::now(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn target(&self) -> &SessionTarget {
        &self.target
    }

    pub fn kind(&self) -> SessionKind {
        match self.attachment {
            Attachment::Shell(_) => SessionKind::Shell,
            Attachment::Files(_) => SessionKind::Files,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// `Created|Active → Closing`; only one caller ever sees `true`.
    fn begin_closing(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match *state {
            SessionState::Created | SessionState::Active => {
                *state = SessionState::Closing;
                true
            }
            SessionState::Closing | SessionState::Terminated => false,
        }
    }

    pub fn size(&self) -> WindowSize {
        *self.size.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn log_path(&self) -> Option<&PathBuf> {
        self.log_path.as_ref()
    }

    pub fn is_windows(&self) -> bool {
        match &self.attachment {
            Attachment::Shell(backend) => backend.is_windows(),
            Attachment::Files(_) => false,
        }
    }

    pub fn shell(&self) -> Option<Arc<dyn TerminalBackend>> {
        match &self.attachment {
            Attachment::Shell(backend) => Some(backend.clone()),
            Attachment::Files(_) => None,
        }
    }

    pub fn files(&self) -> Option<Arc<dyn FileChannel>> {
        match &self.attachment {
            Attachment::Files(files) => Some(files.clone()),
            Attachment::Shell(_) => None,
        }
    }

    /// Receiver that flips to `true` when the session starts closing.
    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    fn output_log(&self) -> Option<OutputLog> {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn info(&self) -> SessionInfo {
        let size = self.size();
        SessionInfo {
            key: self.key.clone(),
            kind: self.kind(),
            place: self.target.place,
            place_id: self.target.place_id.clone(),
            worker_id: self.target.worker_id.clone(),
            state: self.state(),
            cols: size.cols,
            rows: size.rows,
            is_windows: self.is_windows(),
            log_path: self.log_path.clone(),
            age_secs: self.created_at.elapsed().as_secs(),
        }
    }

    /// Stop the relays, say goodbye to the client, release the backend.
    async fn teardown(&self, reason: &CloseReason) {
        self.stop_tx.send_replace(true);

        if let Some(sink) = &self.sink {
            match tokio::time::timeout(NOTICE_TIMEOUT, sink.send_notice(&reason.notice())).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(session_id = %self.key, error = %e, "close notice not delivered"),
                Err(_) => debug!(session_id = %self.key, "close notice timed out"),
            }
            if let Ok(Err(e)) = tokio::time::timeout(NOTICE_TIMEOUT, sink.close()).await {
                debug!(session_id = %self.key, error = %e, "transport close failed");
            }
        }

        let released = match &self.attachment {
            Attachment::Shell(backend) => {
                let backend = backend.clone();
                tokio::task::spawn_blocking(move || backend.close()).await
            }
            Attachment::Files(files) => {
                let files = files.clone();
                tokio::task::spawn_blocking(move || files.close()).await
            }
        };
        match released {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(session_id = %self.key, error = %e, "backend close failed"),
            Err(e) => warn!(session_id = %self.key, error = %e, "backend close panicked"),
        }

        self.log.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

enum Entry {
    /// Key reserved; backend still being dialed.
    Starting,
    Live(Arc<TerminalSession>),
}

/// Manages all terminal and file sessions.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Entry>>,
    resolver: Arc<dyn BackendResolver>,
    logs: LogStore,
}

impl SessionRegistry {
    pub fn new(resolver: Arc<dyn BackendResolver>, logs: LogStore) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            resolver,
            logs,
        }
    }

    pub fn logs(&self) -> &LogStore {
        &self.logs
    }

    async fn reserve(&self, key: &str) -> ToolboxResult<()> {
        if key.is_empty() {
            return Err(ToolboxError::InvalidMessage("session key is empty".into()));
        }
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(key) {
            return Err(ToolboxError::DuplicateSession(key.to_string()));
        }
        sessions.insert(key.to_string(), Entry::Starting);
        Ok(())
    }

    async fn release_reservation(&self, key: &str) {
        let mut sessions = self.sessions.write().await;
        if matches!(sessions.get(key), Some(Entry::Starting)) {
            sessions.remove(key);
        }
    }

    /// Swap the reservation for the live session. Fails if the key was
    /// closed while the backend was being dialed.
    async fn activate(&self, session: &Arc<TerminalSession>) -> bool {
        let mut sessions = self.sessions.write().await;
        if !matches!(sessions.get(&session.key), Some(Entry::Starting)) {
            return false;
        }
        session.set_state(SessionState::Active);
        sessions.insert(session.key.clone(), Entry::Live(session.clone()));
        true
    }

    /// Open a shell for `target` and bridge it to `transport`.
    ///
    /// Without a transport only the output log is fed.
    pub async fn start(
        self: &Arc<Self>,
        key: &str,
        target: SessionTarget,
        size: WindowSize,
        transport: Option<Transport>,
    ) -> ToolboxResult<Arc<TerminalSession>> {
        self.reserve(key).await?;
        let size = size.or(WindowSize::default());

        let backend = match self.resolver.open_shell(&target, size).await {
            Ok(backend) => backend,
            Err(e) => {
                self.release_reservation(key).await;
                warn!(session_id = %key, place = %target.place, error = %e, "session start failed");
                return Err(e);
            }
        };

        let log = OutputLog::open(self.logs.path(target.place, target.place_id.as_deref(), &target.worker_id));
        let (sink, source) = match transport {
            Some(t) => (Some(t.sink), Some(t.source)),
            None => (None, None),
        };
        let session = Arc::new(TerminalSession::new(
            key,
            target,
            Attachment::Shell(backend.clone()),
            sink.clone(),
            Some(log),
            size,
        ));

        if !self.activate(&session).await {
            session.teardown(&CloseReason::clean("closed during start")).await;
            session.set_state(SessionState::Terminated);
            return Err(ToolboxError::SessionNotFound(key.to_string()));
        }

        info!(
            session_id = %key,
            place = %session.target.place,
            place_id = session.target.place_id.as_deref().unwrap_or("-"),
            %size,
            "terminal session started"
        );

        bridge::spawn(
            self.clone(),
            session.clone(),
            backend,
            sink,
            source,
            session.output_log(),
        );
        Ok(session)
    }

    /// Open a file-transfer channel for `target`.
    pub async fn start_files(
        self: &Arc<Self>,
        key: &str,
        target: SessionTarget,
        sink: Option<Arc<dyn FrameSink>>,
    ) -> ToolboxResult<Arc<TerminalSession>> {
        self.reserve(key).await?;

        let files = match self.resolver.open_files(&target).await {
            Ok(files) => files,
            Err(e) => {
                self.release_reservation(key).await;
                warn!(session_id = %key, error = %e, "file session start failed");
                return Err(e);
            }
        };

        let session = Arc::new(TerminalSession::new(
            key,
            target,
            Attachment::Files(files),
            sink,
            None,
            WindowSize::default(),
        ));
        if !self.activate(&session).await {
            session.teardown(&CloseReason::clean("closed during start")).await;
            session.set_state(SessionState::Terminated);
            return Err(ToolboxError::SessionNotFound(key.to_string()));
        }
        info!(session_id = %key, place_id = session.target.place_id.as_deref().unwrap_or("-"), "file session started");
        Ok(session)
    }

    /// Test that `target` can be reached with its configured credentials.
    /// Nothing is registered or cached.
    pub async fn check(&self, target: &SessionTarget) -> ToolboxResult<()> {
        self.resolver.check(target).await?;
        info!(place = %target.place, place_id = ?target.place_id, "target reachable");
        Ok(())
    }

    /// The session under `key` if it is `Active`.
    pub async fn get_service(&self, key: &str) -> Option<Arc<TerminalSession>> {
        let sessions = self.sessions.read().await;
        match sessions.get(key) {
            Some(Entry::Live(session)) if session.state() == SessionState::Active => Some(session.clone()),
            _ => None,
        }
    }

    /// Change the window size of an active shell. `Ok(false)` if there is none.
    pub async fn resize(&self, key: &str, size: WindowSize) -> ToolboxResult<bool> {
        let Some(session) = self.get_service(key).await else {
            return Ok(false);
        };
        let Some(backend) = session.shell() else {
            return Ok(false);
        };
        let size = size.or(session.size());
        tokio::task::spawn_blocking(move || backend.resize(size)).await??;
        *session.size.lock().unwrap_or_else(|e| e.into_inner()) = size;
        debug!(session_id = %key, %size, "session resized");
        Ok(true)
    }

    /// Write `data` to an active shell as if typed. `Ok(false)` if there is none.
    pub async fn upload(&self, key: &str, data: Vec<u8>) -> ToolboxResult<bool> {
        let Some(session) = self.get_service(key).await else {
            return Ok(false);
        };
        let Some(backend) = session.shell() else {
            return Ok(false);
        };
        let len = data.len();
        tokio::task::spawn_blocking(move || backend.write(&data)).await??;
        debug!(session_id = %key, bytes = len, "upload written");
        Ok(true)
    }

    /// Close the session under `key`.
    ///
    /// Returns `true` for the caller that performed the teardown.
    pub async fn close(&self, key: &str) -> bool {
        self.close_with(key, CloseReason::clean("closed")).await
    }

    pub async fn close_with(&self, key: &str, reason: CloseReason) -> bool {
        let session = {
            let mut sessions = self.sessions.write().await;
            match sessions.get(key) {
                Some(Entry::Live(session)) => {
                    if !session.begin_closing() {
                        return false;
                    }
                    session.clone()
                }
                Some(Entry::Starting) => {
                    // `start` notices the missing reservation and releases its backend.
                    sessions.remove(key);
                    debug!(session_id = %key, "pending start cancelled");
                    return true;
                }
                None => return false,
            }
        };

        session.teardown(&reason).await;

        {
            let mut sessions = self.sessions.write().await;
            if matches!(sessions.get(key), Some(Entry::Live(s)) if Arc::ptr_eq(s, &session)) {
                sessions.remove(key);
            }
        }
        session.set_state(SessionState::Terminated);
        info!(session_id = %key, reason = %reason.reason, error = reason.error, "session closed");
        true
    }

    /// Close every session.
    pub async fn close_all(&self, reason: CloseReason) -> usize {
        let keys: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        let mut closed = 0;
        for key in keys {
            if self.close_with(&key, reason.clone()).await {
                closed += 1;
            }
        }
        closed
    }

    /// List all registered sessions.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().await;
        let mut infos: Vec<SessionInfo> = sessions
            .values()
            .filter_map(|entry| match entry {
                Entry::Live(session) => Some(session.info()),
                Entry::Starting => None,
            })
            .collect();
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        infos
    }

    /// Number of registered sessions, including ones still starting.
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

/// Generate a random session key (hex-encoded, 16 bytes = 32 hex chars).
pub fn new_session_key() -> String {
    use rand::Rng;
    let bytes: [u8; 16] = rand::thread_rng().gen();
    hex::encode(bytes)
}

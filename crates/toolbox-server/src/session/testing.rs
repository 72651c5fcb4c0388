//! In-process fakes for registry and bridge tests.

use super::backend::{BackendResolver, FileChannel, FileEntry, SessionTarget, TerminalBackend};
use crate::transport::{FrameSink, FrameSource, Inbound, Transport};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc as tokio_mpsc, Notify};
use toolbox_core::{ServerNotice, ToolboxError, ToolboxResult, WindowSize};

/// Poll `check` for up to two seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Shell whose output is scripted by the test.
pub struct FakeBackend {
    output_tx: Mutex<Option<mpsc::Sender<io::Result<Vec<u8>>>>>,
    output_rx: Mutex<mpsc::Receiver<io::Result<Vec<u8>>>>,
    written: Mutex<Vec<u8>>,
    sizes: Mutex<Vec<WindowSize>>,
    closes: AtomicUsize,
}

impl FakeBackend {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            output_tx: Mutex::new(Some(tx)),
            output_rx: Mutex::new(rx),
            written: Mutex::new(Vec::new()),
            sizes: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
        }
    }

    pub fn emit(&self, data: &[u8]) {
        if let Some(tx) = self.output_tx.lock().unwrap().as_ref() {
            let _ = tx.send(Ok(data.to_vec()));
        }
    }

    pub fn fail_read(&self, message: &str) {
        if let Some(tx) = self.output_tx.lock().unwrap().take() {
            let _ = tx.send(Err(io::Error::new(io::ErrorKind::ConnectionReset, message.to_string())));
        }
    }

    /// End of stream, as if the shell exited.
    pub fn finish(&self) {
        self.output_tx.lock().unwrap().take();
    }

    pub fn written(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }

    pub fn last_size(&self) -> Option<WindowSize> {
        self.sizes.lock().unwrap().last().copied()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl TerminalBackend for FakeBackend {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let rx = self.output_rx.lock().unwrap();
        match rx.recv() {
            Ok(Ok(data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(0),
        }
    }

    fn write(&self, data: &[u8]) -> io::Result<()> {
        self.written.lock().unwrap().extend_from_slice(data);
        Ok(())
    }

    fn resize(&self, size: WindowSize) -> ToolboxResult<()> {
        self.sizes.lock().unwrap().push(size);
        Ok(())
    }

    fn close(&self) -> ToolboxResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.output_tx.lock().unwrap().take();
        Ok(())
    }
}

/// File channel over an in-memory map.
#[derive(Default)]
pub struct FakeFiles {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    pub closes: AtomicUsize,
}

impl FileChannel for FakeFiles {
    fn list(&self, dir: &str) -> ToolboxResult<Vec<FileEntry>> {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        Ok(self
            .files
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(path, data)| {
                let name = path.strip_prefix(&prefix)?;
                Some(FileEntry {
                    name: name.to_string(),
                    path: path.clone(),
                    is_dir: false,
                    size: data.len() as u64,
                    modified: None,
                })
            })
            .collect())
    }

    fn put(&self, path: &str, data: &[u8]) -> ToolboxResult<()> {
        self.files.lock().unwrap().insert(path.to_string(), data.to_vec());
        Ok(())
    }

    fn get(&self, path: &str) -> ToolboxResult<Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| ToolboxError::NotFound(path.to_string()))
    }

    fn close(&self) -> ToolboxResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Resolver handing out fakes and recording them.
#[derive(Default)]
pub struct FakeResolver {
    pub opened: AtomicUsize,
    pub checked: AtomicUsize,
    backends: Mutex<Vec<Arc<FakeBackend>>>,
    files: Mutex<Vec<Arc<FakeFiles>>>,
    failure: Mutex<Option<String>>,
    gate: Mutex<Option<Arc<Notify>>>,
}

impl FakeResolver {
    pub fn backends(&self) -> Vec<Arc<FakeBackend>> {
        self.backends.lock().unwrap().clone()
    }

    pub fn files(&self) -> Vec<Arc<FakeFiles>> {
        self.files.lock().unwrap().clone()
    }

    pub fn fail_next(&self, message: &str) {
        *self.failure.lock().unwrap() = Some(message.to_string());
    }

    /// Make the next dial wait until the returned gate is notified.
    pub fn hold_dials(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    async fn dial(&self) -> ToolboxResult<()> {
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let failure = self.failure.lock().unwrap().take();
        match failure {
            Some(message) => Err(ToolboxError::Backend(message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BackendResolver for FakeResolver {
    async fn open_shell(
        &self,
        _target: &SessionTarget,
        size: WindowSize,
    ) -> ToolboxResult<Arc<dyn TerminalBackend>> {
        self.dial().await?;
        self.opened.fetch_add(1, Ordering::SeqCst);
        let backend = Arc::new(FakeBackend::new());
        backend.sizes.lock().unwrap().push(size);
        self.backends.lock().unwrap().push(backend.clone());
        Ok(backend)
    }

    async fn open_files(&self, _target: &SessionTarget) -> ToolboxResult<Arc<dyn FileChannel>> {
        self.dial().await?;
        self.opened.fetch_add(1, Ordering::SeqCst);
        let files = Arc::new(FakeFiles::default());
        self.files.lock().unwrap().push(files.clone());
        Ok(files)
    }

    async fn check(&self, _target: &SessionTarget) -> ToolboxResult<()> {
        self.dial().await?;
        self.checked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Sent {
    Output(Vec<u8>),
    Notice(ServerNotice),
}

struct FakeSink {
    sent: Arc<Mutex<Vec<Sent>>>,
    closed: Arc<AtomicBool>,
}

impl FakeSink {
    fn push(&self, item: Sent) -> ToolboxResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ToolboxError::Transport("closed".into()));
        }
        self.sent.lock().unwrap().push(item);
        Ok(())
    }
}

#[async_trait]
impl FrameSink for FakeSink {
    async fn send_output(&self, data: &[u8]) -> ToolboxResult<()> {
        self.push(Sent::Output(data.to_vec()))
    }

    async fn send_notice(&self, notice: &ServerNotice) -> ToolboxResult<()> {
        self.push(Sent::Notice(notice.clone()))
    }

    async fn close(&self) -> ToolboxResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeSource {
    rx: tokio_mpsc::UnboundedReceiver<Inbound>,
}

#[async_trait]
impl FrameSource for FakeSource {
    async fn recv(&mut self) -> ToolboxResult<Option<Inbound>> {
        Ok(self.rx.recv().await)
    }
}

/// The test's side of a fake connection.
pub struct FakeClient {
    tx: Mutex<Option<tokio_mpsc::UnboundedSender<Inbound>>>,
    sent: Arc<Mutex<Vec<Sent>>>,
    closed: Arc<AtomicBool>,
}

impl FakeClient {
    pub fn send(&self, frame: Inbound) {
        if let Some(tx) = self.tx.lock().unwrap().as_ref() {
            let _ = tx.send(frame);
        }
    }

    pub fn disconnect(&self) {
        self.tx.lock().unwrap().take();
    }

    pub fn output(&self) -> Vec<u8> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|s| match s {
                Sent::Output(data) => Some(data.as_slice()),
                Sent::Notice(_) => None,
            })
            .flatten()
            .copied()
            .collect()
    }

    pub fn closed_notices(&self) -> Vec<ServerNotice> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|s| match s {
                Sent::Notice(n @ ServerNotice::Closed { .. }) => Some(n.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn pongs(&self) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|s| matches!(s, Sent::Notice(ServerNotice::Pong)))
            .count()
    }

    pub fn sink_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct FakeTransport;

impl FakeTransport {
    pub fn pair() -> (Transport, FakeClient) {
        let (tx, rx) = tokio_mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let transport = Transport {
            sink: Arc::new(FakeSink {
                sent: sent.clone(),
                closed: closed.clone(),
            }),
            source: Box::new(FakeSource { rx }),
        };
        let client = FakeClient {
            tx: Mutex::new(Some(tx)),
            sent,
            closed,
        };
        (transport, client)
    }
}

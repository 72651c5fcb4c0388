//! Relays between a shell backend and its client transport.
//!
//! Two tasks per shell session. The output relay reads the backend on a
//! blocking worker and forwards each chunk to the client and the output log.
//! The input relay feeds client frames into the backend. Whichever side sees
//! end of stream or an error first closes the session through the registry;
//! the close raises the session's stop signal, which ends the other task.

use super::backend::TerminalBackend;
use super::output_log::OutputLog;
use super::registry::{CloseReason, SessionRegistry, TerminalSession};
use crate::transport::{FrameSink, FrameSource, Inbound};
use std::io;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use toolbox_core::ServerNotice;
use tracing::{debug, warn};

const READ_BUF: usize = 8 * 1024;
/// Chunks buffered between the blocking reader and the output relay.
const OUTPUT_QUEUE: usize = 64;

async fn stopped(stop: &mut watch::Receiver<bool>) {
    // A dropped sender means the session itself is gone.
    let _ = stop.wait_for(|stopped| *stopped).await;
}

/// Start the relays for `session`.
pub fn spawn(
    registry: Arc<SessionRegistry>,
    session: Arc<TerminalSession>,
    backend: Arc<dyn TerminalBackend>,
    sink: Option<Arc<dyn FrameSink>>,
    source: Option<Box<dyn FrameSource>>,
    log: Option<OutputLog>,
) {
    spawn_output(registry.clone(), &session, backend.clone(), sink.clone(), log);
    if let Some(source) = source {
        spawn_input(registry, &session, backend, sink, source);
    }
}

fn spawn_output(
    registry: Arc<SessionRegistry>,
    session: &TerminalSession,
    backend: Arc<dyn TerminalBackend>,
    sink: Option<Arc<dyn FrameSink>>,
    log: Option<OutputLog>,
) {
    let key = session.key().to_string();
    let mut stop = session.stop_signal();
    let (chunk_tx, mut chunk_rx) = mpsc::channel::<io::Result<Vec<u8>>>(OUTPUT_QUEUE);

    tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; READ_BUF];
        loop {
            match backend.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if chunk_tx.blocking_send(Ok(buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let _ = chunk_tx.blocking_send(Err(e));
                    break;
                }
            }
        }
    });

    tokio::spawn(async move {
        let outcome = loop {
            tokio::select! {
                _ = stopped(&mut stop) => break None,
                chunk = chunk_rx.recv() => match chunk {
                    Some(Ok(data)) => {
                        if let Some(log) = &log {
                            log.append(&data);
                        }
                        if let Some(sink) = &sink {
                            if let Err(e) = sink.send_output(&data).await {
                                break Some(CloseReason::failed(format!("transport send failed: {e}")));
                            }
                        }
                    }
                    Some(Err(e)) => break Some(CloseReason::failed(format!("backend read failed: {e}"))),
                    None => break Some(CloseReason::clean("shell exited")),
                },
            }
        };
        drop(log);
        if let Some(reason) = outcome {
            debug!(session_id = %key, reason = %reason.reason, "output relay ended");
            registry.close_with(&key, reason).await;
        }
    });
}

fn spawn_input(
    registry: Arc<SessionRegistry>,
    session: &TerminalSession,
    backend: Arc<dyn TerminalBackend>,
    sink: Option<Arc<dyn FrameSink>>,
    mut source: Box<dyn FrameSource>,
) {
    let key = session.key().to_string();
    let mut stop = session.stop_signal();

    tokio::spawn(async move {
        let outcome = loop {
            tokio::select! {
                _ = stopped(&mut stop) => break None,
                frame = source.recv() => match frame {
                    Ok(Some(Inbound::Input(data))) => {
                        let backend = backend.clone();
                        match tokio::task::spawn_blocking(move || backend.write(&data)).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => break Some(CloseReason::failed(format!("backend write failed: {e}"))),
                            Err(e) => break Some(CloseReason::failed(format!("backend write panicked: {e}"))),
                        }
                    }
                    Ok(Some(Inbound::Resize(size))) => {
                        if let Err(e) = registry.resize(&key, size).await {
                            warn!(session_id = %key, error = %e, "resize failed");
                        }
                    }
                    Ok(Some(Inbound::Ping)) => {
                        if let Some(sink) = &sink {
                            let _ = sink.send_notice(&ServerNotice::Pong).await;
                        }
                    }
                    Ok(None) => break Some(CloseReason::clean("client disconnected")),
                    Err(e) => break Some(CloseReason::failed(format!("transport receive failed: {e}"))),
                },
            }
        };
        if let Some(reason) = outcome {
            debug!(session_id = %key, reason = %reason.reason, "input relay ended");
            registry.close_with(&key, reason).await;
        }
    });
}

#[cfg(test)]
mod tests {
    use crate::session::backend::SessionTarget;
    use crate::session::output_log::LogStore;
    use crate::session::registry::SessionRegistry;
    use crate::session::testing::{eventually, FakeResolver, FakeTransport};
    use crate::transport::Inbound;
    use std::sync::Arc;
    use toolbox_core::{ServerNotice, WindowSize};

    fn registry(dir: &std::path::Path) -> (Arc<SessionRegistry>, Arc<FakeResolver>) {
        let resolver = Arc::new(FakeResolver::default());
        let registry = Arc::new(SessionRegistry::new(resolver.clone(), LogStore::new(dir)));
        (registry, resolver)
    }

    #[tokio::test]
    async fn output_reaches_client_and_log() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, resolver) = registry(dir.path());
        let (transport, client) = FakeTransport::pair();
        let session = registry
            .start("s1", SessionTarget::local("w1"), WindowSize::default(), Some(transport))
            .await
            .unwrap();

        let backend = resolver.backends()[0].clone();
        backend.emit(b"$ ");
        backend.emit(b"hello\r\n");
        assert!(eventually(|| client.output() == b"$ hello\r\n").await);

        let log_path = session.log_path().unwrap().clone();
        assert!(eventually(|| std::fs::read(&log_path).map(|d| d == b"$ hello\r\n").unwrap_or(false)).await);
        registry.close("s1").await;
    }

    #[tokio::test]
    async fn shell_exit_closes_session_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, resolver) = registry(dir.path());
        let (transport, client) = FakeTransport::pair();
        registry
            .start("s1", SessionTarget::local("w"), WindowSize::default(), Some(transport))
            .await
            .unwrap();

        resolver.backends()[0].finish();
        assert!(eventually(|| client.sink_closed()).await);
        assert!(registry.get_service("s1").await.is_none());
        assert_eq!(
            client.closed_notices(),
            vec![ServerNotice::closed("shell exited", false)]
        );
        let backend = resolver.backends()[0].clone();
        assert!(eventually(|| backend.closes() == 1).await);
    }

    #[tokio::test]
    async fn backend_failure_is_reported_as_error() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, resolver) = registry(dir.path());
        let (transport, client) = FakeTransport::pair();
        registry
            .start("s1", SessionTarget::local("w"), WindowSize::default(), Some(transport))
            .await
            .unwrap();

        resolver.backends()[0].fail_read("connection reset");
        assert!(eventually(|| client.sink_closed()).await);
        let notices = client.closed_notices();
        assert_eq!(notices.len(), 1);
        assert!(matches!(&notices[0], ServerNotice::Closed { error: true, reason } if reason.contains("connection reset")));
    }

    #[tokio::test]
    async fn client_frames_drive_backend() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, resolver) = registry(dir.path());
        let (transport, client) = FakeTransport::pair();
        registry
            .start("s1", SessionTarget::local("w"), WindowSize::default(), Some(transport))
            .await
            .unwrap();
        let backend = resolver.backends()[0].clone();

        client.send(Inbound::Input(b"echo hi\n".to_vec()));
        client.send(Inbound::Resize(WindowSize::new(132, 43)));
        client.send(Inbound::Ping);

        assert!(eventually(|| client.pongs() == 1).await);
        // Frames are handled in order, so the pong implies the rest landed.
        assert_eq!(backend.written(), b"echo hi\n");
        assert_eq!(backend.last_size(), Some(WindowSize::new(132, 43)));
        assert_eq!(registry.get_service("s1").await.unwrap().size(), WindowSize::new(132, 43));
        registry.close("s1").await;
    }

    #[tokio::test]
    async fn client_disconnect_releases_backend() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, resolver) = registry(dir.path());
        let (transport, client) = FakeTransport::pair();
        registry
            .start("s1", SessionTarget::local("w"), WindowSize::default(), Some(transport))
            .await
            .unwrap();

        client.disconnect();
        let backend = resolver.backends()[0].clone();
        assert!(eventually(|| backend.closes() == 1).await);
        assert!(eventually(|| client.sink_closed()).await);
        for _ in 0..100 {
            if registry.count().await == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(registry.count().await, 0);
    }
}

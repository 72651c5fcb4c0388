//! WebSocket listener using tokio-tungstenite.
//!
//! Each accepted connection carries the request path and query string so the
//! server can route it. A connection becomes a session [`Transport`] by
//! splitting it: binary frames are raw terminal bytes, text frames are JSON
//! control messages.

use super::{FrameSink, FrameSource, Inbound, Transport};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use toolbox_core::{ControlMessage, ServerNotice, ToolboxError, ToolboxResult, WindowSize};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<TcpStream>;

/// Maximum frame size for WebSocket messages (1 MiB).
const MAX_WS_FRAME_SIZE: usize = 1_048_576;

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WsStream,
    pub remote_addr: SocketAddr,
    /// Request path without the query string.
    pub path: String,
    /// Decoded query parameters.
    pub query: HashMap<String, String>,
}

/// Start the WebSocket listener.
///
/// Returns a receiver that yields accepted connections.
pub async fn start_listener(bind_addr: SocketAddr) -> ToolboxResult<mpsc::Receiver<WebSocketConnection>> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| ToolboxError::Transport(format!("WS bind failed: {e}")))?;

    info!(addr = %bind_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let mut uri = String::new();
                        let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                            uri = req.uri().to_string();
                            Ok(resp)
                        };
                        let accepted = tokio_tungstenite::accept_hdr_async(stream, callback).await;
                        match accepted {
                            Ok(ws_stream) => {
                                let (path, query) = split_uri(&uri);
                                debug!(remote = %addr, path = %path, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                    path,
                                    query,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    Ok(rx)
}

impl WebSocketConnection {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str).filter(|v| !v.is_empty())
    }

    /// Split into the halves a terminal session uses.
    pub fn into_transport(self) -> Transport {
        let (sink, stream) = self.ws_stream.split();
        Transport {
            sink: Arc::new(WsSink {
                inner: Mutex::new(Some(sink)),
            }),
            source: Box::new(WsSource { stream }),
        }
    }
}

/// Send one text frame and close. Used to report a failure before any
/// session exists.
pub async fn reject(mut ws: WsStream, text: String) {
    let _ = ws.send(Message::Text(text.into())).await;
    let _ = ws.close(None).await;
}

/// Helper: send a text message over a WebSocket.
pub async fn ws_send_text(ws: &mut WsStream, text: String) -> ToolboxResult<()> {
    ws.send(Message::Text(text.into()))
        .await
        .map_err(|e| ToolboxError::Transport(format!("WS send failed: {e}")))
}

/// Helper: receive the next text message from a WebSocket.
///
/// Returns `None` if the connection is closed. Binary frames are ignored.
pub async fn ws_recv_text(ws: &mut WsStream) -> ToolboxResult<Option<String>> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                if text.len() > MAX_WS_FRAME_SIZE {
                    return Err(ToolboxError::InvalidMessage(format!(
                        "WS frame too large: {} bytes (max {})",
                        text.len(),
                        MAX_WS_FRAME_SIZE
                    )));
                }
                return Ok(Some(text.to_string()));
            }
            Some(Ok(Message::Close(_))) => return Ok(None),
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(ToolboxError::Transport(format!("WS recv failed: {e}")));
            }
            None => return Ok(None),
        }
    }
}

struct WsSink {
    inner: Mutex<Option<SplitSink<WsStream, Message>>>,
}

impl WsSink {
    async fn send(&self, message: Message) -> ToolboxResult<()> {
        let mut guard = self.inner.lock().await;
        let sink = guard
            .as_mut()
            .ok_or_else(|| ToolboxError::Transport("WS already closed".into()))?;
        sink.send(message)
            .await
            .map_err(|e| ToolboxError::Transport(format!("WS send failed: {e}")))
    }
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_output(&self, data: &[u8]) -> ToolboxResult<()> {
        self.send(Message::Binary(data.to_vec().into())).await
    }

    async fn send_notice(&self, notice: &ServerNotice) -> ToolboxResult<()> {
        self.send(Message::Text(notice.encode().into())).await
    }

    async fn close(&self) -> ToolboxResult<()> {
        let Some(mut sink) = self.inner.lock().await.take() else {
            return Ok(());
        };
        sink.close()
            .await
            .map_err(|e| ToolboxError::Transport(format!("WS close failed: {e}")))
    }
}

struct WsSource {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl FrameSource for WsSource {
    async fn recv(&mut self) -> ToolboxResult<Option<Inbound>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => {
                    if data.len() > MAX_WS_FRAME_SIZE {
                        return Err(ToolboxError::InvalidMessage(format!(
                            "WS frame too large: {} bytes (max {})",
                            data.len(),
                            MAX_WS_FRAME_SIZE
                        )));
                    }
                    return Ok(Some(Inbound::Input(data.to_vec())));
                }
                Some(Ok(Message::Text(text))) => match decode_control(&text) {
                    Ok(frame) => return Ok(Some(frame)),
                    Err(e) => {
                        warn!(error = %e, "ignoring malformed control message");
                        continue;
                    }
                },
                Some(Ok(Message::Close(_))) => return Ok(None),
                // Pings are answered by tungstenite on the next write.
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Err(ToolboxError::Transport(format!("WS recv failed: {e}")));
                }
                None => return Ok(None),
            }
        }
    }
}

fn decode_control(text: &str) -> ToolboxResult<Inbound> {
    Ok(match ControlMessage::decode(text)? {
        ControlMessage::Resize { cols, rows } => Inbound::Resize(WindowSize::new(cols, rows)),
        ControlMessage::Ping => Inbound::Ping,
    })
}

/// Split a request URI into its path and decoded query parameters.
fn split_uri(uri: &str) -> (String, HashMap<String, String>) {
    let (path, query) = uri.split_once('?').unwrap_or((uri, ""));
    let params = url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();
    (path.to_string(), params)
}

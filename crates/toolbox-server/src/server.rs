//! Core server: accepts WebSocket connections and routes them.
//!
//! Owns the resource cache, the session registry and the command history
//! service. `/terminal` connections become shell sessions bridged to the
//! connection; `/api` connections exchange JSON requests and replies.

use crate::api::Api;
use crate::config::ServerConfig;
use crate::session::{
    new_session_key, CloseReason, DefaultResolver, LogStore, Place, SessionRegistry, SessionTarget,
};
use crate::store::SqliteCommandStore;
use crate::transport::websocket::{self, WebSocketConnection};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use toolbox_core::{CommandLogService, ResourceCache, ServerNotice, ToolboxError, ToolboxResult, WindowSize};
use tracing::{debug, info, warn};

/// Worker id used when a terminal client does not name one.
const DEFAULT_WORKER: &str = "default";

/// The toolbox server instance.
pub struct ToolboxServer {
    config: ServerConfig,
    cache: Arc<ResourceCache>,
    registry: Arc<SessionRegistry>,
    api: Api,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl ToolboxServer {
    pub fn new(config: ServerConfig) -> ToolboxResult<Self> {
        let cache = Arc::new(ResourceCache::new());
        let resolver = Arc::new(DefaultResolver::new(
            cache.clone(),
            config.hosts.clone(),
            config.shell.clone(),
            config.ssh_idle_timeout,
        ));
        let registry = Arc::new(SessionRegistry::new(resolver, LogStore::new(&config.log_dir)));

        let commands = match &config.database {
            Some(path) => {
                info!(path = %path.display(), "command history stored in sqlite");
                CommandLogService::new(Arc::new(SqliteCommandStore::open(path)?))
            }
            None => CommandLogService::in_memory(),
        };
        let api = Api::new(
            registry.clone(),
            cache.clone(),
            commands,
            config.elasticsearch_idle_timeout,
        );

        info!(
            log_dir = %registry.logs().root().display(),
            hosts = config.hosts.len(),
            "server initialized"
        );

        Ok(Self {
            config,
            cache,
            registry,
            api,
            reaper: Mutex::new(None),
        })
    }

    /// Accept connections until the listener stops.
    pub async fn run(&self) -> ToolboxResult<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.bind, self.config.port)
            .parse()
            .map_err(|e| ToolboxError::Config(format!("invalid bind address: {e}")))?;
        let mut connections = websocket::start_listener(addr).await?;

        let reaper = self.cache.spawn_reaper(self.config.reap_interval);
        if let Ok(mut slot) = self.reaper.lock() {
            if let Some(old) = slot.replace(reaper) {
                old.abort();
            }
        }

        info!(addr = %addr, "server listening");

        while let Some(conn) = connections.recv().await {
            match route(&conn.path) {
                Route::Terminal => {
                    let registry = self.registry.clone();
                    let default_size = self.config.default_size;
                    tokio::spawn(handle_terminal(registry, conn, default_size));
                }
                Route::Api => {
                    let api = self.api.clone();
                    tokio::spawn(handle_api(api, conn));
                }
                Route::Unknown => {
                    debug!(remote = %conn.remote_addr, path = %conn.path, "unknown path");
                    let notice = ServerNotice::closed(format!("unknown path: {}", conn.path), true);
                    tokio::spawn(websocket::reject(conn.ws_stream, notice.encode()));
                }
            }
        }

        Ok(())
    }

    /// Close every session, then drop every cached backend connection.
    pub async fn shutdown(&self) {
        if let Ok(mut slot) = self.reaper.lock() {
            if let Some(reaper) = slot.take() {
                reaper.abort();
            }
        }
        let closed = self
            .registry
            .close_all(CloseReason::clean("server shutting down"))
            .await;
        self.cache.shutdown().await;
        info!(sessions = closed, "server shut down");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Terminal,
    Api,
    Unknown,
}

fn route(path: &str) -> Route {
    match path.trim_end_matches('/') {
        "/terminal" => Route::Terminal,
        "/api" => Route::Api,
        _ => Route::Unknown,
    }
}

/// Session target and initial size from `/terminal` query parameters.
fn terminal_request(
    query: &HashMap<String, String>,
    default_size: WindowSize,
) -> ToolboxResult<(SessionTarget, WindowSize)> {
    let param = |name: &str| query.get(name).map(String::as_str).filter(|v| !v.is_empty());
    let dimension = |name: &str| -> ToolboxResult<u16> {
        match param(name) {
            Some(v) => v
                .parse()
                .map_err(|_| ToolboxError::InvalidMessage(format!("invalid {name}: {v}"))),
            None => Ok(0),
        }
    };

    let place: Place = param("place").unwrap_or("local").parse()?;
    let target = SessionTarget {
        place,
        place_id: param("placeId").map(str::to_string),
        worker_id: param("workerId").unwrap_or(DEFAULT_WORKER).to_string(),
    };
    if place != Place::Local {
        target.require_place_id()?;
    }
    let size = WindowSize::new(dimension("cols")?, dimension("rows")?).or(default_size);
    Ok((target, size))
}

async fn handle_terminal(registry: Arc<SessionRegistry>, conn: WebSocketConnection, default_size: WindowSize) {
    let key = conn
        .param("key")
        .map(str::to_string)
        .unwrap_or_else(new_session_key);
    let remote = conn.remote_addr;

    let (target, size) = match terminal_request(&conn.query, default_size) {
        Ok(request) => request,
        Err(e) => {
            warn!(session_id = %key, remote = %remote, error = %e, "rejected terminal request");
            let notice = ServerNotice::closed(format!("start error: {e}"), true);
            websocket::reject(conn.ws_stream, notice.encode()).await;
            return;
        }
    };

    let transport = conn.into_transport();
    let sink = transport.sink.clone();
    match registry.start(&key, target, size, Some(transport)).await {
        Ok(session) => {
            let sessions = registry.count().await;
            debug!(
                session_id = %key,
                remote = %remote,
                place = %session.target().place,
                log = ?session.log_path(),
                sessions,
                "terminal attached"
            );
        }
        Err(e) => {
            warn!(session_id = %key, remote = %remote, error = %e, "terminal start failed");
            let notice = ServerNotice::closed(format!("start error: {e}"), true);
            let _ = sink.send_notice(&notice).await;
            let _ = sink.close().await;
        }
    }
}

async fn handle_api(api: Api, mut conn: WebSocketConnection) {
    let remote = conn.remote_addr;
    debug!(remote = %remote, "api connection opened");
    loop {
        match websocket::ws_recv_text(&mut conn.ws_stream).await {
            Ok(Some(text)) => {
                let reply = api.handle_text(&text).await;
                if let Err(e) = websocket::ws_send_text(&mut conn.ws_stream, reply).await {
                    debug!(remote = %remote, error = %e, "api reply failed");
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(remote = %remote, error = %e, "api connection error");
                break;
            }
        }
    }
    debug!(remote = %remote, "api connection closed");
}

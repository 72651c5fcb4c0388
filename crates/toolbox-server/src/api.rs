//! JSON request/response surface served on `/api`.
//!
//! Each text frame carries one request `{"id": .., "op": "..", ...}` and gets
//! exactly one reply `{"id": .., "ok": true, "data": ..}` or
//! `{"id": .., "ok": false, "error": "..", "notFound": bool}`.
//!
//! Raw bytes (shell uploads, file contents) travel as standard base64.

use crate::adapters::ElasticsearchService;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use crate::session::{new_session_key, FileChannel, Place, SessionRegistry, SessionTarget};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use toolbox_core::{
    CommandFilter, CommandLogRecord, CommandLogService, ResourceCache, ToolboxError, ToolboxResult,
    WindowSize,
};
use tracing::debug;

#[derive(Debug, Deserialize)]
pub struct ApiEnvelope {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(flatten)]
    pub request: ApiRequest,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all_fields = "camelCase")]
pub enum ApiRequest {
    #[serde(rename = "command.save")]
    CommandSave { record: CommandLogRecord },
    #[serde(rename = "command.query")]
    CommandQuery { filter: CommandFilter },
    #[serde(rename = "command.count")]
    CommandCount { filter: CommandFilter },
    #[serde(rename = "command.delete")]
    CommandDelete { user_id: i64, command_id: i64 },
    #[serde(rename = "command.clean")]
    CommandClean { filter: CommandFilter },

    #[serde(rename = "sessions.list")]
    SessionsList,
    #[serde(rename = "sessions.close")]
    SessionsClose { key: String },
    #[serde(rename = "sessions.resize")]
    SessionsResize { key: String, cols: u16, rows: u16 },
    #[serde(rename = "sessions.upload")]
    SessionsUpload {
        key: String,
        #[serde(deserialize_with = "base64_bytes")]
        data: Vec<u8>,
    },

    #[serde(rename = "files.open")]
    FilesOpen {
        #[serde(default)]
        key: Option<String>,
        #[serde(default = "default_files_place")]
        place: Place,
        place_id: String,
        #[serde(default)]
        worker_id: String,
    },
    #[serde(rename = "files.list")]
    FilesList { key: String, dir: String },
    #[serde(rename = "files.put")]
    FilesPut {
        key: String,
        path: String,
        #[serde(deserialize_with = "base64_bytes")]
        data: Vec<u8>,
    },
    #[serde(rename = "files.get")]
    FilesGet { key: String, path: String },

    #[serde(rename = "logs.list")]
    LogsList {
        place: Place,
        #[serde(default)]
        place_id: Option<String>,
    },
    #[serde(rename = "logs.read")]
    LogsRead {
        place: Place,
        #[serde(default)]
        place_id: Option<String>,
        worker_id: String,
    },
    #[serde(rename = "logs.delete")]
    LogsDelete {
        place: Place,
        #[serde(default)]
        place_id: Option<String>,
        worker_id: String,
    },
    #[serde(rename = "logs.clean")]
    LogsClean {
        place: Place,
        #[serde(default)]
        place_id: Option<String>,
        worker_id: String,
    },

    #[serde(rename = "es.indices")]
    EsIndices { url: String },
    #[serde(rename = "es.create")]
    EsCreate {
        url: String,
        name: String,
        #[serde(default)]
        body: Option<Value>,
    },
    #[serde(rename = "es.delete")]
    EsDelete { url: String, name: String },
    #[serde(rename = "es.search")]
    EsSearch {
        url: String,
        index: String,
        #[serde(default = "default_page")]
        page: u32,
        #[serde(default = "default_page_size")]
        size: u32,
    },

    #[serde(rename = "es.mapping")]
    EsMapping { url: String, index: String },
    #[serde(rename = "es.putMapping")]
    EsPutMapping { url: String, index: String, body: Value },
    #[serde(rename = "es.setFieldType")]
    EsSetFieldType {
        url: String,
        index: String,
        field: String,
        field_type: String,
    },
    #[serde(rename = "es.insert")]
    EsInsert {
        url: String,
        index: String,
        doc_id: String,
        doc: Value,
    },
    #[serde(rename = "es.update")]
    EsUpdate {
        url: String,
        index: String,
        doc_id: String,
        doc: Value,
    },
    #[serde(rename = "es.deleteDoc")]
    EsDeleteDoc {
        url: String,
        index: String,
        doc_id: String,
    },
    #[serde(rename = "es.reindex")]
    EsReindex { url: String, source: String, dest: String },
    #[serde(rename = "es.scroll")]
    EsScroll {
        url: String,
        index: String,
        #[serde(default)]
        scroll_id: Option<String>,
        #[serde(default = "default_page_size")]
        size: u32,
    },

    #[serde(rename = "hosts.check")]
    HostsCheck {
        #[serde(default = "default_check_place")]
        place: Place,
        place_id: String,
    },

    #[serde(rename = "cache.snapshot")]
    CacheSnapshot,
    #[serde(rename = "cache.invalidate")]
    CacheInvalidate { key: String },
}

fn default_files_place() -> Place {
    Place::Sftp
}

fn default_check_place() -> Place {
    Place::Ssh
}

fn base64_bytes<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    BASE64.decode(text.as_bytes()).map_err(serde::de::Error::custom)
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    20
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiReply {
    pub id: Option<u64>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub not_found: bool,
}

impl ApiReply {
    fn from_result(id: Option<u64>, result: ToolboxResult<Value>) -> Self {
        match result {
            Ok(data) => Self {
                id,
                ok: true,
                data: Some(data),
                error: None,
                not_found: false,
            },
            Err(e) => Self {
                id,
                ok: false,
                data: None,
                error: Some(e.to_string()),
                not_found: e.is_not_found(),
            },
        }
    }
}

/// Handles `/api` requests against the shared server state.
#[derive(Clone)]
pub struct Api {
    registry: Arc<SessionRegistry>,
    cache: Arc<ResourceCache>,
    commands: CommandLogService,
    es_idle_timeout: Duration,
}

impl Api {
    pub fn new(
        registry: Arc<SessionRegistry>,
        cache: Arc<ResourceCache>,
        commands: CommandLogService,
        es_idle_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            cache,
            commands,
            es_idle_timeout,
        }
    }

    /// Decode one text frame, run it, and encode the reply.
    pub async fn handle_text(&self, text: &str) -> String {
        let reply = match serde_json::from_str::<ApiEnvelope>(text) {
            Ok(envelope) => {
                debug!(id = ?envelope.id, "api request");
                let result = self.handle(envelope.request).await;
                ApiReply::from_result(envelope.id, result)
            }
            Err(e) => ApiReply::from_result(
                None,
                Err(ToolboxError::InvalidMessage(format!("bad request: {e}"))),
            ),
        };
        serde_json::to_string(&reply).unwrap_or_else(|e| {
            format!(r#"{{"ok":false,"error":"reply encoding failed: {e}"}}"#)
        })
    }

    pub async fn handle(&self, request: ApiRequest) -> ToolboxResult<Value> {
        match request {
            ApiRequest::CommandSave { record } => to_value(self.commands.save(record).await?),
            ApiRequest::CommandQuery { filter } => to_value(self.commands.query(&filter).await?),
            ApiRequest::CommandCount { filter } => {
                Ok(json!({ "count": self.commands.count(&filter).await? }))
            }
            ApiRequest::CommandDelete { user_id, command_id } => {
                self.commands.delete(user_id, command_id).await?;
                Ok(json!({ "deleted": true }))
            }
            ApiRequest::CommandClean { filter } => {
                Ok(json!({ "removed": self.commands.clean(&filter).await? }))
            }

            ApiRequest::SessionsList => to_value(self.registry.list().await),
            ApiRequest::SessionsClose { key } => {
                Ok(json!({ "closed": self.registry.close(&key).await }))
            }
            ApiRequest::SessionsResize { key, cols, rows } => {
                let resized = self.registry.resize(&key, WindowSize::new(cols, rows)).await?;
                Ok(json!({ "resized": resized }))
            }
            ApiRequest::SessionsUpload { key, data } => {
                let written = self.registry.upload(&key, data).await?;
                Ok(json!({ "written": written }))
            }

            ApiRequest::FilesOpen {
                key,
                place,
                place_id,
                worker_id,
            } => {
                let key = key.filter(|k| !k.is_empty()).unwrap_or_else(new_session_key);
                let target = SessionTarget::remote(place, &place_id, &worker_id);
                self.registry.start_files(&key, target, None).await?;
                Ok(json!({ "key": key }))
            }
            ApiRequest::FilesList { key, dir } => {
                let files = self.files(&key).await?;
                to_value(blocking(move || files.list(&dir)).await?)
            }
            ApiRequest::FilesPut { key, path, data } => {
                let files = self.files(&key).await?;
                let len = data.len();
                blocking(move || files.put(&path, &data)).await?;
                Ok(json!({ "written": len }))
            }
            ApiRequest::FilesGet { key, path } => {
                let files = self.files(&key).await?;
                let data = blocking(move || files.get(&path)).await?;
                Ok(json!({ "data": BASE64.encode(&data), "size": data.len() }))
            }

            ApiRequest::LogsList { place, place_id } => {
                to_value(self.registry.logs().list(place, place_id.as_deref()).await?)
            }
            ApiRequest::LogsRead {
                place,
                place_id,
                worker_id,
            } => {
                let data = self
                    .registry
                    .logs()
                    .read(place, place_id.as_deref(), &worker_id)
                    .await?;
                Ok(json!({ "text": String::from_utf8_lossy(&data) }))
            }
            ApiRequest::LogsDelete {
                place,
                place_id,
                worker_id,
            } => {
                self.registry
                    .logs()
                    .delete(place, place_id.as_deref(), &worker_id)
                    .await?;
                Ok(json!({ "deleted": true }))
            }
            ApiRequest::LogsClean {
                place,
                place_id,
                worker_id,
            } => {
                self.registry
                    .logs()
                    .clean(place, place_id.as_deref(), &worker_id)
                    .await?;
                Ok(json!({ "cleaned": true }))
            }

            ApiRequest::EsIndices { url } => to_value(self.elasticsearch(&url).await?.index_names().await?),
            ApiRequest::EsCreate { url, name, body } => {
                self.elasticsearch(&url).await?.create_index(&name, body).await?;
                Ok(json!({ "created": name }))
            }
            ApiRequest::EsDelete { url, name } => {
                self.elasticsearch(&url).await?.delete_index(&name).await?;
                Ok(json!({ "deleted": name }))
            }
            ApiRequest::EsSearch {
                url,
                index,
                page,
                size,
            } => to_value(self.elasticsearch(&url).await?.search(&index, page, size).await?),
            ApiRequest::EsMapping { url, index } => self.elasticsearch(&url).await?.mapping(&index).await,
            ApiRequest::EsPutMapping { url, index, body } => {
                self.elasticsearch(&url).await?.put_mapping(&index, body).await?;
                Ok(json!({ "updated": index }))
            }
            ApiRequest::EsSetFieldType {
                url,
                index,
                field,
                field_type,
            } => {
                self.elasticsearch(&url)
                    .await?
                    .set_field_type(&index, &field, &field_type)
                    .await?;
                Ok(json!({ "updated": index, "field": field }))
            }
            ApiRequest::EsInsert {
                url,
                index,
                doc_id,
                doc,
            } => self.elasticsearch(&url).await?.insert(&index, &doc_id, doc).await,
            ApiRequest::EsUpdate {
                url,
                index,
                doc_id,
                doc,
            } => self.elasticsearch(&url).await?.update(&index, &doc_id, doc).await,
            ApiRequest::EsDeleteDoc { url, index, doc_id } => {
                self.elasticsearch(&url).await?.delete_document(&index, &doc_id).await
            }
            ApiRequest::EsReindex { url, source, dest } => {
                self.elasticsearch(&url).await?.reindex(&source, &dest).await
            }
            ApiRequest::EsScroll {
                url,
                index,
                scroll_id,
                size,
            } => to_value(
                self.elasticsearch(&url)
                    .await?
                    .scroll(&index, scroll_id.as_deref(), size)
                    .await?,
            ),

            ApiRequest::HostsCheck { place, place_id } => {
                let target = SessionTarget::remote(place, &place_id, "");
                target.require_place_id()?;
                self.registry.check(&target).await?;
                Ok(json!({ "reachable": true }))
            }

            ApiRequest::CacheSnapshot => to_value(self.cache.snapshot().await),
            ApiRequest::CacheInvalidate { key } => {
                Ok(json!({ "invalidated": self.cache.invalidate(&key).await? }))
            }
        }
    }

    async fn files(&self, key: &str) -> ToolboxResult<Arc<dyn FileChannel>> {
        self.registry
            .get_service(key)
            .await
            .and_then(|session| session.files())
            .ok_or_else(|| ToolboxError::SessionNotFound(key.to_string()))
    }

    async fn elasticsearch(&self, url: &str) -> ToolboxResult<Arc<ElasticsearchService>> {
        if url.trim().is_empty() {
            return Err(ToolboxError::InvalidMessage("elasticsearch url is empty".into()));
        }
        ElasticsearchService::cached(&self.cache, url, self.es_idle_timeout).await
    }
}

fn to_value<T: Serialize>(value: T) -> ToolboxResult<Value> {
    Ok(serde_json::to_value(value)?)
}

async fn blocking<T, F>(f: F) -> ToolboxResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> ToolboxResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

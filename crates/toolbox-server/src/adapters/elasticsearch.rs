//! Elasticsearch adapter over the REST API.
//!
//! Index administration (create, delete, mappings), single-document writes
//! and two read modes: `from`/`size` pages and scroll cursors. Writes wait
//! for a refresh so the next read sees them.

use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use toolbox_core::{service_key, BackendKind, ResourceCache, Service, ToolboxError, ToolboxResult};
use tracing::{debug, info};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// How long a scroll cursor stays open between pages.
const SCROLL_KEEP_ALIVE: &str = "1m";

/// One page of hits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchPage {
    pub total: u64,
    pub hits: Vec<Value>,
}

/// One batch from a scroll cursor. Pass `scroll_id` back for the next batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrollPage {
    pub scroll_id: Option<String>,
    pub total: u64,
    pub hits: Vec<Value>,
}

/// HTTP client bound to one cluster URL.
pub struct ElasticsearchService {
    url: Url,
    client: reqwest::Client,
    idle_timeout: Duration,
    last_used: Mutex<Instant>,
}

fn es_err(context: &str, e: reqwest::Error) -> ToolboxError {
    ToolboxError::Backend(format!("elasticsearch {context}: {e}"))
}

impl ElasticsearchService {
    /// Build a client and check that the cluster answers.
    pub async fn connect(url: &str, idle_timeout: Duration) -> ToolboxResult<Self> {
        let url = Url::parse(url.trim())
            .map_err(|e| ToolboxError::InvalidMessage(format!("invalid elasticsearch url {url}: {e}")))?;
        if url.cannot_be_a_base() {
            return Err(ToolboxError::InvalidMessage(format!("invalid elasticsearch url {url}")));
        }
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| es_err("client", e))?;
        let service = Self {
            url,
            client,
            idle_timeout,
            last_used: Mutex::new(Instant::now()),
        };
        service
            .client
            .get(service.url.clone())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| es_err("ping", e))?;
        info!(url = %service.url, "elasticsearch client ready");
        Ok(service)
    }

    /// The cached client for `url`.
    pub async fn cached(
        cache: &ResourceCache,
        url: &str,
        idle_timeout: Duration,
    ) -> ToolboxResult<std::sync::Arc<Self>> {
        let key = service_key(BackendKind::Elasticsearch, &[url]);
        let url = url.to_string();
        cache
            .get_or_create(&key, move || async move {
                ElasticsearchService::connect(&url, idle_timeout).await
            })
            .await
    }

    fn endpoint(&self, segments: &[&str], query: &[(&str, &str)]) -> ToolboxResult<Url> {
        endpoint(&self.url, segments, query)
    }

    fn touch(&self) {
        if let Ok(mut last) = self.last_used.lock() {
            *last = Instant::now();
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder, context: &str) -> ToolboxResult<Value> {
        self.touch();
        let response = request.send().await.map_err(|e| es_err(context, e))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ToolboxError::NotFound(context.to_string()));
        }
        let response = response.error_for_status().map_err(|e| es_err(context, e))?;
        response.json::<Value>().await.map_err(|e| es_err(context, e))
    }

    /// Index names, sorted.
    pub async fn index_names(&self) -> ToolboxResult<Vec<String>> {
        let url = self.endpoint(&["_cat", "indices"], &[("format", "json"), ("h", "index")])?;
        let body = self.send(self.client.get(url), "list indices").await?;
        Ok(parse_index_names(&body))
    }

    pub async fn create_index(&self, name: &str, body: Option<Value>) -> ToolboxResult<()> {
        let mut request = self.client.put(self.endpoint(&[name], &[])?);
        if let Some(body) = body {
            request = request.json(&body);
        }
        self.send(request, &format!("create index {name}")).await?;
        debug!(index = name, "index created");
        Ok(())
    }

    pub async fn delete_index(&self, name: &str) -> ToolboxResult<()> {
        self.send(self.client.delete(self.endpoint(&[name], &[])?), &format!("index {name}"))
            .await?;
        debug!(index = name, "index deleted");
        Ok(())
    }

    /// The mapping of `index` alone, without the index-name wrapper.
    pub async fn mapping(&self, index: &str) -> ToolboxResult<Value> {
        let context = format!("index {index}");
        let body = self
            .send(self.client.get(self.endpoint(&[index, "_mapping"], &[])?), &context)
            .await?;
        mapping_of(body, index).ok_or(ToolboxError::NotFound(context))
    }

    pub async fn put_mapping(&self, index: &str, body: Value) -> ToolboxResult<()> {
        self.send(
            self.client.put(self.endpoint(&[index, "_mapping"], &[])?).json(&body),
            &format!("index {index}"),
        )
        .await?;
        debug!(index, "mapping updated");
        Ok(())
    }

    /// Add `field` to the mapping with type `field_type`.
    pub async fn set_field_type(&self, index: &str, field: &str, field_type: &str) -> ToolboxResult<()> {
        self.put_mapping(index, field_type_mapping(field, field_type)).await
    }

    /// One page of documents from `index`; `page` is 1-based.
    pub async fn search(&self, index: &str, page: u32, size: u32) -> ToolboxResult<SearchPage> {
        let query = json!({
            "from": page_offset(page, size)?,
            "size": size,
            "query": { "match_all": {} },
        });
        let body = self
            .send(
                self.client.post(self.endpoint(&[index, "_search"], &[])?).json(&query),
                &format!("index {index}"),
            )
            .await?;
        Ok(parse_search_page(&body))
    }

    /// Index `doc` under `id`, replacing any existing document.
    pub async fn insert(&self, index: &str, id: &str, doc: Value) -> ToolboxResult<Value> {
        let url = self.endpoint(&[index, "_doc", id], &[("refresh", "wait_for")])?;
        self.send(self.client.put(url).json(&doc), &format!("index {index}"))
            .await
    }

    /// Merge `doc` into the existing document `id`.
    pub async fn update(&self, index: &str, id: &str, doc: Value) -> ToolboxResult<Value> {
        let url = self.endpoint(&[index, "_update", id], &[("refresh", "wait_for")])?;
        self.send(
            self.client.post(url).json(&json!({ "doc": doc })),
            &format!("document {index}/{id}"),
        )
        .await
    }

    pub async fn delete_document(&self, index: &str, id: &str) -> ToolboxResult<Value> {
        let url = self.endpoint(&[index, "_doc", id], &[("refresh", "wait_for")])?;
        self.send(self.client.delete(url), &format!("document {index}/{id}"))
            .await
    }

    /// Copy every document of `source` into `dest`.
    pub async fn reindex(&self, source: &str, dest: &str) -> ToolboxResult<Value> {
        let url = self.endpoint(&["_reindex"], &[("refresh", "true")])?;
        let body = json!({
            "source": { "index": source },
            "dest": { "index": dest },
        });
        let result = self
            .send(self.client.post(url).json(&body), &format!("index {source}"))
            .await?;
        info!(source, dest, created = ?result.get("created"), "reindex finished");
        Ok(result)
    }

    /// Open a scroll over `index` when `scroll_id` is empty, otherwise fetch
    /// the next batch of that cursor.
    pub async fn scroll(&self, index: &str, scroll_id: Option<&str>, size: u32) -> ToolboxResult<ScrollPage> {
        let request = match scroll_id.filter(|id| !id.is_empty()) {
            None => {
                let url = self.endpoint(&[index, "_search"], &[("scroll", SCROLL_KEEP_ALIVE)])?;
                self.client.post(url).json(&json!({
                    "size": size,
                    "query": { "match_all": {} },
                }))
            }
            Some(id) => {
                let url = self.endpoint(&["_search", "scroll"], &[])?;
                self.client.post(url).json(&json!({
                    "scroll": SCROLL_KEEP_ALIVE,
                    "scroll_id": id,
                }))
            }
        };
        let body = self.send(request, &format!("index {index}")).await?;
        Ok(parse_scroll_page(&body))
    }
}

/// `base` plus percent-encoded path segments and query pairs.
fn endpoint(base: &Url, segments: &[&str], query: &[(&str, &str)]) -> ToolboxResult<Url> {
    if segments.iter().any(|s| s.is_empty()) {
        return Err(ToolboxError::InvalidMessage("empty index or document id".into()));
    }
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| ToolboxError::InvalidMessage(format!("invalid elasticsearch url {base}")))?
        .pop_if_empty()
        .extend(segments);
    if !query.is_empty() {
        url.query_pairs_mut().extend_pairs(query);
    }
    Ok(url)
}

/// `from` for a 1-based page.
fn page_offset(page: u32, size: u32) -> ToolboxResult<u32> {
    page.saturating_sub(1)
        .checked_mul(size)
        .ok_or_else(|| ToolboxError::InvalidMessage(format!("page {page} of size {size} is out of range")))
}

fn field_type_mapping(field: &str, field_type: &str) -> Value {
    json!({ "properties": { field: { "type": field_type } } })
}

fn mapping_of(mut body: Value, index: &str) -> Option<Value> {
    body.get_mut(index).map(Value::take)
}

fn parse_index_names(body: &Value) -> Vec<String> {
    let mut names: Vec<String> = body
        .as_array()
        .map(|rows| {
            rows.iter()
                .filter_map(|row| row.get("index").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

fn parse_search_page(body: &Value) -> SearchPage {
    let hits = &body["hits"];
    // 7.x reports `{"value": n}`, 6.x a bare number.
    let total = hits["total"]["value"]
        .as_u64()
        .or_else(|| hits["total"].as_u64())
        .unwrap_or(0);
    SearchPage {
        total,
        hits: hits["hits"].as_array().cloned().unwrap_or_default(),
    }
}

fn parse_scroll_page(body: &Value) -> ScrollPage {
    let SearchPage { total, hits } = parse_search_page(body);
    ScrollPage {
        scroll_id: body["_scroll_id"].as_str().map(str::to_string),
        total,
        hits,
    }
}

#[async_trait]
impl Service for ElasticsearchService {
    fn kind(&self) -> BackendKind {
        BackendKind::Elasticsearch
    }

    fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    fn last_used(&self) -> Option<Instant> {
        self.last_used.lock().ok().map(|last| *last)
    }

    async fn stop(&self) -> ToolboxResult<()> {
        debug!(url = %self.url, "elasticsearch client dropped");
        Ok(())
    }
}

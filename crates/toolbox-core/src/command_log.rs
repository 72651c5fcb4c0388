//! History of commands typed into terminal sessions.
//!
//! Every record belongs to one user; every read and delete is scoped to the
//! acting user. Results are ordered newest first.

use crate::error::{ToolboxError, ToolboxResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// One executed command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandLogRecord {
    #[serde(default)]
    pub id: i64,
    pub user_id: i64,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub user_account: String,
    #[serde(default)]
    pub login_id: i64,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub user_agent: String,
    #[serde(default)]
    pub place: String,
    #[serde(default)]
    pub place_id: String,
    pub command: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl CommandLogRecord {
    pub fn new(user_id: i64, place: &str, place_id: &str, command: &str) -> Self {
        Self {
            id: 0,
            user_id,
            user_name: String::new(),
            user_account: String::new(),
            login_id: 0,
            ip: String::new(),
            user_agent: String::new(),
            place: place.to_string(),
            place_id: place_id.to_string(),
            command: command.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// Predicate and paging for `query`, `count` and `clean`.
///
/// `user_id` is mandatory. `page_index` is 1-based; `page_size == 0` returns
/// every match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CommandFilter {
    pub user_id: i64,
    pub command: Option<String>,
    pub place: Option<String>,
    pub place_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub page_index: u32,
    pub page_size: u32,
}

impl CommandFilter {
    pub fn for_user(user_id: i64) -> Self {
        Self {
            user_id,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> ToolboxResult<()> {
        if self.user_id == 0 {
            return Err(ToolboxError::InvalidMessage("command filter requires a user id".into()));
        }
        Ok(())
    }

    /// Whether `record` satisfies every predicate (paging ignored).
    pub fn matches(&self, record: &CommandLogRecord) -> bool {
        if record.user_id != self.user_id {
            return false;
        }
        if let Some(text) = self.command.as_deref().filter(|t| !t.is_empty()) {
            if !record.command.contains(text) {
                return false;
            }
        }
        if let Some(place) = self.place.as_deref().filter(|p| !p.is_empty()) {
            if record.place != place {
                return false;
            }
        }
        if let Some(place_id) = self.place_id.as_deref().filter(|p| !p.is_empty()) {
            if record.place_id != place_id {
                return false;
            }
        }
        if self.since.is_some_and(|since| record.created_at < since) {
            return false;
        }
        if self.until.is_some_and(|until| record.created_at > until) {
            return false;
        }
        true
    }

    /// `(offset, limit)` for the requested page, `None` when unpaged.
    pub fn page(&self) -> Option<(usize, usize)> {
        if self.page_size == 0 {
            return None;
        }
        let index = self.page_index.max(1) as usize;
        let size = self.page_size as usize;
        Some(((index - 1) * size, size))
    }
}

/// Persistence for command records.
#[async_trait]
pub trait CommandStore: Send + Sync {
    /// Store `record`, assigning and returning its id.
    async fn insert(&self, record: CommandLogRecord) -> ToolboxResult<CommandLogRecord>;

    /// Matching records, ordered by `(created_at DESC, id DESC)`, paged.
    async fn query(&self, filter: &CommandFilter) -> ToolboxResult<Vec<CommandLogRecord>>;

    async fn count(&self, filter: &CommandFilter) -> ToolboxResult<u64>;

    /// Remove one record owned by `user_id`. `false` if there was none.
    async fn delete(&self, user_id: i64, id: i64) -> ToolboxResult<bool>;

    /// Remove every match; returns how many were removed.
    async fn clean(&self, filter: &CommandFilter) -> ToolboxResult<u64>;
}

/// In-process store.
#[derive(Default)]
pub struct MemoryCommandStore {
    records: RwLock<Vec<CommandLogRecord>>,
    next_id: AtomicI64,
}

impl MemoryCommandStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn newest_first(a: &CommandLogRecord, b: &CommandLogRecord) -> std::cmp::Ordering {
    b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id))
}

#[async_trait]
impl CommandStore for MemoryCommandStore {
    async fn insert(&self, mut record: CommandLogRecord) -> ToolboxResult<CommandLogRecord> {
        record.id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.records.write().await.push(record.clone());
        Ok(record)
    }

    async fn query(&self, filter: &CommandFilter) -> ToolboxResult<Vec<CommandLogRecord>> {
        let records = self.records.read().await;
        let mut found: Vec<CommandLogRecord> =
            records.iter().filter(|r| filter.matches(r)).cloned().collect();
        found.sort_by(newest_first);
        Ok(match filter.page() {
            Some((offset, limit)) => found.into_iter().skip(offset).take(limit).collect(),
            None => found,
        })
    }

    async fn count(&self, filter: &CommandFilter) -> ToolboxResult<u64> {
        let records = self.records.read().await;
        Ok(records.iter().filter(|r| filter.matches(r)).count() as u64)
    }

    async fn delete(&self, user_id: i64, id: i64) -> ToolboxResult<bool> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|r| !(r.id == id && r.user_id == user_id));
        Ok(records.len() != before)
    }

    async fn clean(&self, filter: &CommandFilter) -> ToolboxResult<u64> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|r| !filter.matches(r));
        Ok((before - records.len()) as u64)
    }
}

/// Save/query/delete of command history on top of a [`CommandStore`].
#[derive(Clone)]
pub struct CommandLogService {
    store: Arc<dyn CommandStore>,
}

impl CommandLogService {
    pub fn new(store: Arc<dyn CommandStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCommandStore::new()))
    }

    /// Stamp the record with the current time and persist it.
    pub async fn save(&self, mut record: CommandLogRecord) -> ToolboxResult<CommandLogRecord> {
        if record.user_id == 0 {
            return Err(ToolboxError::InvalidMessage("command record requires a user id".into()));
        }
        record.created_at = Utc::now();
        let saved = self.store.insert(record).await?;
        debug!(user_id = saved.user_id, id = saved.id, place = %saved.place, "command saved");
        Ok(saved)
    }

    pub async fn query(&self, filter: &CommandFilter) -> ToolboxResult<Vec<CommandLogRecord>> {
        filter.validate()?;
        self.store.query(filter).await
    }

    pub async fn count(&self, filter: &CommandFilter) -> ToolboxResult<u64> {
        filter.validate()?;
        self.store.count(filter).await
    }

    pub async fn delete(&self, user_id: i64, id: i64) -> ToolboxResult<()> {
        if self.store.delete(user_id, id).await? {
            Ok(())
        } else {
            Err(ToolboxError::NotFound(format!("command {id}")))
        }
    }

    pub async fn clean(&self, filter: &CommandFilter) -> ToolboxResult<u64> {
        filter.validate()?;
        let removed = self.store.clean(filter).await?;
        info!(user_id = filter.user_id, removed, "command history cleaned");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn seed(service: &CommandLogService, user_id: i64, place: &str, commands: &[&str]) {
        for command in commands {
            service
                .save(CommandLogRecord::new(user_id, place, "web-1", command))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    #[tokio::test]
    async fn query_is_scoped_and_newest_first() {
        let service = CommandLogService::in_memory();
        seed(&service, 42, "ssh", &["ls", "cd /tmp", "pwd"]).await;
        seed(&service, 7, "ssh", &["whoami"]).await;

        let filter = CommandFilter::for_user(42);
        let found = service.query(&filter).await.unwrap();
        let commands: Vec<&str> = found.iter().map(|r| r.command.as_str()).collect();
        assert_eq!(commands, vec!["pwd", "cd /tmp", "ls"]);
        assert!(found.iter().all(|r| r.user_id == 42));
        assert!(found.windows(2).all(|w| w[0].created_at >= w[1].created_at));
        assert_eq!(service.count(&filter).await.unwrap(), found.len() as u64);
    }

    #[tokio::test]
    async fn filter_by_text_and_place() {
        let service = CommandLogService::in_memory();
        seed(&service, 1, "ssh", &["git status", "git log", "ls"]).await;
        seed(&service, 1, "local", &["git diff"]).await;

        let filter = CommandFilter {
            command: Some("git".into()),
            place: Some("ssh".into()),
            ..CommandFilter::for_user(1)
        };
        assert_eq!(service.count(&filter).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn pages_are_one_based() {
        let service = CommandLogService::in_memory();
        seed(&service, 5, "ssh", &["a", "b", "c", "d", "e"]).await;

        let mut filter = CommandFilter {
            page_index: 1,
            page_size: 2,
            ..CommandFilter::for_user(5)
        };
        let first: Vec<String> = service.query(&filter).await.unwrap().into_iter().map(|r| r.command).collect();
        assert_eq!(first, vec!["e", "d"]);

        filter.page_index = 3;
        let last: Vec<String> = service.query(&filter).await.unwrap().into_iter().map(|r| r.command).collect();
        assert_eq!(last, vec!["a"]);

        filter.page_index = 0;
        assert_eq!(service.query(&filter).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn delete_requires_ownership() {
        let service = CommandLogService::in_memory();
        let saved = service
            .save(CommandLogRecord::new(42, "ssh", "web-1", "rm -rf build"))
            .await
            .unwrap();

        let err = service.delete(7, saved.id).await.unwrap_err();
        assert!(err.is_not_found());
        service.delete(42, saved.id).await.unwrap();
        assert!(service.delete(42, saved.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn clean_removes_only_matches() {
        let service = CommandLogService::in_memory();
        seed(&service, 9, "ssh", &["top", "htop"]).await;
        seed(&service, 9, "local", &["top"]).await;
        seed(&service, 10, "ssh", &["top"]).await;

        let filter = CommandFilter {
            place: Some("ssh".into()),
            ..CommandFilter::for_user(9)
        };
        assert_eq!(service.clean(&filter).await.unwrap(), 2);
        assert_eq!(service.count(&CommandFilter::for_user(9)).await.unwrap(), 1);
        assert_eq!(service.count(&CommandFilter::for_user(10)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn missing_user_is_rejected() {
        let service = CommandLogService::in_memory();
        let err = service.query(&CommandFilter::default()).await.unwrap_err();
        assert!(matches!(err, ToolboxError::InvalidMessage(_)));
        let err = service.save(CommandLogRecord::new(0, "ssh", "", "ls")).await.unwrap_err();
        assert!(matches!(err, ToolboxError::InvalidMessage(_)));
    }
}

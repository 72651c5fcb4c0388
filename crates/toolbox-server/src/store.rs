//! SQLite-backed command history.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};
use toolbox_core::{CommandFilter, CommandLogRecord, CommandStore, ToolboxError, ToolboxResult};
use tracing::info;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS terminal_command (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    user_name TEXT NOT NULL DEFAULT '',
    user_account TEXT NOT NULL DEFAULT '',
    login_id INTEGER NOT NULL DEFAULT 0,
    ip TEXT NOT NULL DEFAULT '',
    user_agent TEXT NOT NULL DEFAULT '',
    place TEXT NOT NULL DEFAULT '',
    place_id TEXT NOT NULL DEFAULT '',
    command TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS terminal_command_user
    ON terminal_command (user_id, created_at DESC, id DESC);";

const COLUMNS: &str =
    "id, user_id, user_name, user_account, login_id, ip, user_agent, place, place_id, command, created_at";

fn storage_err(e: rusqlite::Error) -> ToolboxError {
    ToolboxError::Storage(e.to_string())
}

/// Command store over a single SQLite connection.
///
/// Every statement runs on a blocking worker.
#[derive(Clone)]
pub struct SqliteCommandStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCommandStore {
    pub fn open(path: &Path) -> ToolboxResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(storage_err)?;
        info!(path = %path.display(), "command log database opened");
        Self::with_connection(conn)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> ToolboxResult<Self> {
        Self::with_connection(Connection::open_in_memory().map_err(storage_err)?)
    }

    fn with_connection(conn: Connection) -> ToolboxResult<Self> {
        conn.execute_batch(SCHEMA).map_err(storage_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run<T, F>(&self, f: F) -> ToolboxResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| ToolboxError::Storage("command log connection poisoned".into()))?;
            f(&conn).map_err(storage_err)
        })
        .await?
    }
}

/// `WHERE` clause and its bound values for a filter.
fn where_clause(filter: &CommandFilter) -> (String, Vec<Value>) {
    let mut clauses = vec!["user_id = ?".to_string()];
    let mut values = vec![Value::Integer(filter.user_id)];

    if let Some(text) = filter.command.as_deref().filter(|t| !t.is_empty()) {
        clauses.push("instr(command, ?) > 0".into());
        values.push(Value::Text(text.to_string()));
    }
    if let Some(place) = filter.place.as_deref().filter(|p| !p.is_empty()) {
        clauses.push("place = ?".into());
        values.push(Value::Text(place.to_string()));
    }
    if let Some(place_id) = filter.place_id.as_deref().filter(|p| !p.is_empty()) {
        clauses.push("place_id = ?".into());
        values.push(Value::Text(place_id.to_string()));
    }
    if let Some(since) = filter.since {
        clauses.push("created_at >= ?".into());
        values.push(Value::Integer(since.timestamp_millis()));
    }
    if let Some(until) = filter.until {
        clauses.push("created_at <= ?".into());
        values.push(Value::Integer(until.timestamp_millis()));
    }

    (clauses.join(" AND "), values)
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<CommandLogRecord> {
    let millis: i64 = row.get(10)?;
    Ok(CommandLogRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        user_name: row.get(2)?,
        user_account: row.get(3)?,
        login_id: row.get(4)?,
        ip: row.get(5)?,
        user_agent: row.get(6)?,
        place: row.get(7)?,
        place_id: row.get(8)?,
        command: row.get(9)?,
        created_at: DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_default(),
    })
}

#[async_trait]
impl CommandStore for SqliteCommandStore {
    async fn insert(&self, mut record: CommandLogRecord) -> ToolboxResult<CommandLogRecord> {
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO terminal_command
                    (user_id, user_name, user_account, login_id, ip, user_agent, place, place_id, command, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    record.user_id,
                    record.user_name,
                    record.user_account,
                    record.login_id,
                    record.ip,
                    record.user_agent,
                    record.place,
                    record.place_id,
                    record.command,
                    record.created_at.timestamp_millis(),
                ],
            )?;
            record.id = conn.last_insert_rowid();
            Ok(record)
        })
        .await
    }

    async fn query(&self, filter: &CommandFilter) -> ToolboxResult<Vec<CommandLogRecord>> {
        let (clause, mut values) = where_clause(filter);
        let mut sql = format!(
            "SELECT {COLUMNS} FROM terminal_command WHERE {clause} ORDER BY created_at DESC, id DESC"
        );
        if let Some((offset, limit)) = filter.page() {
            sql.push_str(" LIMIT ? OFFSET ?");
            values.push(Value::Integer(limit as i64));
            values.push(Value::Integer(offset as i64));
        }
        self.run(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(values.iter()), record_from_row)?;
            rows.collect()
        })
        .await
    }

    async fn count(&self, filter: &CommandFilter) -> ToolboxResult<u64> {
        let (clause, values) = where_clause(filter);
        let sql = format!("SELECT COUNT(*) FROM terminal_command WHERE {clause}");
        let count: i64 = self
            .run(move |conn| conn.query_row(&sql, params_from_iter(values.iter()), |row| row.get(0)))
            .await?;
        Ok(count as u64)
    }

    async fn delete(&self, user_id: i64, id: i64) -> ToolboxResult<bool> {
        let removed = self
            .run(move |conn| {
                conn.execute(
                    "DELETE FROM terminal_command WHERE id = ?1 AND user_id = ?2",
                    params![id, user_id],
                )
            })
            .await?;
        Ok(removed > 0)
    }

    async fn clean(&self, filter: &CommandFilter) -> ToolboxResult<u64> {
        let (clause, values) = where_clause(filter);
        let sql = format!("DELETE FROM terminal_command WHERE {clause}");
        let removed = self
            .run(move |conn| conn.execute(&sql, params_from_iter(values.iter())))
            .await?;
        Ok(removed as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use toolbox_core::CommandLogService;

    fn record(user_id: i64, command: &str, at: DateTime<Utc>) -> CommandLogRecord {
        CommandLogRecord {
            created_at: at,
            ..CommandLogRecord::new(user_id, "ssh", "web-1", command)
        }
    }

    #[tokio::test]
    async fn query_orders_newest_first_with_id_tiebreak() {
        let store = SqliteCommandStore::open_in_memory().unwrap();
        let t0 = Utc::now();
        store.insert(record(42, "first", t0)).await.unwrap();
        store.insert(record(42, "same-time", t0)).await.unwrap();
        store.insert(record(42, "later", t0 + Duration::seconds(5))).await.unwrap();
        store.insert(record(7, "other user", t0 + Duration::seconds(9))).await.unwrap();

        let filter = CommandFilter::for_user(42);
        let found = store.query(&filter).await.unwrap();
        let commands: Vec<&str> = found.iter().map(|r| r.command.as_str()).collect();
        assert_eq!(commands, vec!["later", "same-time", "first"]);
        assert_eq!(store.count(&filter).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn time_range_and_paging() {
        let store = SqliteCommandStore::open_in_memory().unwrap();
        let t0 = Utc::now();
        for i in 0..6 {
            store
                .insert(record(1, &format!("cmd-{i}"), t0 + Duration::seconds(i)))
                .await
                .unwrap();
        }

        let ranged = CommandFilter {
            since: Some(t0 + Duration::seconds(2)),
            until: Some(t0 + Duration::seconds(4)),
            ..CommandFilter::for_user(1)
        };
        assert_eq!(store.count(&ranged).await.unwrap(), 3);

        let paged = CommandFilter {
            page_index: 2,
            page_size: 4,
            ..CommandFilter::for_user(1)
        };
        let page: Vec<String> = store.query(&paged).await.unwrap().into_iter().map(|r| r.command).collect();
        assert_eq!(page, vec!["cmd-1", "cmd-0"]);
    }

    #[tokio::test]
    async fn service_delete_and_clean_over_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteCommandStore::open(&dir.path().join("db").join("commands.db")).unwrap();
        let service = CommandLogService::new(Arc::new(store));

        let kept = service.save(CommandLogRecord::new(3, "local", "", "make")).await.unwrap();
        let gone = service.save(CommandLogRecord::new(3, "ssh", "web-1", "git pull")).await.unwrap();
        service.save(CommandLogRecord::new(3, "ssh", "web-1", "git push")).await.unwrap();

        assert!(service.delete(4, kept.id).await.unwrap_err().is_not_found());
        service.delete(3, gone.id).await.unwrap();

        let filter = CommandFilter {
            command: Some("git".into()),
            ..CommandFilter::for_user(3)
        };
        assert_eq!(service.clean(&filter).await.unwrap(), 1);
        let left = service.query(&CommandFilter::for_user(3)).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, kept.id);
    }
}

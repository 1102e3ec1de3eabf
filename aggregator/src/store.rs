use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use metrics::histogram;
use sqlx::migrate::MigrateError;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::event::{Event, ProcessedEventRecord};

/// Hard cap on the number of records a single listing returns.
pub const MAX_LIST_LIMIT: u32 = 10_000;

/// Enumeration of errors for operations with the DedupStore.
/// A key that is already present is never one of these: `commit` reports it as `Ok(false)`.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to prepare store directory {path}: {error}")]
    Io {
        path: PathBuf,
        error: std::io::Error,
    },
    #[error("connection failed with: {error}")]
    Connection { error: sqlx::Error },
    #[error("schema migration failed with: {0}")]
    Migration(#[from] MigrateError),
    #[error("{command} query failed with: {error}")]
    Query {
        command: &'static str,
        error: sqlx::Error,
    },
    #[error("payload of {topic}:{event_id} is not valid JSON: {error}")]
    CorruptPayload {
        topic: String,
        event_id: String,
        error: serde_json::Error,
    },
    #[error("payload could not be serialized: {0}")]
    Serialization(serde_json::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Path of the SQLite database file, created with its parent directories if missing
    pub path: PathBuf,
    pub max_connections: u32,
    /// How long a writer waits on a lock held by another process
    pub busy_timeout: Duration,
}

impl StoreOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_connections: 4,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(sqlx::FromRow)]
struct RecordRow {
    topic: String,
    event_id: String,
    timestamp: String,
    source: String,
    payload: String,
    processed_at: String,
}

impl TryFrom<RecordRow> for ProcessedEventRecord {
    type Error = StoreError;

    fn try_from(row: RecordRow) -> Result<Self, Self::Error> {
        let payload =
            serde_json::from_str(&row.payload).map_err(|error| StoreError::CorruptPayload {
                topic: row.topic.clone(),
                event_id: row.event_id.clone(),
                error,
            })?;

        Ok(ProcessedEventRecord {
            event: Event {
                topic: row.topic,
                event_id: row.event_id,
                timestamp: row.timestamp,
                source: row.source,
                payload,
            },
            processed_at: row.processed_at,
        })
    }
}

/// Durable record of every (topic, event_id) that has been processed.
///
/// The table's primary key is what makes `commit` authoritative: it holds for
/// every process opening the same file, not only for clones of this handle.
/// Within a process all operations additionally go through one async mutex,
/// reads included, so callers never compete for SQLite's write lock.
#[derive(Clone)]
pub struct DedupStore {
    pool: SqlitePool,
    lock: Arc<Mutex<()>>,
    path: PathBuf,
}

impl DedupStore {
    /// Open the store at `path` with default options.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::open_with_options(StoreOptions::new(path.as_ref())).await
    }

    pub async fn open_with_options(options: StoreOptions) -> StoreResult<Self> {
        if let Some(parent) = options.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|error| StoreError::Io {
                path: parent.to_path_buf(),
                error,
            })?;
        }

        let connect_options = SqliteConnectOptions::new()
            .filename(&options.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(options.busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(options.max_connections)
            .connect_with(connect_options)
            .await
            .map_err(|error| StoreError::Connection { error })?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        info!(path = %options.path.display(), "dedup store opened");

        Ok(Self {
            pool,
            lock: Arc::new(Mutex::new(())),
            path: options.path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read-only membership check. Only a hint for skipping work early: a
    /// concurrent writer may commit the key right after this returns false.
    pub async fn exists(&self, topic: &str, event_id: &str) -> StoreResult<bool> {
        let _guard = self.lock.lock().await;

        let found: i64 = sqlx::query_scalar(
            r#"
SELECT EXISTS(
    SELECT 1 FROM processed_events WHERE topic = ? AND event_id = ?
)
            "#,
        )
        .bind(topic)
        .bind(event_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|error| StoreError::Query {
            command: "SELECT",
            error,
        })?;

        Ok(found != 0)
    }

    /// Durably record `event`. Returns true if this call inserted the record,
    /// false if a record for the same key already existed.
    pub async fn commit(&self, event: &Event) -> StoreResult<bool> {
        let payload = serde_json::to_string(&event.payload).map_err(StoreError::Serialization)?;
        let processed_at = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);

        let _guard = self.lock.lock().await;
        let start = Instant::now();

        let result = sqlx::query(
            r#"
INSERT INTO processed_events
    (topic, event_id, timestamp, source, payload, processed_at)
VALUES
    (?, ?, ?, ?, ?, ?)
ON CONFLICT (topic, event_id) DO NOTHING
            "#,
        )
        .bind(&event.topic)
        .bind(&event.event_id)
        .bind(&event.timestamp)
        .bind(&event.source)
        .bind(payload)
        .bind(processed_at)
        .execute(&self.pool)
        .await
        .map_err(|error| StoreError::Query {
            command: "INSERT",
            error,
        })?;

        histogram!("aggregator_commit_duration_seconds").record(start.elapsed().as_secs_f64());

        let inserted = result.rows_affected() == 1;
        if inserted {
            debug!(key = %event.key(), "event committed");
        } else {
            debug!(key = %event.key(), "commit skipped, key already present");
        }
        Ok(inserted)
    }

    /// Records of `topic`, most recently committed first. `limit` is clamped
    /// into `1..=MAX_LIST_LIMIT`.
    pub async fn list_by_topic(
        &self,
        topic: &str,
        limit: u32,
    ) -> StoreResult<Vec<ProcessedEventRecord>> {
        let limit = limit.clamp(1, MAX_LIST_LIMIT);
        let _guard = self.lock.lock().await;

        let rows: Vec<RecordRow> = sqlx::query_as(
            r#"
SELECT topic, event_id, timestamp, source, payload, processed_at
FROM processed_events
WHERE topic = ?
ORDER BY processed_at DESC, rowid DESC
LIMIT ?
            "#,
        )
        .bind(topic)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|error| StoreError::Query {
            command: "SELECT",
            error,
        })?;

        rows.into_iter().map(ProcessedEventRecord::try_from).collect()
    }

    /// Distinct topics with at least one committed record.
    pub async fn list_topics(&self) -> StoreResult<BTreeSet<String>> {
        let _guard = self.lock.lock().await;

        let topics: Vec<String> = sqlx::query_scalar("SELECT DISTINCT topic FROM processed_events")
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StoreError::Query {
                command: "SELECT",
                error,
            })?;

        Ok(topics.into_iter().collect())
    }

    pub async fn count(&self) -> StoreResult<u64> {
        let _guard = self.lock.lock().await;

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM processed_events")
            .fetch_one(&self.pool)
            .await
            .map_err(|error| StoreError::Query {
                command: "SELECT",
                error,
            })?;

        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Drop every record. Administrative use only, never routed over HTTP.
    pub async fn clear(&self) -> StoreResult<u64> {
        let _guard = self.lock.lock().await;

        let result = sqlx::query("DELETE FROM processed_events")
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::Query {
                command: "DELETE",
                error,
            })?;

        info!(deleted = result.rows_affected(), "dedup store cleared");
        Ok(result.rows_affected())
    }

    /// Close every pooled connection, flushing the WAL.
    pub async fn close(&self) {
        let _guard = self.lock.lock().await;
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn event(topic: &str, event_id: &str) -> Event {
        let payload = json!({"user_id": "123", "nested": {"a": [1, 2, 3]}});
        Event::new(
            topic,
            event_id,
            "2025-10-22T10:00:00Z",
            "web-app",
            payload.as_object().cloned().unwrap_or_default(),
        )
    }

    async fn open_temp() -> (DedupStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = DedupStore::open(dir.path().join("dedup.db")).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn creates_missing_parent_directories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("data").join("dedup.db");

        let store = DedupStore::open(&path).await.unwrap();

        assert!(path.exists());
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn commit_once_then_reject() {
        let (store, _dir) = open_temp().await;
        let event = event("orders", "A1");

        assert!(!store.exists("orders", "A1").await.unwrap());
        assert!(store.commit(&event).await.unwrap());
        assert!(!store.commit(&event).await.unwrap());
        assert!(store.exists("orders", "A1").await.unwrap());
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn payload_round_trips_losslessly() {
        let (store, _dir) = open_temp().await;
        let event = event("orders", "A1");
        store.commit(&event).await.unwrap();

        let records = store.list_by_topic("orders", 10).await.unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event, event);
        assert!(records[0].processed_at.ends_with('Z'));
    }

    #[tokio::test]
    async fn lists_newest_first_and_clamps_limit() {
        let (store, _dir) = open_temp().await;
        for id in ["first", "second", "third"] {
            store.commit(&event("orders", id)).await.unwrap();
        }
        store.commit(&event("payments", "other")).await.unwrap();

        let ids: Vec<String> = store
            .list_by_topic("orders", 10)
            .await
            .unwrap()
            .into_iter()
            .map(|record| record.event.event_id)
            .collect();
        assert_eq!(ids, vec!["third", "second", "first"]);

        assert_eq!(store.list_by_topic("orders", 2).await.unwrap().len(), 2);
        assert_eq!(store.list_by_topic("orders", 0).await.unwrap().len(), 1);
        assert!(store.list_by_topic("unknown", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_payload_is_an_error() {
        let (store, _dir) = open_temp().await;
        sqlx::query(
            "INSERT INTO processed_events VALUES ('orders', 'bad', '2025-10-22', 'x', 'not json', '2025-10-22T00:00:00Z')",
        )
        .execute(&store.pool)
        .await
        .unwrap();

        let err = store.list_by_topic("orders", 10).await.unwrap_err();
        assert!(matches!(err, StoreError::CorruptPayload { .. }));
    }

    #[tokio::test]
    async fn topics_and_clear() {
        let (store, _dir) = open_temp().await;
        store.commit(&event("orders", "1")).await.unwrap();
        store.commit(&event("orders", "2")).await.unwrap();
        store.commit(&event("payments", "1")).await.unwrap();

        let topics = store.list_topics().await.unwrap();
        assert_eq!(
            topics.into_iter().collect::<Vec<_>>(),
            vec!["orders".to_string(), "payments".to_string()]
        );

        assert_eq!(store.clear().await.unwrap(), 3);
        assert_eq!(store.count().await.unwrap(), 0);
        assert!(store.list_topics().await.unwrap().is_empty());
        assert!(store.commit(&event("orders", "1")).await.unwrap());
    }

    #[tokio::test]
    async fn closed_store_surfaces_errors() {
        let (store, _dir) = open_temp().await;
        store.close().await;

        let err = store.commit(&event("orders", "A1")).await.unwrap_err();
        assert!(matches!(err, StoreError::Query { command: "INSERT", .. }));
        assert!(store.exists("orders", "A1").await.is_err());
    }
}

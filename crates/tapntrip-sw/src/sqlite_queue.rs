//! SQLite-backed offline queue.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tapntrip_net::Request;
use tracing::debug;

use crate::sync::{OfflineQueue, QueuedRequest};
use crate::ServiceWorkerError;

/// Schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// Offline queue persisted in a SQLite database.
#[derive(Clone)]
pub struct SqliteQueue {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteQueue {
    /// Open (or create) the queue database at `path`.
    pub fn open(path: &Path) -> Result<Self, ServiceWorkerError> {
        let conn = Connection::open(path)
            .map_err(|e| queue_error(format!("Failed to open queue database: {e}")))?;
        Self::init(conn)
    }

    /// Open a throwaway in-memory database.
    pub fn open_in_memory() -> Result<Self, ServiceWorkerError> {
        let conn = Connection::open_in_memory().map_err(|e| queue_error(e.to_string()))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, ServiceWorkerError> {
        let version: i32 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .map_err(|e| queue_error(e.to_string()))?;

        if version < SCHEMA_VERSION {
            create_schema_v1(&conn)?;
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `op` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, op: F) -> Result<T, ServiceWorkerError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, ServiceWorkerError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = lock(&conn)?;
            op(&guard)
        })
        .await
        .map_err(|e| queue_error(format!("queue task failed: {e}")))?
    }
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>, ServiceWorkerError> {
    conn.lock()
        .map_err(|_| queue_error("queue connection poisoned".to_string()))
}

fn queue_error(message: String) -> ServiceWorkerError {
    ServiceWorkerError::QueueError(message)
}

fn create_schema_v1(conn: &Connection) -> Result<(), ServiceWorkerError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS offline_requests (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            method TEXT NOT NULL,
            url TEXT NOT NULL,
            headers TEXT NOT NULL,
            body BLOB,
            enqueued_at INTEGER NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            replayed_at INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_requests_pending ON offline_requests(replayed_at);

        PRAGMA user_version = 1;
        "#,
    )
    .map_err(|e| queue_error(format!("Failed to create queue schema: {e}")))
}

#[async_trait]
impl OfflineQueue for SqliteQueue {
    async fn enqueue(&self, request: &Request) -> Result<u64, ServiceWorkerError> {
        let queued = QueuedRequest::capture(0, request);
        let headers =
            serde_json::to_string(&queued.headers).map_err(|e| queue_error(e.to_string()))?;

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO offline_requests (method, url, headers, body, enqueued_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    queued.method,
                    queued.url,
                    headers,
                    queued.body,
                    queued.enqueued_at.timestamp_millis()
                ],
            )
            .map_err(|e| queue_error(e.to_string()))?;
            let id = conn.last_insert_rowid() as u64;
            debug!(id, url = %queued.url, "Queued offline request");
            Ok(id)
        })
        .await
    }

    async fn pending(&self) -> Result<Vec<QueuedRequest>, ServiceWorkerError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, method, url, headers, body, enqueued_at, attempts
                     FROM offline_requests
                     WHERE replayed_at IS NULL
                     ORDER BY id",
                )
                .map_err(|e| queue_error(e.to_string()))?;

            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<Vec<u8>>>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, u32>(6)?,
                    ))
                })
                .map_err(|e| queue_error(e.to_string()))?;

            let mut pending = Vec::new();
            for row in rows {
                let (id, method, url, headers, body, enqueued_at, attempts) =
                    row.map_err(|e| queue_error(e.to_string()))?;
                let headers: Vec<(String, String)> = serde_json::from_str(&headers)
                    .map_err(|e| queue_error(format!("corrupt headers for {id}: {e}")))?;
                pending.push(QueuedRequest {
                    id: id as u64,
                    method,
                    url,
                    headers,
                    body,
                    enqueued_at: DateTime::from_timestamp_millis(enqueued_at)
                        .unwrap_or_else(Utc::now),
                    attempts,
                });
            }
            Ok(pending)
        })
        .await
    }

    async fn mark_replayed(&self, id: u64) -> Result<(), ServiceWorkerError> {
        self.with_conn(move |conn| {
            let updated = conn
                .execute(
                    "UPDATE offline_requests SET replayed_at = ?1
                     WHERE id = ?2 AND replayed_at IS NULL",
                    params![Utc::now().timestamp_millis(), id as i64],
                )
                .map_err(|e| queue_error(e.to_string()))?;
            if updated == 0 {
                return Err(ServiceWorkerError::NotFound(format!("queued request {id}")));
            }
            Ok(())
        })
        .await
    }

    async fn record_attempt(&self, id: u64) -> Result<(), ServiceWorkerError> {
        self.with_conn(move |conn| {
            let updated = conn
                .execute(
                    "UPDATE offline_requests SET attempts = attempts + 1
                     WHERE id = ?1 AND replayed_at IS NULL",
                    params![id as i64],
                )
                .map_err(|e| queue_error(e.to_string()))?;
            if updated == 0 {
                return Err(ServiceWorkerError::NotFound(format!("queued request {id}")));
            }
            Ok(())
        })
        .await
    }
}

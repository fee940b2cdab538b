//! Durable event log stored in an SQLite file.
//!
//! Messages get a monotonically increasing sequence number per file, which
//! doubles as the consumer offset. Consumer groups keep the last fully
//! processed offset per topic in `consumer_offsets`.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::{EventLogConfig, OffsetReset};
use crate::event::{Envelope, Event};
use crate::eventlog::{ConnectionError, Connector, LogConnection, LogHistory, RawMessage};
use crate::storage::{build_pool, Pool, StoreError};

/// Interval between reads while a poll waits for new messages.
const IDLE_POLL_STEP: Duration = Duration::from_millis(50);

/// Create the log tables if missing.
pub fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS topics (
            name TEXT PRIMARY KEY,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS log_messages (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            topic TEXT NOT NULL REFERENCES topics(name),
            payload BLOB NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_log_messages_topic_seq ON log_messages(topic, seq);

        CREATE TABLE IF NOT EXISTS consumer_offsets (
            group_id TEXT NOT NULL,
            topic TEXT NOT NULL,
            committed_offset INTEGER NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (group_id, topic)
        );",
    )
}

// ---------------------------------------------------------------------------
// Producer side
// ---------------------------------------------------------------------------

/// Producer handle on one topic. Used by the receiver facade.
#[derive(Clone)]
pub struct SqliteEventLog {
    pool: Pool,
    topic: String,
}

impl SqliteEventLog {
    /// Open (or create) the log file and make sure `topic` exists.
    pub fn open(path: impl AsRef<Path>, topic: &str) -> Result<Self, StoreError> {
        let pool = build_pool(path.as_ref())?;
        let conn = pool.get()?;
        migrate(&conn)?;
        conn.execute(
            "INSERT OR IGNORE INTO topics (name) VALUES (?1)",
            params![topic],
        )?;
        Ok(Self {
            pool,
            topic: topic.to_string(),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Wrap `event` in an envelope stamped now and append it.
    pub fn publish(&self, event: &Event) -> Result<u64, StoreError> {
        let envelope = Envelope::wrap(event, Utc::now())?;
        let offset = self.publish_raw(&envelope.to_bytes()?)?;
        debug!(offset, trace_id = %event.trace_id(), kind = %event.kind(), "published event");
        Ok(offset)
    }

    /// Append an already-encoded payload. Returns its offset.
    pub fn publish_raw(&self, payload: &[u8]) -> Result<u64, StoreError> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO log_messages (topic, payload) VALUES (?1, ?2)",
            params![self.topic, payload],
        )?;
        Ok(conn.last_insert_rowid() as u64)
    }

    /// Read-only view over the whole topic.
    pub fn history(&self) -> LogHistory {
        LogHistory::new(self.pool.clone(), self.topic.clone())
    }
}

// ---------------------------------------------------------------------------
// Consumer side
// ---------------------------------------------------------------------------

/// Opens consumer sessions on an existing log file.
///
/// Unlike [`SqliteEventLog::open`] this never creates the file: a log that is
/// not there yet is an unreachable endpoint, and the caller retries.
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    path: PathBuf,
    topic: String,
    group: String,
    reset: OffsetReset,
}

impl SqliteConnector {
    pub fn new(path: impl Into<PathBuf>, topic: &str, group: &str, reset: OffsetReset) -> Self {
        Self {
            path: path.into(),
            topic: topic.to_string(),
            group: group.to_string(),
            reset,
        }
    }

    pub fn from_config(cfg: &EventLogConfig) -> Self {
        Self::new(
            cfg.endpoint.clone(),
            &cfg.topic,
            &cfg.consumer_group,
            cfg.auto_offset_reset,
        )
    }
}

#[async_trait]
impl Connector for SqliteConnector {
    async fn connect(&self) -> Result<Box<dyn LogConnection>, ConnectionError> {
        let this = self.clone();
        let endpoint = self.endpoint();

        let (conn, cursor) = tokio::task::spawn_blocking(move || this.open_session())
            .await
            .map_err(|e| ConnectionError::Unreachable {
                endpoint: endpoint.clone(),
                reason: e.to_string(),
            })??;

        info!(
            endpoint = %endpoint,
            topic = %self.topic,
            group = %self.group,
            resume_after = cursor,
            "consumer session opened"
        );

        Ok(Box::new(SqliteConnection {
            conn: Arc::new(Mutex::new(conn)),
            topic: self.topic.clone(),
            group: self.group.clone(),
            cursor,
        }))
    }

    fn endpoint(&self) -> String {
        self.path.display().to_string()
    }
}

impl SqliteConnector {
    fn open_session(&self) -> Result<(Connection, u64), ConnectionError> {
        let unreachable = |reason: String| ConnectionError::Unreachable {
            endpoint: self.endpoint(),
            reason,
        };

        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| unreachable(e.to_string()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|e| unreachable(e.to_string()))?;

        let topic_known: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM topics WHERE name = ?1",
                params![self.topic],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| unreachable(e.to_string()))?;
        if topic_known.is_none() {
            return Err(ConnectionError::TopicMissing(self.topic.clone()));
        }

        let committed: Option<i64> = conn
            .query_row(
                "SELECT committed_offset FROM consumer_offsets WHERE group_id = ?1 AND topic = ?2",
                params![self.group, self.topic],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| unreachable(e.to_string()))?;

        let cursor = match committed {
            Some(offset) => offset as u64,
            None => {
                let start: i64 = match self.reset {
                    OffsetReset::Earliest => 0,
                    OffsetReset::Latest => conn
                        .query_row(
                            "SELECT COALESCE(MAX(seq), 0) FROM log_messages WHERE topic = ?1",
                            params![self.topic],
                            |row| row.get(0),
                        )
                        .map_err(|e| unreachable(e.to_string()))?,
                };
                // Pin the starting point so a reconnect does not jump ahead again.
                conn.execute(
                    "INSERT OR IGNORE INTO consumer_offsets (group_id, topic, committed_offset)
                     VALUES (?1, ?2, ?3)",
                    params![self.group, self.topic, start],
                )
                .map_err(|e| unreachable(e.to_string()))?;
                start as u64
            }
        };

        Ok((conn, cursor))
    }
}

/// A live consumer session. `cursor` is the offset of the last message handed
/// out; the next poll reads strictly after it.
pub struct SqliteConnection {
    conn: Arc<Mutex<Connection>>,
    topic: String,
    group: String,
    cursor: u64,
}

impl SqliteConnection {
    async fn blocking<T, F>(&self, f: F) -> Result<T, String>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| "connection mutex poisoned".to_string())?;
            f(&guard).map_err(|e| e.to_string())
        })
        .await
        .map_err(|e| e.to_string())?
    }

    async fn next_after(&self, cursor: u64) -> Result<Option<RawMessage>, ConnectionError> {
        let topic = self.topic.clone();
        self.blocking(move |conn| {
            conn.query_row(
                "SELECT seq, payload FROM log_messages
                 WHERE topic = ?1 AND seq > ?2
                 ORDER BY seq LIMIT 1",
                params![topic, cursor as i64],
                |row| {
                    Ok(RawMessage {
                        offset: row.get::<_, i64>(0)? as u64,
                        payload: row.get(1)?,
                    })
                },
            )
            .optional()
        })
        .await
        .map_err(ConnectionError::Read)
    }
}

#[async_trait]
impl LogConnection for SqliteConnection {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<RawMessage>, ConnectionError> {
        // None: the timeout does not fit in an Instant, so wait indefinitely.
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if let Some(msg) = self.next_after(self.cursor).await? {
                self.cursor = msg.offset;
                return Ok(Some(msg));
            }
            let step = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    IDLE_POLL_STEP.min(deadline - now)
                }
                None => IDLE_POLL_STEP,
            };
            tokio::time::sleep(step).await;
        }
    }

    async fn commit(&mut self, offset: u64) -> Result<(), ConnectionError> {
        let group = self.group.clone();
        let topic = self.topic.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO consumer_offsets (group_id, topic, committed_offset)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(group_id, topic) DO UPDATE SET
                    committed_offset = MAX(committed_offset, excluded.committed_offset),
                    updated_at = datetime('now')",
                params![group, topic, offset as i64],
            )
        })
        .await
        .map(|_| ())
        .map_err(ConnectionError::Commit)
    }

    fn seek(&mut self, offset: u64) {
        self.cursor = offset.saturating_sub(1);
    }
}

//! Replays the topic from its first message, independent of any consumer
//! group. Backs the history endpoints.

use rusqlite::params;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::event::{decode, Event, EventKind};
use crate::storage::{Pool, StoreError};

/// Number of decodable events of each kind in the whole log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryCounts {
    pub num_running_stats: u64,
    pub num_music_info: u64,
}

#[derive(Clone)]
pub struct LogHistory {
    pool: Pool,
    topic: String,
}

impl LogHistory {
    pub fn new(pool: Pool, topic: String) -> Self {
        Self { pool, topic }
    }

    /// The `index`-th (zero based) event of `kind`, counted from the start of
    /// the topic. Undecodable messages are not counted.
    pub fn nth_event(&self, kind: EventKind, index: u64) -> Result<Option<Event>, StoreError> {
        let mut seen = 0u64;
        let mut found = None;
        self.scan(|event| {
            if event.kind() != kind {
                return true;
            }
            if seen == index {
                found = Some(event);
                return false;
            }
            seen += 1;
            true
        })?;

        if found.is_none() {
            debug!(kind = %kind, index, seen, "no event at index");
        }
        Ok(found)
    }

    pub fn counts(&self) -> Result<HistoryCounts, StoreError> {
        let mut counts = HistoryCounts::default();
        self.scan(|event| {
            match event.kind() {
                EventKind::RunningStats => counts.num_running_stats += 1,
                EventKind::MusicInfo => counts.num_music_info += 1,
            }
            true
        })?;
        Ok(counts)
    }

    /// Feed decoded events to `visit` in log order until it returns `false`.
    fn scan(&self, mut visit: impl FnMut(Event) -> bool) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        let mut stmt =
            conn.prepare("SELECT seq, payload FROM log_messages WHERE topic = ?1 ORDER BY seq")?;
        let mut rows = stmt.query(params![self.topic])?;

        while let Some(row) = rows.next()? {
            let seq: i64 = row.get(0)?;
            let payload: Vec<u8> = row.get(1)?;
            match decode(&payload) {
                Ok(decoded) => {
                    if !visit(decoded.event) {
                        break;
                    }
                }
                Err(e) => warn!(offset = seq, error = %e, "skipping undecodable log message"),
            }
        }
        Ok(())
    }
}

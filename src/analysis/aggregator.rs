use rusqlite::{params, OptionalExtension, Transaction, TransactionBehavior};
use tracing::debug;

use crate::analysis::stats::{AggregateStats, Watermark};
use crate::event::{format_timestamp, MusicInfo, RunningStats};
use crate::storage::{parse_stored_time, Pool, StoreError};

/// Result of applying one batch to the persisted snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    Applied,
    /// The batch had no events of the relevant type.
    Empty,
    /// The batch's offset is at or behind the stored watermark.
    AlreadyApplied,
}

/// Persisted aggregate snapshot.
///
/// Counters, `last_updated` and the log offset they cover are written in one
/// IMMEDIATE transaction: concurrent writers queue up and readers see either
/// the old or the new row. The offset is what makes redelivery harmless; a
/// batch at or behind it is skipped.
#[derive(Clone)]
pub struct StatsStore {
    pool: Pool,
}

impl StatsStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Create the default snapshot if none exists yet.
    pub fn initialize(&self) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        let defaults = AggregateStats::default();
        let created = conn.execute(
            "INSERT OR IGNORE INTO aggregate_stats (id, last_updated) VALUES (1, ?1)",
            params![format_timestamp(&defaults.last_updated)],
        )?;
        if created > 0 {
            debug!("created empty aggregate snapshot");
        }
        Ok(())
    }

    /// Current snapshot. [`StoreError::NotFound`] until initialised or first written.
    pub fn snapshot(&self) -> Result<AggregateStats, StoreError> {
        let conn = self.pool.get()?;
        read_row(&conn)?
            .map(|(stats, _)| stats)
            .ok_or(StoreError::NotFound("Statistics"))
    }

    /// Offset of the last batch folded into the snapshot.
    pub fn last_offset(&self) -> Result<Option<u64>, StoreError> {
        let conn = self.pool.get()?;
        Ok(read_row(&conn)?.and_then(|(_, offset)| offset))
    }

    pub fn apply_running_batch(
        &self,
        events: &[RunningStats],
        mark: Watermark,
    ) -> Result<BatchOutcome, StoreError> {
        self.apply(mark, |stats| stats.apply_running(events, mark.at))
    }

    pub fn apply_music_batch(
        &self,
        events: &[MusicInfo],
        mark: Watermark,
    ) -> Result<BatchOutcome, StoreError> {
        self.apply(mark, |stats| stats.apply_music(events, mark.at))
    }

    fn apply(
        &self,
        mark: Watermark,
        update: impl FnOnce(&mut AggregateStats) -> bool,
    ) -> Result<BatchOutcome, StoreError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let (mut stats, last_offset) = read_row(&tx)?.unwrap_or_default();
        if last_offset.is_some_and(|seen| mark.offset <= seen) {
            debug!(offset = mark.offset, last_offset = ?last_offset, "batch already applied, skipping");
            return Ok(BatchOutcome::AlreadyApplied);
        }
        if !update(&mut stats) {
            return Ok(BatchOutcome::Empty);
        }

        write_row(&tx, &stats, mark.offset)?;
        tx.commit()?;
        Ok(BatchOutcome::Applied)
    }
}

fn read_row(conn: &rusqlite::Connection) -> Result<Option<(AggregateStats, Option<u64>)>, StoreError> {
    let row = conn
        .query_row(
            "SELECT num_running_stats, num_music_info, max_distance, max_duration,
                    avg_run_duration, avg_song_duration, last_updated, last_offset
             FROM aggregate_stats WHERE id = 1",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, f64>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, Option<i64>>(7)?,
                ))
            },
        )
        .optional()?;

    let Some((runs, songs, max_distance, max_duration, avg_run, avg_song, updated, offset)) = row
    else {
        return Ok(None);
    };

    let stats = AggregateStats {
        num_running_stats: runs as u64,
        num_music_info: songs as u64,
        max_distance,
        max_duration,
        avg_run_duration: avg_run,
        avg_song_duration: avg_song,
        last_updated: parse_stored_time("last_updated", &updated)?,
    };
    Ok(Some((stats, offset.map(|o| o as u64))))
}

fn write_row(tx: &Transaction<'_>, stats: &AggregateStats, offset: u64) -> Result<(), StoreError> {
    tx.execute(
        "INSERT INTO aggregate_stats
            (id, num_running_stats, num_music_info, max_distance, max_duration,
             avg_run_duration, avg_song_duration, last_updated, last_offset)
         VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(id) DO UPDATE SET
            num_running_stats = excluded.num_running_stats,
            num_music_info = excluded.num_music_info,
            max_distance = excluded.max_distance,
            max_duration = excluded.max_duration,
            avg_run_duration = excluded.avg_run_duration,
            avg_song_duration = excluded.avg_song_duration,
            last_updated = excluded.last_updated,
            last_offset = excluded.last_offset",
        params![
            stats.num_running_stats as i64,
            stats.num_music_info as i64,
            stats.max_distance,
            stats.max_duration,
            stats.avg_run_duration,
            stats.avg_song_duration,
            format_timestamp(&stats.last_updated),
            offset as i64,
        ],
    )?;
    Ok(())
}

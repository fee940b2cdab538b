//! Running aggregate statistics and the incremental update rules.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::event::{MusicInfo, RunningStats};

/// Incremental means stay within this relative distance of the mean
/// recomputed from the full history.
pub const MEAN_EPSILON: f64 = 1e-9;

/// Aggregate snapshot over every event applied since the beginning of history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateStats {
    pub num_running_stats: u64,
    pub num_music_info: u64,
    pub max_distance: f64,
    pub max_duration: f64,
    pub avg_run_duration: f64,
    pub avg_song_duration: f64,
    pub last_updated: DateTime<Utc>,
}

impl Default for AggregateStats {
    fn default() -> Self {
        Self {
            num_running_stats: 0,
            num_music_info: 0,
            max_distance: 0.0,
            max_duration: 0.0,
            avg_run_duration: 0.0,
            avg_song_duration: 0.0,
            last_updated: epoch(),
        }
    }
}

/// Initial watermark of a fresh snapshot.
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_default()
}

/// Position in the event log up to which a batch has been incorporated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermark {
    pub offset: u64,
    pub at: DateTime<Utc>,
}

/// `(old_avg * old_count + new_sum) / (old_count + new_count)`.
///
/// Returns `old_avg` unchanged for an empty batch.
pub fn incremental_mean(old_avg: f64, old_count: u64, new_sum: f64, new_count: u64) -> f64 {
    let total = old_count + new_count;
    if new_count == 0 || total == 0 {
        return old_avg;
    }
    (old_avg * old_count as f64 + new_sum) / total as f64
}

/// Count, sum and maximum of one field across a batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchSummary {
    pub count: u64,
    pub sum: f64,
    pub max: f64,
}

impl BatchSummary {
    pub fn of(values: impl IntoIterator<Item = f64>) -> Option<Self> {
        values.into_iter().fold(None, |acc, v| {
            Some(match acc {
                None => BatchSummary {
                    count: 1,
                    sum: v,
                    max: v,
                },
                Some(s) => BatchSummary {
                    count: s.count + 1,
                    sum: s.sum + v,
                    max: s.max.max(v),
                },
            })
        })
    }
}

impl AggregateStats {
    /// Fold a batch of runs into the snapshot. Returns `false` and leaves the
    /// snapshot untouched when the batch is empty.
    pub fn apply_running(&mut self, events: &[RunningStats], at: DateTime<Utc>) -> bool {
        let Some(durations) = BatchSummary::of(events.iter().map(|e| e.duration)) else {
            return false;
        };
        let max_distance = events
            .iter()
            .map(|e| e.distance)
            .fold(self.max_distance, f64::max);

        self.avg_run_duration = incremental_mean(
            self.avg_run_duration,
            self.num_running_stats,
            durations.sum,
            durations.count,
        );
        self.num_running_stats += durations.count;
        self.max_distance = max_distance;
        self.max_duration = self.max_duration.max(durations.max);
        self.advance(at);
        true
    }

    /// Fold a batch of songs into the snapshot. Returns `false` and leaves the
    /// snapshot untouched when the batch is empty.
    pub fn apply_music(&mut self, events: &[MusicInfo], at: DateTime<Utc>) -> bool {
        let Some(durations) = BatchSummary::of(events.iter().map(|e| e.song_duration)) else {
            return false;
        };

        self.avg_song_duration = incremental_mean(
            self.avg_song_duration,
            self.num_music_info,
            durations.sum,
            durations.count,
        );
        self.num_music_info += durations.count;
        self.advance(at);
        true
    }

    fn advance(&mut self, at: DateTime<Utc>) {
        if at > self.last_updated {
            self.last_updated = at;
        }
    }
}

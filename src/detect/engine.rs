use chrono::{DateTime, Utc};

use crate::config::ThresholdConfig;
use crate::detect::{AnomalyRecord, AnomalyType, RuleError};
use crate::event::{Event, EventKind, MusicInfo, RunningStats};

/// Evaluates events against the configured thresholds.
///
/// Evaluation is pure: the same event and thresholds always produce the same
/// records, including their descriptions.
#[derive(Debug, Clone)]
pub struct RuleEngine {
    thresholds: ThresholdConfig,
}

impl RuleEngine {
    pub fn new(thresholds: ThresholdConfig) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &ThresholdConfig {
        &self.thresholds
    }

    /// Classify one event. An event inside every bound yields an empty vec;
    /// a run can trip both of its rules at once.
    pub fn evaluate(&self, event: &Event) -> Result<Vec<AnomalyRecord>, RuleError> {
        match event {
            Event::RunningStats(run) => self.check_run(run),
            Event::MusicInfo(song) => self.check_song(song),
        }
    }

    fn check_run(&self, run: &RunningStats) -> Result<Vec<AnomalyRecord>, RuleError> {
        finite("distance", run.distance)?;
        finite("duration", run.duration)?;
        let limits = &self.thresholds.running;

        let mut found = Vec::new();
        if run.distance > limits.max_distance {
            found.push(Finding {
                anomaly_type: AnomalyType::LongRun,
                description: format!(
                    "Run distance of {}m exceeds maximum threshold of {}m",
                    run.distance, limits.max_distance
                ),
            });
        }
        if run.duration < limits.min_duration {
            found.push(Finding {
                anomaly_type: AnomalyType::ShortRun,
                description: format!(
                    "Run duration of {}s is below minimum threshold of {}s",
                    run.duration, limits.min_duration
                ),
            });
        }

        Ok(found
            .into_iter()
            .map(|f| f.into_record(&run.user_id, &run.trace_id, EventKind::RunningStats, run.timestamp))
            .collect())
    }

    fn check_song(&self, song: &MusicInfo) -> Result<Vec<AnomalyRecord>, RuleError> {
        finite("song_duration", song.song_duration)?;
        let limits = &self.thresholds.music;

        let mut found = Vec::new();
        if song.song_duration > limits.max_duration {
            found.push(Finding {
                anomaly_type: AnomalyType::LongSong,
                description: format!(
                    "Song duration of {}s exceeds maximum threshold of {}s",
                    song.song_duration, limits.max_duration
                ),
            });
        }
        if song.song_duration < limits.min_duration {
            found.push(Finding {
                anomaly_type: AnomalyType::ShortSong,
                description: format!(
                    "Song duration of {}s is below minimum threshold of {}s",
                    song.song_duration, limits.min_duration
                ),
            });
        }

        Ok(found
            .into_iter()
            .map(|f| f.into_record(&song.user_id, &song.trace_id, EventKind::MusicInfo, song.timestamp))
            .collect())
    }
}

struct Finding {
    anomaly_type: AnomalyType,
    description: String,
}

impl Finding {
    fn into_record(
        self,
        user_id: &str,
        trace_id: &str,
        event_type: EventKind,
        timestamp: DateTime<Utc>,
    ) -> AnomalyRecord {
        AnomalyRecord {
            event_id: user_id.to_string(),
            trace_id: trace_id.to_string(),
            event_type,
            anomaly_type: self.anomaly_type,
            description: self.description,
            timestamp,
        }
    }
}

fn finite(field: &'static str, value: f64) -> Result<(), RuleError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(RuleError::NonFinite { field, value })
    }
}

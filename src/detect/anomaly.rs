use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::EventKind;

/// Closed set of anomaly classifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnomalyType {
    LongRun,
    ShortRun,
    LongSong,
    ShortSong,
}

impl AnomalyType {
    pub const ALL: [AnomalyType; 4] = [
        AnomalyType::LongRun,
        AnomalyType::ShortRun,
        AnomalyType::LongSong,
        AnomalyType::ShortSong,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyType::LongRun => "LongRun",
            AnomalyType::ShortRun => "ShortRun",
            AnomalyType::LongSong => "LongSong",
            AnomalyType::ShortSong => "ShortSong",
        }
    }

    /// Event family this classification applies to.
    pub fn event_kind(&self) -> EventKind {
        match self {
            AnomalyType::LongRun | AnomalyType::ShortRun => EventKind::RunningStats,
            AnomalyType::LongSong | AnomalyType::ShortSong => EventKind::MusicInfo,
        }
    }
}

impl fmt::Display for AnomalyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown anomaly type '{0}'")]
pub struct UnknownAnomalyType(pub String);

impl FromStr for AnomalyType {
    type Err = UnknownAnomalyType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AnomalyType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownAnomalyType(s.to_string()))
    }
}

/// A single detected anomaly. Never mutated once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    /// Originating user of the event.
    pub event_id: String,
    pub trace_id: String,
    pub event_type: EventKind,
    pub anomaly_type: AnomalyType,
    pub description: String,
    pub timestamp: DateTime<Utc>,
}

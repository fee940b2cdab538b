//! Telemetry events and the envelope they travel in on the event log.
//!
//! Receivers publish `{"type", "payload", "datetime"}` envelopes. The consumer
//! decodes them back into a typed [`Event`] here; anything that does not fit
//! the shape becomes a [`DecodeError`].

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid UTF-8 JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown event type '{0}'")]
    UnknownType(String),

    #[error("invalid {kind} payload: {source}")]
    Payload {
        kind: EventKind,
        #[source]
        source: serde_json::Error,
    },
}

/// The two event families the pipeline understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunningStats,
    MusicInfo,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::RunningStats => "running_stats",
            EventKind::MusicInfo => "music_info",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "running_stats" => Some(EventKind::RunningStats),
            "music_info" => Some(EventKind::MusicInfo),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A completed run. Distance is in metres, duration in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningStats {
    pub user_id: String,
    pub trace_id: String,
    pub distance: f64,
    pub duration: f64,
    pub timestamp: DateTime<Utc>,
}

/// A listened song. Duration is in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MusicInfo {
    pub user_id: String,
    pub trace_id: String,
    pub song_name: String,
    pub artist: String,
    pub song_duration: f64,
    pub timestamp: DateTime<Utc>,
}

/// Serializes as the bare payload of whichever variant it holds.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Event {
    RunningStats(RunningStats),
    MusicInfo(MusicInfo),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::RunningStats(_) => EventKind::RunningStats,
            Event::MusicInfo(_) => EventKind::MusicInfo,
        }
    }

    pub fn trace_id(&self) -> &str {
        match self {
            Event::RunningStats(e) => &e.trace_id,
            Event::MusicInfo(e) => &e.trace_id,
        }
    }

    pub fn user_id(&self) -> &str {
        match self {
            Event::RunningStats(e) => &e.user_id,
            Event::MusicInfo(e) => &e.user_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Event::RunningStats(e) => e.timestamp,
            Event::MusicInfo(e) => e.timestamp,
        }
    }
}

/// Wire shape of a log message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: serde_json::Value,
    pub datetime: DateTime<Utc>,
}

impl Envelope {
    /// Wrap an event for publishing, stamped with `datetime`.
    pub fn wrap(event: &Event, datetime: DateTime<Utc>) -> Result<Self, serde_json::Error> {
        let payload = match event {
            Event::RunningStats(e) => serde_json::to_value(e)?,
            Event::MusicInfo(e) => serde_json::to_value(e)?,
        };
        Ok(Self {
            kind: event.kind().as_str().to_string(),
            payload,
            datetime: truncate_to_secs(datetime),
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// An event read back off the log together with its envelope timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub event: Event,
    pub received_at: DateTime<Utc>,
}

/// Decode raw log bytes into a typed event.
pub fn decode(raw: &[u8]) -> Result<Decoded, DecodeError> {
    let envelope: Envelope = serde_json::from_slice(raw)?;
    let kind = EventKind::parse(&envelope.kind)
        .ok_or_else(|| DecodeError::UnknownType(envelope.kind.clone()))?;

    let event = match kind {
        EventKind::RunningStats => serde_json::from_value(envelope.payload)
            .map(Event::RunningStats)
            .map_err(|source| DecodeError::Payload { kind, source })?,
        EventKind::MusicInfo => serde_json::from_value(envelope.payload)
            .map(Event::MusicInfo)
            .map_err(|source| DecodeError::Payload { kind, source })?,
    };

    Ok(Decoded {
        event,
        received_at: envelope.datetime,
    })
}

/// Timestamps are stored and compared at whole-second precision
/// (`YYYY-MM-DDTHH:MM:SSZ`).
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn truncate_to_secs(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(ts.timestamp(), 0).unwrap_or(ts)
}

//! Database schema and migrations.
//!
//! `aggregate_stats` exists from the first migration but holds no row until
//! the stats store is initialised. `anomalies` is only created on the first
//! append, so readers can tell "never written" from "no matches".

use rusqlite::{Connection, OptionalExtension};

pub const ANOMALIES_TABLE: &str = "anomalies";

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS aggregate_stats (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            num_running_stats INTEGER NOT NULL DEFAULT 0,
            num_music_info INTEGER NOT NULL DEFAULT 0,
            max_distance REAL NOT NULL DEFAULT 0,
            max_duration REAL NOT NULL DEFAULT 0,
            avg_run_duration REAL NOT NULL DEFAULT 0,
            avg_song_duration REAL NOT NULL DEFAULT 0,
            last_updated TEXT NOT NULL,
            last_offset INTEGER
        );

        INSERT OR IGNORE INTO schema_version (version) VALUES (1);",
    )
}

/// Create the anomaly collection if it does not exist yet.
pub fn ensure_anomalies(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS anomalies (
            id INTEGER PRIMARY KEY,
            event_id TEXT NOT NULL,
            trace_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            anomaly_type TEXT NOT NULL,
            description TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_anomalies_trace_type
            ON anomalies(trace_id, anomaly_type);
        CREATE INDEX IF NOT EXISTS idx_anomalies_timestamp ON anomalies(timestamp);",
    )
}

pub fn table_exists(conn: &Connection, name: &str) -> rusqlite::Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

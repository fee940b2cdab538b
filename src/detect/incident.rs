use rusqlite::params;
use tracing::debug;

use crate::detect::{AnomalyRecord, AnomalyType};
use crate::event::{format_timestamp, EventKind};
use crate::storage::{parse_stored_time, schema, Pool, StoreError};

/// Append-only anomaly collection.
///
/// Appends are idempotent per `(trace_id, anomaly_type)`, so a message that is
/// redelivered after a failed offset commit does not duplicate its records.
#[derive(Clone)]
pub struct AnomalyStore {
    pool: Pool,
}

impl AnomalyStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Persist one record, creating the collection on first use.
    /// Returns `false` when the record was already stored.
    pub fn append(&self, record: &AnomalyRecord) -> Result<bool, StoreError> {
        let conn = self.pool.get()?;
        schema::ensure_anomalies(&conn)?;

        let inserted = conn.execute(
            "INSERT OR IGNORE INTO anomalies
                (event_id, trace_id, event_type, anomaly_type, description, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.event_id,
                record.trace_id,
                record.event_type.as_str(),
                record.anomaly_type.as_str(),
                record.description,
                format_timestamp(&record.timestamp),
            ],
        )?;

        if inserted == 0 {
            debug!(trace_id = %record.trace_id, anomaly_type = %record.anomaly_type, "anomaly already recorded");
        }
        Ok(inserted > 0)
    }

    /// Append every record of one event inside a single transaction.
    pub fn append_all(&self, records: &[AnomalyRecord]) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut conn = self.pool.get()?;
        schema::ensure_anomalies(&conn)?;
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO anomalies
                    (event_id, trace_id, event_type, anomaly_type, description, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for record in records {
                inserted += stmt.execute(params![
                    record.event_id,
                    record.trace_id,
                    record.event_type.as_str(),
                    record.anomaly_type.as_str(),
                    record.description,
                    format_timestamp(&record.timestamp),
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// All records, optionally restricted to one type, newest first.
    ///
    /// Fails with [`StoreError::NotFound`] when nothing was ever appended.
    pub fn query(&self, filter: Option<AnomalyType>) -> Result<Vec<AnomalyRecord>, StoreError> {
        let conn = self.pool.get()?;
        if !schema::table_exists(&conn, schema::ANOMALIES_TABLE)? {
            return Err(StoreError::NotFound("Anomalies"));
        }

        // Insertion order breaks timestamp ties so repeated reads agree.
        let mut stmt = conn.prepare(
            "SELECT event_id, trace_id, event_type, anomaly_type, description, timestamp
             FROM anomalies
             WHERE ?1 IS NULL OR anomaly_type = ?1
             ORDER BY timestamp DESC, id DESC",
        )?;

        let rows = stmt.query_map([filter.map(|t| t.as_str())], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut records = Vec::new();
        for r in rows {
            let (event_id, trace_id, event_type, anomaly_type, description, timestamp) = r?;
            records.push(AnomalyRecord {
                event_id,
                trace_id,
                event_type: EventKind::parse(&event_type).ok_or(StoreError::Corrupt {
                    column: "event_type",
                    value: event_type.clone(),
                })?,
                anomaly_type: anomaly_type.parse().map_err(|_| StoreError::Corrupt {
                    column: "anomaly_type",
                    value: anomaly_type.clone(),
                })?,
                description,
                timestamp: parse_stored_time("timestamp", &timestamp)?,
            });
        }
        Ok(records)
    }
}

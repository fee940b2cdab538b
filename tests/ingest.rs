//! End-to-end consumption tests: the consumer loop against a scripted
//! in-memory log and against the SQLite log.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use telemetry_pipeline::analysis::StatsStore;
use telemetry_pipeline::config::{AppConfig, OffsetReset};
use telemetry_pipeline::detect::{AnomalyStore, AnomalyType};
use telemetry_pipeline::event::{Envelope, Event, MusicInfo, RunningStats};
use telemetry_pipeline::eventlog::{
    ConnectionError, Connector, LogConnection, RawMessage, SqliteConnector, SqliteEventLog,
};
use telemetry_pipeline::ingest::Consumer;
use telemetry_pipeline::storage::{self, schema, Pool};

// ---------------------------------------------------------------------------
// Scripted in-memory log
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Shared {
    messages: Vec<RawMessage>,
    committed: Option<u64>,
    commits: Vec<u64>,
    connects: u32,
    fail_connects: u32,
    fail_next_poll: bool,
}

#[derive(Clone, Default)]
struct MemoryLog {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryLog {
    fn push(&self, payload: Vec<u8>) -> u64 {
        let mut s = self.shared.lock().unwrap();
        let offset = s.messages.len() as u64 + 1;
        s.messages.push(RawMessage { offset, payload });
        offset
    }

    fn commit_to(&self, offset: u64) {
        self.shared.lock().unwrap().committed = Some(offset);
    }

    fn committed(&self) -> Option<u64> {
        self.shared.lock().unwrap().committed
    }

    fn commits(&self) -> Vec<u64> {
        self.shared.lock().unwrap().commits.clone()
    }

    fn connects(&self) -> u32 {
        self.shared.lock().unwrap().connects
    }
}

struct MemoryConnection {
    shared: Arc<Mutex<Shared>>,
    cursor: u64,
}

#[async_trait]
impl Connector for MemoryLog {
    async fn connect(&self) -> Result<Box<dyn LogConnection>, ConnectionError> {
        let mut s = self.shared.lock().unwrap();
        s.connects += 1;
        if s.fail_connects > 0 {
            s.fail_connects -= 1;
            return Err(ConnectionError::Unreachable {
                endpoint: "memory".into(),
                reason: "scripted failure".into(),
            });
        }
        Ok(Box::new(MemoryConnection {
            shared: self.shared.clone(),
            cursor: s.committed.unwrap_or(0),
        }))
    }

    fn endpoint(&self) -> String {
        "memory".into()
    }
}

#[async_trait]
impl LogConnection for MemoryConnection {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<RawMessage>, ConnectionError> {
        let next = {
            let mut s = self.shared.lock().unwrap();
            if s.fail_next_poll {
                s.fail_next_poll = false;
                return Err(ConnectionError::Read("scripted read failure".into()));
            }
            s.messages.iter().find(|m| m.offset > self.cursor).cloned()
        };
        match next {
            Some(msg) => {
                self.cursor = msg.offset;
                Ok(Some(msg))
            }
            None => {
                tokio::time::sleep(timeout).await;
                Ok(None)
            }
        }
    }

    async fn commit(&mut self, offset: u64) -> Result<(), ConnectionError> {
        let mut s = self.shared.lock().unwrap();
        s.commits.push(offset);
        s.committed = Some(s.committed.map_or(offset, |c| c.max(offset)));
        Ok(())
    }

    fn seek(&mut self, offset: u64) {
        self.cursor = offset.saturating_sub(1);
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Stores {
    _dir: tempfile::TempDir,
    pool: Pool,
    stats: StatsStore,
    anomalies: AnomalyStore,
    config: AppConfig,
}

fn stores() -> Stores {
    let dir = tempfile::TempDir::new().unwrap();
    let pool = storage::open_pool(dir.path().join("telemetry.db")).unwrap();
    let stats = StatsStore::new(pool.clone());
    stats.initialize().unwrap();

    let mut config = AppConfig::default();
    config.log.endpoint = dir.path().join("events.db");
    config.log.poll_interval_ms = 10;
    config.log.auto_offset_reset = OffsetReset::Earliest;
    config.processing.retry_delay_ms = 20;
    config.retry.base_delay_ms = 5;
    config.retry.max_delay_ms = 20;

    Stores {
        _dir: dir,
        anomalies: AnomalyStore::new(pool.clone()),
        pool,
        stats,
        config,
    }
}

fn at(s: &str) -> DateTime<Utc> {
    s.parse().unwrap()
}

fn run(trace: &str, distance: f64, duration: f64) -> Event {
    Event::RunningStats(RunningStats {
        user_id: "runner".into(),
        trace_id: trace.into(),
        distance,
        duration,
        timestamp: at("2024-04-01T06:00:00Z"),
    })
}

fn song(trace: &str, song_duration: f64) -> Event {
    Event::MusicInfo(MusicInfo {
        user_id: "listener".into(),
        trace_id: trace.into(),
        song_name: "Song".into(),
        artist: "Band".into(),
        song_duration,
        timestamp: at("2024-04-01T06:00:00Z"),
    })
}

fn envelope(event: &Event, datetime: &str) -> Vec<u8> {
    Envelope::wrap(event, at(datetime))
        .unwrap()
        .to_bytes()
        .unwrap()
}

async fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn spawn(
    connector: Arc<dyn Connector>,
    s: &Stores,
) -> (CancellationToken, tokio::task::JoinHandle<Consumer>) {
    let consumer = Consumer::new(connector, &s.config, s.stats.clone(), s.anomalies.clone());
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(consumer.run(shutdown.clone()));
    (shutdown, task)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_processes_and_commits_every_message() {
    let s = stores();
    let log = MemoryLog::default();
    log.push(envelope(&run("r1", 50_000.0, 600.0), "2024-04-01T06:00:01Z"));
    log.push(envelope(&run("r2", 5_000.0, 1_200.0), "2024-04-01T06:00:02Z"));
    let last = log.push(envelope(&song("m1", 900.0), "2024-04-01T06:00:03Z"));

    let (shutdown, task) = spawn(Arc::new(log.clone()), &s);
    wait_until("all commits", || log.committed() == Some(last)).await;
    shutdown.cancel();
    task.await.unwrap();

    assert_eq!(log.commits(), vec![1, 2, 3]);

    let stats = s.stats.snapshot().unwrap();
    assert_eq!(stats.num_running_stats, 2);
    assert_eq!(stats.num_music_info, 1);
    assert_eq!(stats.max_distance, 50_000.0);
    assert_eq!(stats.avg_run_duration, 900.0);
    assert_eq!(stats.last_updated, at("2024-04-01T06:00:03Z"));

    let anomalies = s.anomalies.query(None).unwrap();
    let mut kinds: Vec<_> = anomalies.iter().map(|a| a.anomaly_type).collect();
    kinds.sort_by_key(|k| k.as_str());
    assert_eq!(kinds, vec![AnomalyType::LongRun, AnomalyType::LongSong]);
    let long_run = anomalies
        .iter()
        .find(|a| a.anomaly_type == AnomalyType::LongRun)
        .unwrap();
    assert!(long_run.description.contains("50000"));
    assert!(long_run.description.contains("42000"));
}

#[tokio::test]
async fn test_undecodable_message_is_skipped_without_commit() {
    let s = stores();
    let log = MemoryLog::default();
    log.push(envelope(&run("r1", 5_000.0, 1_000.0), "2024-04-01T06:00:01Z"));
    log.push(b"definitely not json".to_vec());
    log.push(br#"{"type":"heart_rate","payload":{},"datetime":"2024-04-01T06:00:02Z"}"#.to_vec());
    log.push(envelope(&run("r2", 5_000.0, 2_000.0), "2024-04-01T06:00:03Z"));

    let (shutdown, task) = spawn(Arc::new(log.clone()), &s);
    wait_until("last commit", || log.committed() == Some(4)).await;
    shutdown.cancel();
    task.await.unwrap();

    assert_eq!(log.commits(), vec![1, 4]);
    let stats = s.stats.snapshot().unwrap();
    assert_eq!(stats.num_running_stats, 2);
    assert_eq!(stats.avg_run_duration, 1_500.0);
}

#[tokio::test]
async fn test_redelivery_after_crash_does_not_double_count() {
    let s = stores();
    let log = MemoryLog::default();
    log.push(envelope(&run("r1", 50_000.0, 100.0), "2024-04-01T06:00:01Z"));
    log.push(envelope(&run("r2", 3_000.0, 900.0), "2024-04-01T06:00:02Z"));

    // A previous process applied message 1 and crashed before committing it.
    let crashed = Consumer::new(
        Arc::new(log.clone()),
        &s.config,
        s.stats.clone(),
        s.anomalies.clone(),
    );
    let first = log.shared.lock().unwrap().messages[0].clone();
    crashed.handle(&first).unwrap();
    drop(crashed);
    assert_eq!(log.committed(), None);

    let (shutdown, task) = spawn(Arc::new(log.clone()), &s);
    wait_until("both commits", || log.committed() == Some(2)).await;
    shutdown.cancel();
    task.await.unwrap();

    let stats = s.stats.snapshot().unwrap();
    assert_eq!(stats.num_running_stats, 2);
    assert_eq!(stats.avg_run_duration, 500.0);
    // LongRun and ShortRun for r1, once each.
    assert_eq!(s.anomalies.query(None).unwrap().len(), 2);
}

#[tokio::test]
async fn test_persistence_failure_is_retried_and_not_committed() {
    let s = stores();
    let log = MemoryLog::default();
    log.push(envelope(&song("m1", 200.0), "2024-04-01T06:00:01Z"));

    s.pool
        .get()
        .unwrap()
        .execute_batch("DROP TABLE aggregate_stats")
        .unwrap();

    let (shutdown, task) = spawn(Arc::new(log.clone()), &s);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(log.commits().is_empty());

    // Storage comes back.
    schema::migrate(&s.pool.get().unwrap()).unwrap();
    s.stats.initialize().unwrap();

    wait_until("commit after recovery", || log.committed() == Some(1)).await;
    shutdown.cancel();
    task.await.unwrap();

    assert_eq!(s.stats.snapshot().unwrap().num_music_info, 1);
}

#[tokio::test]
async fn test_anomaly_write_failure_after_stats_commit_is_retried() {
    let s = stores();
    let log = MemoryLog::default();
    log.push(envelope(&run("r1", 50_000.0, 1_800.0), "2024-04-01T06:00:01Z"));

    {
        let conn = s.pool.get().unwrap();
        schema::ensure_anomalies(&conn).unwrap();
        conn.execute_batch(
            "CREATE TRIGGER block_anomalies BEFORE INSERT ON anomalies
             BEGIN SELECT RAISE(ABORT, 'anomalies are read only'); END;",
        )
        .unwrap();
    }

    let (shutdown, task) = spawn(Arc::new(log.clone()), &s);
    tokio::time::sleep(Duration::from_millis(150)).await;

    // The aggregates are in, the anomaly is not, and the offset stays open.
    assert!(log.commits().is_empty());
    assert_eq!(s.stats.snapshot().unwrap().num_running_stats, 1);
    assert_eq!(s.stats.last_offset().unwrap(), Some(1));
    assert!(s.anomalies.query(None).unwrap().is_empty());

    s.pool
        .get()
        .unwrap()
        .execute_batch("DROP TRIGGER block_anomalies")
        .unwrap();

    wait_until("commit after anomaly write recovers", || log.committed() == Some(1)).await;
    shutdown.cancel();
    task.await.unwrap();

    // Retries saw the stats watermark and did not fold the run again.
    assert_eq!(s.stats.snapshot().unwrap().num_running_stats, 1);
    let anomalies = s.anomalies.query(None).unwrap();
    assert_eq!(anomalies.len(), 1);
    assert_eq!(anomalies[0].anomaly_type, AnomalyType::LongRun);
    assert_eq!(log.commits(), vec![1]);
}

#[tokio::test]
async fn test_reconnects_after_connect_and_read_failures() {
    let s = stores();
    let log = MemoryLog::default();
    {
        let mut shared = log.shared.lock().unwrap();
        shared.fail_connects = 2;
        shared.fail_next_poll = true;
    }
    log.push(envelope(&run("r1", 5_000.0, 1_000.0), "2024-04-01T06:00:01Z"));

    let (shutdown, task) = spawn(Arc::new(log.clone()), &s);
    wait_until("commit", || log.committed() == Some(1)).await;
    shutdown.cancel();
    task.await.unwrap();

    // Two refused, one dropped after the read error, one that worked.
    assert_eq!(log.connects(), 4);
    assert_eq!(s.stats.snapshot().unwrap().num_running_stats, 1);
}

#[tokio::test]
async fn test_resumes_after_committed_offset() {
    let s = stores();
    let log = MemoryLog::default();
    log.push(envelope(&run("old", 5_000.0, 1_000.0), "2024-04-01T06:00:01Z"));
    log.push(envelope(&run("new", 5_000.0, 3_000.0), "2024-04-01T06:00:02Z"));
    log.commit_to(1);

    let (shutdown, task) = spawn(Arc::new(log.clone()), &s);
    wait_until("commit", || log.committed() == Some(2)).await;
    shutdown.cancel();
    task.await.unwrap();

    let stats = s.stats.snapshot().unwrap();
    assert_eq!(stats.num_running_stats, 1);
    assert_eq!(stats.avg_run_duration, 3_000.0);
}

#[tokio::test]
async fn test_shutdown_with_idle_log() {
    let s = stores();
    let log = MemoryLog::default();
    let (shutdown, task) = spawn(Arc::new(log.clone()), &s);
    wait_until("connect", || log.connects() == 1).await;

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("consumer did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_end_to_end_with_sqlite_log() {
    let s = stores();
    let log = SqliteEventLog::open(&s.config.log.endpoint, &s.config.log.topic).unwrap();
    log.publish(&run("r1", 45_000.0, 2_000.0)).unwrap();
    log.publish(&song("m1", 10.0)).unwrap();

    let connector = Arc::new(SqliteConnector::from_config(&s.config.log));
    let (shutdown, task) = spawn(connector, &s);

    let stats = s.stats.clone();
    wait_until("both events", || {
        stats
            .snapshot()
            .map(|st| st.num_running_stats == 1 && st.num_music_info == 1)
            .unwrap_or(false)
    })
    .await;

    // Published while the consumer is running.
    log.publish(&run("r2", 1_000.0, 100.0)).unwrap();
    wait_until("third event", || {
        stats
            .snapshot()
            .map(|st| st.num_running_stats == 2)
            .unwrap_or(false)
    })
    .await;

    shutdown.cancel();
    task.await.unwrap();

    let mut types: Vec<_> = s
        .anomalies
        .query(None)
        .unwrap()
        .into_iter()
        .map(|a| a.anomaly_type)
        .collect();
    types.sort_by_key(|t| t.as_str());
    assert_eq!(
        types,
        vec![AnomalyType::LongRun, AnomalyType::ShortRun, AnomalyType::ShortSong]
    );
}

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::analysis::{BatchOutcome, StatsStore, Watermark};
use crate::config::AppConfig;
use crate::detect::{AnomalyStore, RuleEngine};
use crate::event::{decode, DecodeError, Event, EventKind};
use crate::eventlog::{ConnectionError, Connector, LogConnection, RawMessage};
use crate::ingest::pacing::BatchPacer;
use crate::ingest::retry::{RetryController, RetryPolicy};
use crate::storage::StoreError;

/// Why a message was left uncommitted.
#[derive(Debug, Error)]
pub enum HandleError {
    #[error("undecodable message: {0}")]
    Decode(#[from] DecodeError),

    #[error("persistence failed: {0}")]
    Persistence(#[from] StoreError),

    #[error("message handler aborted: {0}")]
    Aborted(String),
}

/// What one successfully handled message did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handled {
    pub kind: EventKind,
    pub stats: BatchOutcome,
    pub anomalies: usize,
}

/// The long-running ingestion task.
///
/// Per message: decode, evaluate rules, fold into the aggregate snapshot
/// (which records the offset), append anomalies, then commit the offset.
/// A message is committed only after all of that succeeded.
pub struct Consumer {
    retry: RetryController,
    pacer: BatchPacer,
    processor: Processor,
    poll_interval: Duration,
    retry_delay: Duration,
}

/// The store-touching half of the consumer. Cheap to clone, so each message
/// can be handed to the blocking pool.
#[derive(Clone)]
struct Processor {
    rules: RuleEngine,
    stats: StatsStore,
    anomalies: AnomalyStore,
}

impl Consumer {
    pub fn new(
        connector: Arc<dyn Connector>,
        config: &AppConfig,
        stats: StatsStore,
        anomalies: AnomalyStore,
    ) -> Self {
        Self {
            retry: RetryController::new(connector, RetryPolicy::from(&config.retry)),
            pacer: BatchPacer::from_config(&config.pacing),
            processor: Processor {
                rules: RuleEngine::new(config.thresholds.clone()),
                stats,
                anomalies,
            },
            poll_interval: config.log.poll_interval(),
            retry_delay: Duration::from_millis(config.processing.retry_delay_ms),
        }
    }

    pub fn retry(&self) -> &RetryController {
        &self.retry
    }

    /// Consume until `shutdown` fires. Never returns early on a fault.
    pub async fn run(mut self, shutdown: CancellationToken) -> Self {
        info!("event consumer started");

        while !shutdown.is_cancelled() {
            let attempt = tokio::select! {
                _ = shutdown.cancelled() => break,
                res = self.retry.connect() => res,
            };

            let mut conn = match attempt {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "event log unavailable");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = self.retry.cooldown() => {}
                    }
                    continue;
                }
            };

            self.pacer.reset();
            if let Err(e) = self.consume(conn.as_mut(), &shutdown).await {
                error!(error = %e, "event log connection lost, reconnecting");
                self.retry.mark_disconnected();
            }
        }

        info!("event consumer stopped");
        self
    }

    /// Drive one connection until shutdown or a connection-level error.
    async fn consume(
        &mut self,
        conn: &mut dyn LogConnection,
        shutdown: &CancellationToken,
    ) -> Result<(), ConnectionError> {
        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }

            let polled = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                res = conn.poll(self.poll_interval) => res?,
            };
            let Some(msg) = polled else {
                continue;
            };

            // Not raced against shutdown: a message is either fully handled
            // or not started.
            let offset = msg.offset;
            let processor = self.processor.clone();
            let outcome = tokio::task::spawn_blocking(move || processor.handle(&msg))
                .await
                .unwrap_or_else(|e| Err(HandleError::Aborted(e.to_string())));

            match outcome {
                Ok(handled) => {
                    conn.commit(offset).await?;
                    debug!(
                        offset,
                        kind = %handled.kind,
                        stats = ?handled.stats,
                        anomalies = handled.anomalies,
                        "message committed"
                    );
                }
                Err(HandleError::Decode(e)) => {
                    warn!(offset, error = %e, "skipping undecodable message");
                }
                Err(e) => {
                    error!(
                        offset,
                        error = %e,
                        retry_in_ms = self.retry_delay.as_millis() as u64,
                        "failed to persist message, will retry"
                    );
                    conn.seek(offset);
                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(self.retry_delay) => {}
                    }
                    continue;
                }
            }

            if let Some(pause) = self.pacer.record() {
                debug!(pause_ms = pause.as_millis() as u64, "pacing pause");
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }
    }

    /// Process one raw message. Safe to repeat for the same offset.
    ///
    /// Runs the store writes on the calling thread.
    pub fn handle(&self, msg: &RawMessage) -> Result<Handled, HandleError> {
        self.processor.handle(msg)
    }
}

impl Processor {
    fn handle(&self, msg: &RawMessage) -> Result<Handled, HandleError> {
        let decoded = decode(&msg.payload)?;
        let event = &decoded.event;
        let kind = event.kind();

        let records = match self.rules.evaluate(event) {
            Ok(records) => records,
            Err(e) => {
                // Not folded into the aggregates either: the value would
                // poison the means.
                warn!(offset = msg.offset, trace_id = %event.trace_id(), error = %e,
                    "rule evaluation failed, treating as processed");
                return Ok(Handled {
                    kind,
                    stats: BatchOutcome::Empty,
                    anomalies: 0,
                });
            }
        };

        let mark = Watermark {
            offset: msg.offset,
            at: decoded.received_at,
        };
        let stats = match event {
            Event::RunningStats(e) => self.stats.apply_running_batch(std::slice::from_ref(e), mark)?,
            Event::MusicInfo(e) => self.stats.apply_music_batch(std::slice::from_ref(e), mark)?,
        };
        if stats == BatchOutcome::AlreadyApplied {
            debug!(offset = msg.offset, "aggregates already include this message");
        }

        let anomalies = self.anomalies.append_all(&records)?;
        for record in &records {
            info!(
                trace_id = %record.trace_id,
                anomaly_type = %record.anomaly_type,
                description = %record.description,
                "anomaly detected"
            );
        }

        Ok(Handled {
            kind,
            stats,
            anomalies,
        })
    }
}

use crate::analysis::StatsStore;
use crate::detect::AnomalyStore;
use crate::eventlog::{LogHistory, SqliteEventLog};

/// Handles shared by every request. All of them are cheap clones over a pool.
#[derive(Clone)]
pub struct AppState {
    pub stats: StatsStore,
    pub anomalies: AnomalyStore,
    pub log: SqliteEventLog,
    pub history: LogHistory,
}

impl AppState {
    pub fn new(stats: StatsStore, anomalies: AnomalyStore, log: SqliteEventLog) -> Self {
        let history = log.history();
        Self {
            stats,
            anomalies,
            log,
            history,
        }
    }
}

//! Anomaly detection: threshold rules and the append-only anomaly store.

pub mod anomaly;
pub mod engine;
pub mod incident;

pub use self::anomaly::{AnomalyRecord, AnomalyType};
pub use self::engine::RuleEngine;
pub use self::incident::AnomalyStore;

use thiserror::Error;

/// Raised only for values no threshold comparison can be made against.
#[derive(Debug, Error, PartialEq)]
pub enum RuleError {
    #[error("{field} is not a finite number: {value}")]
    NonFinite { field: &'static str, value: f64 },
}

//! Aggregate statistics over the consumed event stream.

pub mod aggregator;
pub mod stats;

pub use self::aggregator::{BatchOutcome, StatsStore};
pub use self::stats::{AggregateStats, Watermark};

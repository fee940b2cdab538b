//! Event consumption: connection retry, pacing, and the processing loop.

pub mod engine;
pub mod pacing;
pub mod retry;

pub use self::engine::{Consumer, Handled, HandleError};
pub use self::pacing::BatchPacer;
pub use self::retry::{ConnectionState, RetryController, RetryPolicy, RetryState};

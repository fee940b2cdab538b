//! Connection lifecycle for the event log.
//!
//! Two tiers: up to `max_attempts` tries with `min(base * 2^attempt, cap)`
//! between them, then a fixed cooldown before the failure count resets.
//!
//! ```text
//! Disconnected -> Connecting -> Connected
//!      ^              |             |
//!      +--- failed ---+             |
//!      +------ read/commit error ---+
//! Connecting -(attempts exhausted)-> CoolingDown -(cooldown elapsed)-> Disconnected
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::RetryConfig;
use crate::eventlog::{ConnectionError, Connector, LogConnection};

/// How many transitions and delays are kept for inspection.
const HISTORY_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    CoolingDown,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::CoolingDown => "cooling_down",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub cooldown: Duration,
}

impl RetryPolicy {
    /// Delay after the failed attempt with zero-based index `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
            cooldown: Duration::from_secs(cfg.cooldown_secs),
        }
    }
}

/// Transient bookkeeping, rebuilt on every successful connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    pub connection: ConnectionState,
    pub consecutive_failures: u32,
    pub next_backoff_delay: Duration,
}

impl RetryState {
    fn fresh(policy: &RetryPolicy) -> Self {
        Self {
            connection: ConnectionState::Disconnected,
            consecutive_failures: 0,
            next_backoff_delay: policy.delay_for(0),
        }
    }
}

pub struct RetryController {
    connector: Arc<dyn Connector>,
    policy: RetryPolicy,
    state: RetryState,
    transitions: VecDeque<ConnectionState>,
    delays: VecDeque<Duration>,
}

impl RetryController {
    pub fn new(connector: Arc<dyn Connector>, policy: RetryPolicy) -> Self {
        Self {
            connector,
            state: RetryState::fresh(&policy),
            policy,
            transitions: VecDeque::new(),
            delays: VecDeque::new(),
        }
    }

    pub fn state(&self) -> RetryState {
        self.state
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// States entered so far, oldest first.
    pub fn transitions(&self) -> Vec<ConnectionState> {
        self.transitions.iter().copied().collect()
    }

    /// Backoff sleeps taken so far, oldest first. Cooldowns are not included.
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.iter().copied().collect()
    }

    /// Connect, retrying with backoff.
    ///
    /// Fails with [`ConnectionError::Exhausted`] once `max_attempts`
    /// consecutive attempts have failed; the controller is then
    /// `CoolingDown` and the caller should await [`Self::cooldown`].
    pub async fn connect(&mut self) -> Result<Box<dyn LogConnection>, ConnectionError> {
        if self.state.connection == ConnectionState::CoolingDown {
            return Err(ConnectionError::Exhausted {
                attempts: self.state.consecutive_failures,
            });
        }

        loop {
            self.enter(ConnectionState::Connecting);
            match self.connector.connect().await {
                Ok(conn) => {
                    self.state = RetryState::fresh(&self.policy);
                    self.enter(ConnectionState::Connected);
                    info!(endpoint = %self.connector.endpoint(), "connected to event log");
                    return Ok(conn);
                }
                Err(e) => {
                    let attempt = self.state.consecutive_failures;
                    self.state.consecutive_failures += 1;

                    if self.state.consecutive_failures >= self.policy.max_attempts {
                        self.enter(ConnectionState::CoolingDown);
                        warn!(
                            endpoint = %self.connector.endpoint(),
                            attempts = self.state.consecutive_failures,
                            error = %e,
                            "event log unreachable, giving up until cooldown"
                        );
                        return Err(ConnectionError::Exhausted {
                            attempts: self.state.consecutive_failures,
                        });
                    }

                    self.enter(ConnectionState::Disconnected);
                    let delay = self.policy.delay_for(attempt);
                    self.state.next_backoff_delay = self.policy.delay_for(attempt + 1);
                    warn!(
                        endpoint = %self.connector.endpoint(),
                        attempt = self.state.consecutive_failures,
                        max_attempts = self.policy.max_attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "event log connection failed"
                    );
                    self.record_delay(delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Sleep the cooldown period and reset the failure count.
    pub async fn cooldown(&mut self) {
        info!(cooldown_secs = self.policy.cooldown.as_secs(), "cooling down before reconnecting");
        tokio::time::sleep(self.policy.cooldown).await;
        self.state = RetryState::fresh(&self.policy);
        self.enter(ConnectionState::Disconnected);
    }

    /// The live connection failed; the caller has dropped it.
    pub fn mark_disconnected(&mut self) {
        if self.state.connection == ConnectionState::Connected {
            self.enter(ConnectionState::Disconnected);
        }
    }

    fn enter(&mut self, next: ConnectionState) {
        tracing::debug!(from = %self.state.connection, to = %next, "connection state");
        self.state.connection = next;
        if self.transitions.len() == HISTORY_LEN {
            self.transitions.pop_front();
        }
        self.transitions.push_back(next);
    }

    fn record_delay(&mut self, delay: Duration) {
        if self.delays.len() == HISTORY_LEN {
            self.delays.pop_front();
        }
        self.delays.push_back(delay);
    }
}

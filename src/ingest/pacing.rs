use std::time::Duration;

use tokio::time::Instant;

use crate::config::PacingConfig;

/// Throttles a connected session: after `max_messages` messages or
/// `max_elapsed` time since the last pause, whichever comes first, the
/// consumer sleeps for `pause`. Messages are only ever delayed.
#[derive(Debug)]
pub struct BatchPacer {
    max_messages: u64,
    max_elapsed: Duration,
    pause: Duration,
    processed: u64,
    since: Instant,
}

impl BatchPacer {
    pub fn new(max_messages: u64, max_elapsed: Duration, pause: Duration) -> Self {
        Self {
            max_messages: max_messages.max(1),
            max_elapsed,
            pause,
            processed: 0,
            since: Instant::now(),
        }
    }

    pub fn from_config(cfg: &PacingConfig) -> Self {
        Self::new(
            cfg.max_messages,
            Duration::from_secs(cfg.max_elapsed_secs),
            Duration::from_millis(cfg.pause_ms),
        )
    }

    /// Whether a session with `processed` messages over `elapsed` is due a pause.
    pub fn should_pause(&self, processed: u64, elapsed: Duration) -> bool {
        processed >= self.max_messages || elapsed >= self.max_elapsed
    }

    /// Count one message. Returns the pause to take, if one is due, and
    /// restarts both counters when it does.
    pub fn record(&mut self) -> Option<Duration> {
        self.processed += 1;
        if self.should_pause(self.processed, self.since.elapsed()) {
            self.reset();
            Some(self.pause)
        } else {
            None
        }
    }

    /// Start counting afresh, e.g. on a new connection.
    pub fn reset(&mut self) {
        self.processed = 0;
        self.since = Instant::now();
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_pause_every_n_messages() {
        let mut pacer = BatchPacer::new(3, Duration::from_secs(300), Duration::from_millis(100));
        let decisions: Vec<_> = (0..7).map(|_| pacer.record()).collect();
        assert_eq!(
            decisions,
            vec![
                None,
                None,
                Some(Duration::from_millis(100)),
                None,
                None,
                Some(Duration::from_millis(100)),
                None
            ]
        );
        assert_eq!(pacer.processed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_after_elapsed_time() {
        let mut pacer = BatchPacer::new(1_000, Duration::from_secs(300), Duration::from_millis(100));
        assert_eq!(pacer.record(), None);

        tokio::time::advance(Duration::from_secs(300)).await;
        assert_eq!(pacer.record(), Some(Duration::from_millis(100)));

        // Both counters restarted.
        assert_eq!(pacer.processed(), 0);
        assert_eq!(pacer.record(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_restarts_the_clock() {
        let mut pacer = BatchPacer::new(1_000, Duration::from_secs(10), Duration::ZERO);
        tokio::time::advance(Duration::from_secs(9)).await;
        pacer.reset();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(pacer.record(), None);
    }

    #[test]
    fn test_should_pause_thresholds() {
        let pacer = BatchPacer::new(1_000, Duration::from_secs(300), Duration::from_millis(100));
        assert!(!pacer.should_pause(999, Duration::from_secs(299)));
        assert!(pacer.should_pause(1_000, Duration::ZERO));
        assert!(pacer.should_pause(0, Duration::from_secs(300)));
    }
}

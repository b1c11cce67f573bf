use std::time::Duration;

/// Interval before the first reconnect attempt.
pub const BASE_RETRY_INTERVAL: Duration = Duration::from_secs(3);

/// Default ceiling for the reconnect interval.
pub const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(60);

/// Reconnect budget and doubling delay for the consuming session.
///
/// `retries_left` of `None` means unlimited. The interval doubles after every
/// scheduled attempt and never exceeds `max_interval`. Both go back to their
/// initial values with [`Backoff::reset`] once a connection opens.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Backoff {
    retries: Option<u32>,
    retries_left: Option<u32>,
    max_interval: Duration,
    current_interval: Duration,
}

impl Backoff {
    /// `retries` below zero means retry forever.
    pub fn new(retries: i32, max_interval: Duration) -> Self {
        let retries = u32::try_from(retries).ok();
        Backoff {
            retries,
            retries_left: retries,
            max_interval,
            current_interval: BASE_RETRY_INTERVAL.min(max_interval),
        }
    }

    /// Delay before the next attempt, or `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        match self.retries_left {
            Some(0) => return None,
            Some(left) => self.retries_left = Some(left - 1),
            None => {}
        }

        let delay = self.current_interval;
        self.current_interval = self.current_interval.saturating_mul(2).min(self.max_interval);
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.retries_left = self.retries;
        self.current_interval = BASE_RETRY_INTERVAL.min(self.max_interval);
    }

    pub fn retries_left(&self) -> Option<u32> {
        self.retries_left
    }

    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new(-1, DEFAULT_MAX_INTERVAL)
    }
}

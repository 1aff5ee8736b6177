//! Bounded exponential backoff for polling the server.

use std::time::Duration;

/// Backoff schedule used when waiting on the server: job-completion polling
/// and retries of downloads the server reports as still pending.
#[derive(Debug, Clone)]
pub struct PollPolicy {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Cap on the delay between attempts.
    pub max_delay: Duration,
    /// Delay multiplier applied after each attempt.
    pub multiplier: f64,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl PollPolicy {
    /// A schedule suitable for waiting out a whole job run.
    pub fn long_running() -> Self {
        Self {
            max_attempts: 120,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 1.5,
        }
    }

    /// Delays between attempts, in order. One shorter than `max_attempts`.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        let mut delay = self.initial_delay;
        (1..self.max_attempts).map(move |_| {
            let current = delay;
            delay = Duration::from_secs_f64(
                (delay.as_secs_f64() * self.multiplier).min(self.max_delay.as_secs_f64()),
            );
            current
        })
    }
}

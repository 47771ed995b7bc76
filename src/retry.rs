//! Doubling backoff sequence shared by the connect and forwarding loops.

use std::time::Duration;

/// Exponential backoff: each call yields the current delay and doubles it,
/// saturating at `max`.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    delay: Duration,
    max: Duration,
}

impl Backoff {
    pub(crate) fn new(initial: Duration, max: Duration) -> Self {
        Self { delay: initial, max }
    }

    /// Next delay to wait before retrying.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let current = self.delay;
        self.delay = (current * 2).min(self.max);
        current
    }
}

//! Capped exponential backoff for transport errors.

use std::time::Duration;

use rand::RngExt;

/// Doubles from `initial` up to `max`; `reset` after a healthy connection.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    attempt: u32,
    jitter: bool,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.min(max);
        Self {
            initial,
            max,
            current: initial,
            attempt: 0,
            jitter: false,
        }
    }

    /// Add up to `initial / 2` of random jitter to each delay, never past `max`.
    pub fn jittered(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Delay to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.attempt += 1;
        self.current = self.current.checked_mul(2).unwrap_or(self.max).min(self.max);
        if !self.jitter {
            return delay;
        }

        let range_ms = u64::try_from(self.initial.as_millis()).unwrap_or(u64::MAX) / 2;
        let remaining_ms = u64::try_from(self.max.saturating_sub(delay).as_millis()).unwrap_or(0);
        let limit_ms = range_ms.min(remaining_ms);
        if limit_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::rng().random_range(0..limit_ms))
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempt = 0;
    }

    /// Consecutive failures since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

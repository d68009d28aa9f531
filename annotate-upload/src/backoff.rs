//! Exponential backoff
//!
//! Shared by status polling, the push channel reconnect loop and count
//! reconciliation retries.

use std::time::Duration;

/// Exponential backoff with an optional attempt limit
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Delays handed out so far
    pub attempt: u32,
    /// `None` retries forever
    pub max_attempts: Option<u32>,
    /// Delay returned by the next call to [`Backoff::next_delay`]
    pub current_delay: Duration,
    initial_delay: Duration,
    /// Upper bound for a single delay
    pub max_delay: Duration,
}

impl Backoff {
    pub fn new(initial_delay: Duration, max_delay: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            current_delay: initial_delay,
            initial_delay,
            max_delay,
        }
    }

    /// Start over from the initial delay
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.current_delay = self.initial_delay;
    }

    pub fn has_attempts_remaining(&self) -> bool {
        self.max_attempts.map_or(true, |max| self.attempt < max)
    }

    /// Next delay, doubling each time; `None` once attempts are used up
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.has_attempts_remaining() {
            return None;
        }

        let delay = self.current_delay;
        self.attempt += 1;
        self.current_delay = std::cmp::min(self.current_delay * 2, self.max_delay);

        Some(delay)
    }

    pub fn status(&self) -> String {
        match self.max_attempts {
            Some(max) => format!(
                "Attempt {}/{}, next delay: {:?}",
                self.attempt, max, self.current_delay
            ),
            None => format!("Attempt {}, next delay: {:?}", self.attempt, self.current_delay),
        }
    }
}

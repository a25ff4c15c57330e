//! Reconnect pacing for the push-subscribe transport.

use std::time::Duration;

/// Delay strategy between reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Fixed { delay: Duration },
    /// `base * factor^attempt`, capped at `max`, with optional ±50% jitter.
    Exponential {
        base: Duration,
        factor: f64,
        max: Duration,
        jitter: bool,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Fixed {
            delay: Duration::from_secs(3),
        }
    }
}

impl Backoff {
    /// Delay before the given reconnect attempt (0-based).
    pub fn delay(self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => delay,
            Self::Exponential { base, factor, max, jitter } => {
                let scaled = base.as_secs_f64() * factor.powi(attempt as i32);
                let mut delay = Duration::from_secs_f64(scaled.min(max.as_secs_f64()));
                if jitter {
                    let half = (delay.as_millis() as f64 * 0.5) as u64;
                    let offset = fastrand::u64(0..=(half * 2));
                    let total = delay.as_millis() as i64 + offset as i64 - half as i64;
                    delay = Duration::from_millis(total.max(0) as u64);
                }
                delay
            }
        }
    }
}

/// Bounded attempt counter. Reset on every successful open.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            backoff,
            attempts: 0,
        }
    }

    /// No reconnects at all; used by the request-stream variant.
    pub fn disabled() -> Self {
        Self::new(0, Backoff::default())
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Consume one attempt and return the delay to wait first,
    /// or `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        let d = self.backoff.delay(self.attempts);
        self.attempts += 1;
        Some(d)
    }
}

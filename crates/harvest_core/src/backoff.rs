use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry configuration for recoverable page faults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff_secs: u64,
    pub backoff_factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff_secs: 1,
            backoff_factor: 2,
        }
    }
}

impl RetryPolicy {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_secs(self.initial_backoff_secs)
    }

    /// Sleep before the retry following the `attempt`-th consecutive fault (0-based):
    /// `initial * factor^attempt`, saturating.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let mut delay = self.initial_backoff();
        for _ in 0..attempt {
            delay = delay.saturating_mul(self.backoff_factor);
        }
        delay
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep `delay`, then request the same page again.
    Retry { attempt: u32, delay: Duration },
    /// The bound was reached; the fault is now fatal.
    Exhausted { attempts: u32 },
}

/// Retry bookkeeping for one harvest invocation. Create it per call, never
/// share it between runs.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    factor: u32,
    max_retries: u32,
    retries: u32,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, factor: u32, max_retries: u32) -> Self {
        Self {
            initial,
            factor,
            max_retries,
            retries: 0,
            current: initial,
        }
    }

    pub fn from_policy(policy: &RetryPolicy, max_retries: u32) -> Self {
        Self::new(policy.initial_backoff(), policy.backoff_factor, max_retries)
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn current_delay(&self) -> Duration {
        self.current
    }

    pub fn register_failure(&mut self) -> RetryDecision {
        self.retries += 1;
        if self.retries >= self.max_retries {
            return RetryDecision::Exhausted {
                attempts: self.retries,
            };
        }
        let delay = self.current;
        self.current = self.current.saturating_mul(self.factor);
        RetryDecision::Retry {
            attempt: self.retries,
            delay,
        }
    }

    /// Called after a successful page.
    pub fn reset(&mut self) {
        self.retries = 0;
        self.current = self.initial;
    }
}

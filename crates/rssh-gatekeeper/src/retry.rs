//! Bounded exponential backoff for slot store calls

use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
    /// Total attempts per call, including the first one
    pub max_attempts: usize,
    /// Deadline for a single store call
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
            max_attempts: 5,
            call_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Policy that never waits between attempts (tests)
    pub fn immediate(max_attempts: usize) -> Self {
        Self {
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
            max_attempts,
            call_timeout: Duration::from_secs(5),
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.clone())
    }
}

/// Backoff state for one logical call
pub struct Backoff {
    policy: RetryPolicy,
    current_backoff: Duration,
    attempt: usize,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            current_backoff: policy.initial_backoff,
            policy,
            attempt: 0,
        }
    }

    /// Wait before the next attempt
    ///
    /// Returns `false` once the attempt budget is spent.
    pub async fn wait(&mut self) -> bool {
        self.attempt += 1;

        if self.attempt >= self.policy.max_attempts {
            return false;
        }

        debug!(
            "Waiting {}ms before slot store attempt {}",
            self.current_backoff.as_millis(),
            self.attempt + 1
        );

        sleep(self.current_backoff).await;

        let next_backoff =
            Duration::from_secs_f64(self.current_backoff.as_secs_f64() * self.policy.multiplier);
        self.current_backoff = next_backoff.min(self.policy.max_backoff);

        true
    }

    /// Attempts already made
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn current_backoff(&self) -> Duration {
        self.current_backoff
    }
}

//! Bounds on agent work.
//!
//! Prevents runaway processing through:
//! - A maximum number of agent invocations per item (the persistence loop)
//! - A wall-clock bound per item
//! - A retry policy that retries a failed action exactly once

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::OrchestratorSettings;

/// Bounds for the per-item persistence loop
#[derive(Debug, Clone, Copy)]
pub struct PersistenceLimits {
    /// Maximum agent invocations for one item
    pub max_iterations: u32,

    /// Maximum wall-clock time for one item
    pub max_duration: Duration,
}

impl Default for PersistenceLimits {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_duration: Duration::from_secs(900),
        }
    }
}

impl From<&OrchestratorSettings> for PersistenceLimits {
    fn from(settings: &OrchestratorSettings) -> Self {
        Self {
            max_iterations: settings.max_iterations.max(1),
            max_duration: Duration::from_secs(settings.max_duration_seconds),
        }
    }
}

impl PersistenceLimits {
    /// Check current tracker state against limits
    pub fn check(&self, tracker: &PersistenceTracker) -> Result<(), LimitExceeded> {
        if tracker.iterations >= self.max_iterations {
            return Err(LimitExceeded::MaxIterations {
                actual: tracker.iterations,
                limit: self.max_iterations,
            });
        }

        let elapsed = tracker.started_at.elapsed();
        if elapsed >= self.max_duration {
            return Err(LimitExceeded::MaxDuration {
                elapsed_seconds: elapsed.as_secs(),
                limit_seconds: self.max_duration.as_secs(),
            });
        }

        Ok(())
    }

    /// Time left before the wall-clock bound, used to cap a single invocation
    pub fn remaining(&self, tracker: &PersistenceTracker) -> Duration {
        self.max_duration.saturating_sub(tracker.started_at.elapsed())
    }
}

/// Tracks work done on one item
#[derive(Debug, Clone)]
pub struct PersistenceTracker {
    /// Agent invocations so far
    pub iterations: u32,

    /// When processing of the item started
    pub started_at: Instant,
}

impl Default for PersistenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PersistenceTracker {
    pub fn new() -> Self {
        Self {
            iterations: 0,
            started_at: Instant::now(),
        }
    }

    /// Record an agent invocation
    pub fn record_iteration(&mut self) {
        self.iterations += 1;
    }
}

/// A persistence bound was reached
#[derive(Debug, Clone, Error)]
pub enum LimitExceeded {
    #[error("Maximum iterations reached: {actual} >= {limit}")]
    MaxIterations { actual: u32, limit: u32 },

    #[error("Time bound reached: {elapsed_seconds}s >= {limit_seconds}s")]
    MaxDuration {
        elapsed_seconds: u64,
        limit_seconds: u64,
    },
}

/// Retry policy for failed approved actions.
///
/// An action gets one retry and no more; only the pause before it is tunable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts including the first. Not read from config.
    #[serde(skip, default = "two_attempts")]
    pub max_attempts: u32,

    /// Pause before the retry, in milliseconds
    #[serde(default = "default_retry_delay")]
    pub delay_ms: u64,
}

fn two_attempts() -> u32 {
    2
}
fn default_retry_delay() -> u64 {
    1000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: two_attempts(),
            delay_ms: default_retry_delay(),
        }
    }
}

impl RetryPolicy {
    /// No pause before the retry
    pub fn immediate() -> Self {
        Self {
            delay_ms: 0,
            ..Default::default()
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Whether a failure on `attempt` (1-indexed) earns another try
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

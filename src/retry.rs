//! Activity retry policy and the scheduler that turns failures into retry timers.
//!
//! Every decision is derived from persisted history: the attempt number is the count of
//! `TaskFailed` records for the sequence number, and the retry timer is anchored at the
//! timestamp of the failure that triggered it. Nothing here depends on process-local state,
//! so any dispatcher on any process reaches the same decision.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{ErrorDetails, Event, EventKind};

/// Exponential backoff policy attached to an activity call.
///
/// The delay after failed attempt `n` is
/// `min(max_retry_interval, initial_retry_interval * backoff_coefficient^(n-1))`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_retry_interval: Duration,
    pub max_retry_interval: Duration,
    pub backoff_coefficient: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_retry_interval: Duration::from_secs(1),
            max_retry_interval: Duration::from_secs(60),
            backoff_coefficient: 2.0,
        }
    }
}

impl RetryPolicy {
    /// # Panics
    /// Panics if `max_attempts` is zero.
    pub fn new(max_attempts: u32) -> Self {
        assert!(max_attempts >= 1, "max_attempts must be at least 1");
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_retry_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_retry_interval = interval;
        self
    }

    /// # Panics
    /// Panics if `coefficient` is below 1.0 or not finite.
    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        assert!(
            coefficient.is_finite() && coefficient >= 1.0,
            "backoff_coefficient must be at least 1.0"
        );
        self.backoff_coefficient = coefficient;
        self
    }

    /// Check a policy that was built by hand or deserialized.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if !self.backoff_coefficient.is_finite() || self.backoff_coefficient < 1.0 {
            return Err(format!(
                "backoff_coefficient must be at least 1.0, got {}",
                self.backoff_coefficient
            ));
        }
        if self.max_retry_interval < self.initial_retry_interval {
            return Err("max_retry_interval must not be shorter than initial_retry_interval".to_string());
        }
        Ok(())
    }

    /// Delay before the retry that follows failed attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let max_ms = self.max_retry_interval.as_millis() as f64;
        let raw_ms = self.initial_retry_interval.as_millis() as f64 * self.backoff_coefficient.powi(exponent);
        let ms = if raw_ms.is_finite() { raw_ms.min(max_ms) } else { max_ms };
        Duration::from_millis(ms.round() as u64)
    }
}

/// Outcome of feeding a failure to the [`RetryScheduler`].
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Re-dispatch the activity as `next_attempt` once a timer fires at `fire_at_ms`.
    Retry {
        next_attempt: u32,
        delay: Duration,
        fire_at_ms: u64,
    },
    /// No more attempts; the awaiting call resolves with `details`.
    Exhausted { attempts: u32, details: ErrorDetails },
}

/// Stateless retry decisions over an instance history.
pub struct RetryScheduler;

impl RetryScheduler {
    /// Number of failed attempts recorded for `seq`.
    pub fn failure_count(history: &[Event], seq: u64) -> u32 {
        history
            .iter()
            .filter(|e| matches!(&e.kind, EventKind::TaskFailed { seq: s, .. } if *s == seq))
            .count() as u32
    }

    /// Policy attached to the call that scheduled `seq`, if any.
    pub fn policy_for(history: &[Event], seq: u64) -> Option<RetryPolicy> {
        history.iter().find_map(|e| match &e.kind {
            EventKind::TaskScheduled { seq: s, retry, .. } if *s == seq => retry.clone(),
            _ => None,
        })
    }

    fn last_failure(history: &[Event], seq: u64) -> Option<(&Event, &ErrorDetails)> {
        history.iter().rev().find_map(|e| match &e.kind {
            EventKind::TaskFailed { seq: s, details, .. } if *s == seq => Some((e, details)),
            _ => None,
        })
    }

    /// Decide what follows the most recent failure recorded for `seq`.
    ///
    /// Returns `None` when no failure is recorded. Calls without a policy get a single attempt;
    /// configuration failures are never retried.
    pub fn on_failure(history: &[Event], seq: u64) -> Option<RetryDecision> {
        let (failed, details) = Self::last_failure(history, seq)?;
        let attempts = Self::failure_count(history, seq);
        let policy = Self::policy_for(history, seq);
        let max_attempts = policy.as_ref().map(|p| p.max_attempts).unwrap_or(1);

        match policy {
            Some(policy) if details.is_retryable() && attempts < max_attempts => {
                let delay = policy.delay_for_attempt(attempts);
                Some(RetryDecision::Retry {
                    next_attempt: attempts + 1,
                    delay,
                    fire_at_ms: failed.timestamp_ms.saturating_add(delay.as_millis() as u64),
                })
            }
            _ => Some(RetryDecision::Exhausted {
                attempts,
                details: details.clone(),
            }),
        }
    }

    /// Terminal error for `seq` once no retry can follow.
    pub fn terminal_failure(history: &[Event], seq: u64) -> Option<ErrorDetails> {
        match Self::on_failure(history, seq)? {
            RetryDecision::Exhausted { details, .. } => Some(details),
            RetryDecision::Retry { .. } => None,
        }
    }
}

use std::time::Duration;

use rand::Rng;
use reqwest::StatusCode;
use serde::Deserialize;

/// Configures attempt count, backoff timing and which failures are retried.
///
/// `max_attempts` counts every attempt including the first one, so a value of
/// `1` disables retries. The delay before attempt `n + 1` is
/// `base_delay_ms * backoff_multiplier^(n - 1)` plus a uniform jitter in
/// `[-jitter_ms, +jitter_ms]`, never below zero. The exponent is capped at
/// 16, so delays stop growing after the seventeenth attempt.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per logical request.
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds.
    pub base_delay_ms: u64,
    /// Growth factor applied per retry.
    pub backoff_multiplier: f64,
    /// Upper bound of the random jitter in milliseconds.
    pub jitter_ms: u64,
    /// HTTP status codes that are retried instead of returned.
    pub retryable_statuses: Vec<u16>,
    /// Whether connection-level failures are retried.
    pub retry_transport: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 250,
            backoff_multiplier: 2.0,
            jitter_ms: 0,
            retryable_statuses: vec![429, 502, 503, 504],
            retry_transport: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, base_delay_ms: u64, multiplier: f64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter_ms: u64) -> Self {
        self.jitter_ms = jitter_ms;
        self
    }

    pub fn with_retryable_statuses<I>(mut self, statuses: I) -> Self
    where
        I: IntoIterator<Item = u16>,
    {
        self.retryable_statuses = statuses.into_iter().collect();
        self
    }

    pub fn with_retry_transport(mut self, retry_transport: bool) -> Self {
        self.retry_transport = retry_transport;
        self
    }

    /// Effective attempt ceiling; a zero setting still allows one attempt.
    pub fn attempt_limit(&self) -> u32 {
        self.max_attempts.max(1)
    }

    pub fn is_retryable_status(&self, status: StatusCode) -> bool {
        self.retryable_statuses.contains(&status.as_u16())
    }

    pub fn is_retryable_transport(&self, err: &reqwest::Error) -> bool {
        self.retry_transport
            && (err.is_timeout() || err.is_connect() || err.is_request() || err.is_body())
    }

    /// Backoff before the retry that follows `completed` attempts (1-based).
    pub fn delay_after(&self, completed: u32) -> Duration {
        let base = self.nominal_delay_ms(completed);
        if self.jitter_ms == 0 {
            return Duration::from_millis(base);
        }

        let jitter = self.jitter_ms.min(i64::MAX as u64) as i64;
        let offset = rand::rng().random_range(-jitter..=jitter);
        Duration::from_millis(base.saturating_add_signed(offset))
    }

    fn nominal_delay_ms(&self, completed: u32) -> u64 {
        let exp = completed.saturating_sub(1).min(16) as i32;
        let multiplier = if self.backoff_multiplier.is_finite() && self.backoff_multiplier > 0.0 {
            self.backoff_multiplier
        } else {
            1.0
        };
        let delay = self.base_delay_ms as f64 * multiplier.powi(exp);
        if delay >= u64::MAX as f64 {
            u64::MAX
        } else {
            delay.round() as u64
        }
    }
}

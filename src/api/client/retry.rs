//! Retry policy utilities for API requests.

use crate::error::ApiError;
use std::time::Duration;

/// Bounded retry policy used by `ApiClient` for non-streaming calls.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RetryPolicy {
    /// Upper bound on total attempts, including the initial request.
    pub(crate) max_attempts: u32,
    /// Base delay used for exponential backoff.
    pub(crate) initial_backoff: Duration,
    /// Maximum allowed delay between retry attempts.
    pub(crate) max_backoff: Duration,
}

/// Whether a request may safely be replayed after a server-side failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Idempotency {
    /// Reads: retry on transport failures, 429 and 5xx.
    Idempotent,
    /// Writes: retry only when the request never reached the server, or on 429.
    NonIdempotent,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Decide whether another retry attempt should be scheduled.
    pub(crate) fn should_retry(&self, err: &ApiError, attempt: u32, kind: Idempotency) -> bool {
        if attempt.saturating_add(1) >= self.max_attempts {
            return false;
        }
        match (err, kind) {
            (ApiError::Http(inner), Idempotency::Idempotent) => {
                inner.is_timeout() || inner.is_connect()
            }
            (ApiError::Http(inner), Idempotency::NonIdempotent) => inner.is_connect(),
            (ApiError::Status { code, .. }, Idempotency::Idempotent) => {
                *code == 429 || (500..=599).contains(code)
            }
            (ApiError::Status { code, .. }, Idempotency::NonIdempotent) => *code == 429,
            (ApiError::InvalidResponse(_) | ApiError::Cancelled, _) => false,
        }
    }

    /// Exponential backoff capped at `max_backoff`.
    pub(crate) fn retry_delay_for(&self, attempt: u32) -> Duration {
        let pow = 2u32.saturating_pow(attempt);
        let millis = self
            .initial_backoff
            .as_millis()
            .saturating_mul(pow as u128)
            .min(self.max_backoff.as_millis());
        Duration::from_millis(millis as u64)
    }
}

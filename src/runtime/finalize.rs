//! Post-`end` history refresh with bounded retries.

use super::handle::wait_for_cancellation;
use crate::api::RunBackend;
use crate::config::StreamConfig;
use crate::error::ApiError;
use crate::types::ThreadHistory;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;

/// How hard to try reconciling a thread with the server after `end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalizePolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Fixed delay between attempts.
    pub backoff: Duration,
}

impl Default for FinalizePolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_secs(1),
        }
    }
}

impl FinalizePolicy {
    pub fn from_config(config: &StreamConfig) -> Self {
        Self {
            attempts: config.finalize_attempts.max(1),
            backoff: config.finalize_backoff(),
        }
    }
}

#[derive(Debug)]
pub(super) enum FinalizeError {
    Cancelled,
    Exhausted { attempts: u32, last: ApiError },
}

/// Fetch the latest history, retrying non-cancellation failures.
pub(super) async fn fetch_with_retry(
    backend: &dyn RunBackend,
    thread_id: &str,
    policy: FinalizePolicy,
    cancel_rx: &mut watch::Receiver<bool>,
) -> Result<ThreadHistory, FinalizeError> {
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        let result = tokio::select! {
            biased;
            _ = wait_for_cancellation(cancel_rx) => return Err(FinalizeError::Cancelled),
            result = backend.fetch_latest_history(thread_id) => result,
        };
        match result {
            Ok(history) => return Ok(history),
            Err(err) if err.is_cancelled() => return Err(FinalizeError::Cancelled),
            Err(err) if attempt >= attempts => {
                return Err(FinalizeError::Exhausted {
                    attempts,
                    last: err,
                })
            }
            Err(err) => {
                tracing::warn!(thread_id, attempt, error = %err, "finalize fetch failed; retrying");
                tokio::select! {
                    biased;
                    _ = wait_for_cancellation(cancel_rx) => return Err(FinalizeError::Cancelled),
                    _ = sleep(policy.backoff) => {}
                }
                attempt += 1;
            }
        }
    }
}

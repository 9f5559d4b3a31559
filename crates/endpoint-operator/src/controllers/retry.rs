//! Retry policy with exponential backoff for reconciliation passes
//!
//! Errors are classified as transient or permanent. Transient failures re-run
//! the whole pass, including the initial Get, so a lost update race is retried
//! against fresh state.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::endpoint::EndpointError;

/// Default attempts per pass
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Base delay for exponential backoff
const BASE_DELAY: Duration = Duration::from_millis(500);

/// Maximum delay between attempts
const MAX_DELAY: Duration = Duration::from_secs(30);

/// Error classification for retry behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transient errors that should be retried with backoff
    /// Examples: API server unavailable, update conflicts
    Transient,
    /// Permanent errors that will not recover without the pod changing
    /// Examples: missing annotations, malformed pods, forbidden writes
    Permanent,
}

/// Classify error type for retry behavior
pub fn classify(error: &EndpointError) -> ErrorKind {
    match error {
        EndpointError::MissingAnnotation(_) => ErrorKind::Permanent,
        EndpointError::WrongType(_) => ErrorKind::Permanent,
        EndpointError::ServiceLookupFailed { .. } => ErrorKind::Transient,
        EndpointError::ClusterApi { source, .. } if source.is_transient() => ErrorKind::Transient,
        EndpointError::ClusterApi { .. } => ErrorKind::Permanent,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: BASE_DELAY,
            max_delay: MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Delay before the attempt following `attempt`, `None` once retrying stops
    ///
    /// Exponential backoff: 500ms, 1s, 2s, ... capped at `max_delay`.
    pub fn compute_backoff(&self, attempt: u32, kind: ErrorKind) -> Option<Duration> {
        match kind {
            ErrorKind::Permanent => None,
            ErrorKind::Transient if attempt >= self.max_attempts => None,
            ErrorKind::Transient => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                Some(self.base_delay.saturating_mul(factor).min(self.max_delay))
            }
        }
    }
}

/// Run a pass, retrying transient failures according to `policy`
///
/// Each attempt is logged. The final error is returned once attempts run out
/// or a permanent error is hit.
pub async fn retry_pass<T, F, Fut>(
    policy: &RetryPolicy,
    pod_key: &str,
    mut pass: F,
) -> Result<T, EndpointError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EndpointError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match pass().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(pod = %pod_key, attempt, "Pass succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) => {
                let kind = classify(&e);
                match policy.compute_backoff(attempt, kind) {
                    Some(delay) => {
                        warn!(
                            pod = %pod_key,
                            error = %e,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "Reconciliation error, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        error!(
                            pod = %pod_key,
                            error = %e,
                            attempt,
                            error_kind = ?kind,
                            "Reconciliation failed"
                        );
                        return Err(e);
                    }
                }
            }
        }
    }
}

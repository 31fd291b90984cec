//! Transient-fault retry for top-level provider entry points.

use std::future::Future;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::Timings;
use crate::error::ProviderError;

/// Number of attempts made by the top-level retry wrapper.
pub const DEFAULT_ATTEMPTS: u32 = 10;

/// Retry configuration for entry points.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Maximum number of attempts.
    pub max_attempts: u32,
    /// Fixed delay between attempts.
    pub delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_ATTEMPTS,
            delay: Duration::from_secs(1),
        }
    }
}

impl RetryConfig {
    /// Default attempt count with the configured client retry delay.
    #[must_use]
    pub fn from_timings(timings: &Timings) -> Self {
        Self {
            max_attempts: DEFAULT_ATTEMPTS,
            delay: timings.client_retry_delay(),
        }
    }
}

/// Run `f`, retrying transient failures after calling `reinit`.
///
/// Non-transient errors (quota, naming, verification, ...) are returned on
/// first occurrence. When all attempts fail the last error is returned.
///
/// # Errors
/// Returns the first non-transient error, or the last transient one once
/// attempts are exhausted.
pub async fn with_retry<T, F, Fut, R>(
    config: &RetryConfig,
    operation_name: &str,
    mut reinit: R,
    mut f: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
    R: FnMut() -> Result<(), ProviderError>,
{
    let mut attempt = 0;

    loop {
        attempt += 1;
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) => {
                let left = config.max_attempts.saturating_sub(attempt);
                error!(
                    operation = operation_name,
                    error = %e,
                    retries_left = left,
                    "Operation failed"
                );
                if left == 0 {
                    return Err(e);
                }

                info!(operation = operation_name, "Reinitializing clients before retry");
                if let Err(reinit_err) = reinit() {
                    warn!(error = %reinit_err, "Client reinitialization failed");
                }
                tokio::time::sleep(config.delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::providers::BackendError;

    fn transient() -> ProviderError {
        BackendError::Api {
            status: 503,
            message: "unavailable".to_string(),
        }
        .into()
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_then_succeeds() {
        let calls = &AtomicU32::new(0);
        let reinits = AtomicU32::new(0);
        let config = RetryConfig::default();

        let result = with_retry(
            &config,
            "list",
            || {
                reinits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(transient())
                } else {
                    Ok(7)
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(reinits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_is_not_retried() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), _> = with_retry(
            &RetryConfig::default(),
            "create",
            || Ok(()),
            || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::QuotaExceeded {
                    name: "n".to_string(),
                    message: "over quota".to_string(),
                })
            },
        )
        .await;

        assert!(matches!(result, Err(ProviderError::QuotaExceeded { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error() {
        let calls = &AtomicU32::new(0);
        let config = RetryConfig {
            max_attempts: 3,
            delay: Duration::from_secs(1),
        };
        let result: Result<(), _> = with_retry(&config, "list", || Ok(()), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(transient())
        })
        .await;

        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}

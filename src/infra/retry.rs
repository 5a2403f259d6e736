use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::config::RetryPolicy;
use crate::error::{RefineryError, Result};

/// Run a fallible external operation under a bounded retry budget with
/// exponential backoff. No operation blocks indefinitely: once the budget is
/// exhausted the run fails with a reported `TransientIo` error.
pub async fn with_backoff<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, String>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                warn!(
                    "attempt {}/{} of `{}` failed: {}",
                    attempt, attempts, what, e
                );
                last_error = e;
                if attempt < attempts {
                    let delay = policy.base_delay_ms.saturating_mul(1 << (attempt - 1));
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
            }
        }
    }

    Err(RefineryError::TransientIo {
        attempts,
        detail: format!("`{}`: {}", what, last_error),
    })
}

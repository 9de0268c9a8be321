//! Retry helper for critical writes.
//!
//! Workflow status and lifecycle transition rows must not be lost to a
//! transient backend hiccup; those call sites retry with exponential backoff
//! before giving up with the original error.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Maximum attempts for a critical write.
pub const CRITICAL_WRITE_ATTEMPTS: u32 = 3;

/// Base delay doubled on each retry.
const BASE_DELAY: Duration = Duration::from_millis(50);

/// Run `op` up to [`CRITICAL_WRITE_ATTEMPTS`] times with exponential backoff.
///
/// Returns the first success, or the error from the final attempt.
pub async fn retry_critical<T, E, F, Fut>(label: &str, mut op: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut delay = BASE_DELAY;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < CRITICAL_WRITE_ATTEMPTS => {
                warn!(%err, attempt, "critical write '{label}' failed, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = retry_critical("test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("transient".to_string())
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_with_final_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = retry_critical("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("down".to_string()) }
        })
        .await;
        assert_eq!(result.unwrap_err(), "down");
        assert_eq!(calls.load(Ordering::SeqCst), CRITICAL_WRITE_ATTEMPTS);
    }
}

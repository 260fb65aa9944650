//! Bounded exponential backoff for connection attempts.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::ChannelError;

/// Retry policy: `initial * 2^(attempt - 1)`, capped at `max_delay`, for at
/// most `max_attempts` tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl Backoff {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails with a non-connection error, or the
    /// attempts run out. Returns the last error and the attempts used.
    pub async fn retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, (u32, ChannelError)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ChannelError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_connection() && attempt < max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        error = %e,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "{what} failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err((attempt, e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_doubles_and_caps() {
        let backoff = Backoff {
            initial: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            max_attempts: 10,
        };
        assert_eq!(backoff.delay_for(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(400));
        assert_eq!(backoff.delay_for(4), Duration::from_millis(500));
        assert_eq!(backoff.delay_for(40), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_transient_failures() {
        let calls = &AtomicU32::new(0);
        let result = Backoff::default()
            .retry("connect", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ChannelError::Connection("refused".into()))
                } else {
                    Ok("connected")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "connected");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_max_attempts() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), _> = Backoff::default()
            .with_max_attempts(3)
            .retry("connect", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ChannelError::Connection("refused".into()))
            })
            .await;

        let (attempts, err) = result.unwrap_err();
        assert_eq!(attempts, 3);
        assert!(err.is_connection());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_does_not_retry_other_errors() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), _> = Backoff::default()
            .retry("consume", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ChannelError::Consumer {
                    queue: "metadata".into(),
                    reason: "bad config".into(),
                })
            })
            .await;

        assert_eq!(result.unwrap_err().0, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

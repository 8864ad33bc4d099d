//! Exponential backoff around fallible peer calls

use crate::config::RetryConfig;
use crate::error::Result;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Delay before retry number `retry` (0-based), capped and jittered
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.config.base_delay_ms as f64 * self.config.multiplier.powi(retry as i32);
        let capped = base.min(self.config.max_delay_ms as f64);
        let jitter = if self.config.jitter > 0.0 {
            capped * self.config.jitter * (rand::random::<f64>() - 0.5)
        } else {
            0.0
        };
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    /// The last error is returned when every attempt failed.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.config.max_attempts.max(1);
        let mut retry = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && retry + 1 < attempts => {
                    let delay = self.delay_for(retry);
                    debug!(
                        %label,
                        attempt = retry + 1,
                        ?delay,
                        error = %err,
                        "Retrying after transient failure"
                    );
                    metrics::counter!("concord_sync_retries_total").increment(1);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    retry += 1;
                }
                Err(err) => {
                    if err.is_transient() {
                        warn!(%label, attempts, error = %err, "Giving up after retries");
                    }
                    return Err(err);
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use concord_consensus::AgentId;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn unreachable() -> SyncError {
        SyncError::Unreachable {
            agent: AgentId::from("peer"),
            reason: "offline".into(),
        }
    }

    #[test]
    fn test_delay_growth_is_capped() {
        let policy = RetryPolicy::new(RetryConfig {
            jitter: 0.0,
            ..RetryConfig::default()
        });
        assert_eq!(policy.delay_for(0), Duration::from_millis(50));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(10), Duration::from_millis(2_000));
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let policy = RetryPolicy::new(RetryConfig::immediate(3));
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let value = policy
            .run("push", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(unreachable())
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_bounded_attempts_and_permanent_errors() {
        let policy = RetryPolicy::new(RetryConfig::immediate(2));
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = policy
            .run::<(), _, _>("push", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(unreachable())
            })
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        calls.store(0, Ordering::SeqCst);
        let err = policy
            .run::<(), _, _>("push", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SyncError::Storage("disk".into()))
            })
            .await
            .unwrap_err();
        assert_eq!(err, SyncError::Storage("disk".into()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

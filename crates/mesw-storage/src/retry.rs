//! Deadlines and retries for warehouse work.
//!
//! Every storage call runs under [`bounded`]; a call that overruns surfaces as
//! `EtlError::Timeout`, and only those are retried by [`RetryPolicy`].

use std::future::Future;
use std::time::Duration;

use mesw_core::{EtlError, EtlResult};
use tracing::warn;

/// How often and how patiently a timed-out storage step is repeated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Repeats after the first attempt; zero disables retrying.
    pub max_retries: usize,
    /// Pause before the first repeat; each further repeat waits twice as long.
    pub initial_pause: Duration,
    pub pause_ceiling: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_pause: Duration::from_millis(250),
            pause_ceiling: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn with_retries(max_retries: usize) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Pause before repeat number `repeat`, counted from 1.
    pub fn pause_before(&self, repeat: usize) -> Duration {
        let doublings = repeat.saturating_sub(1).min(31) as u32;
        self.initial_pause
            .saturating_mul(1u32 << doublings)
            .min(self.pause_ceiling)
    }

    /// Run `step` until it succeeds, fails for a reason other than a timeout, or the
    /// repeats are used up. The last error is returned unchanged.
    pub async fn retry<T, F, Fut>(&self, step_name: &str, mut step: F) -> EtlResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = EtlResult<T>>,
    {
        let mut repeat = 0usize;
        loop {
            let err = match step().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !err.is_retryable() || repeat >= self.max_retries {
                return Err(err);
            }
            repeat += 1;
            let pause = self.pause_before(repeat);
            warn!(
                step = step_name,
                repeat,
                remaining = self.max_retries - repeat,
                ?pause,
                error = %err,
                "storage step timed out; repeating"
            );
            tokio::time::sleep(pause).await;
        }
    }
}

/// Bound a storage future so a stuck database surfaces as `Timeout` instead of hanging.
pub async fn bounded<T, Fut>(limit: Duration, operation: &str, fut: Fut) -> EtlResult<T>
where
    Fut: Future<Output = EtlResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(EtlError::Timeout {
            operation: operation.to_string(),
            elapsed_ms: limit.as_millis() as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn quick(max_retries: usize) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_pause: Duration::from_millis(1),
            pause_ceiling: Duration::from_millis(2),
        }
    }

    #[test]
    fn pauses_double_up_to_the_ceiling() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_pause: Duration::from_millis(100),
            pause_ceiling: Duration::from_millis(350),
        };
        let pauses: Vec<u64> = (1..=4).map(|n| policy.pause_before(n).as_millis() as u64).collect();
        assert_eq!(pauses, vec![100, 200, 350, 350]);
        assert_eq!(RetryPolicy::with_retries(7).max_retries, 7);
    }

    #[tokio::test]
    async fn timeouts_are_repeated_until_the_budget_is_spent() {
        let calls = AtomicUsize::new(0);
        let result: EtlResult<()> = quick(2)
            .retry("merging staged batch", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(EtlError::Timeout {
                        operation: "merging staged batch".into(),
                        elapsed_ms: 1,
                    })
                }
            })
            .await;
        assert!(matches!(result, Err(EtlError::Timeout { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn a_timeout_followed_by_success_recovers() {
        let calls = AtomicUsize::new(0);
        let result = quick(3)
            .retry("staging extract", || {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if call == 0 {
                        Err(EtlError::Timeout {
                            operation: "staging extract".into(),
                            elapsed_ms: 1,
                        })
                    } else {
                        Ok(call)
                    }
                }
            })
            .await;
        assert_eq!(result.expect("recovered"), 1);
    }

    #[tokio::test]
    async fn other_failures_are_not_repeated() {
        let calls = AtomicUsize::new(0);
        let result: EtlResult<()> = RetryPolicy::default()
            .retry("beginning import", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(EtlError::NotFound("state".into())) }
            })
            .await;
        assert!(matches!(result, Err(EtlError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn bounded_futures_surface_timeouts() {
        let result: EtlResult<()> = bounded(Duration::from_millis(5), "slow query", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        match result {
            Err(EtlError::Timeout { operation, .. }) => assert_eq!(operation, "slow query"),
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}

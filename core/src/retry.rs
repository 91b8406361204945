use crate::config::RetryConfig;
use crate::error::{Error, Result};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

/// Exponential backoff without jitter:
/// `delay(n) = min(max_backoff, initial_backoff * multiplier^(n - 1))`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.backoff_multiplier,
            attempt_timeout: Duration::from_secs(config.attempt_timeout_secs),
        }
    }

    /// A fresh schedule. The n-th `next_backoff()` is the delay after failed
    /// attempt n. Attempt counting is ours, so the schedule never expires.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.initial_backoff,
            initial_interval: self.initial_backoff,
            randomization_factor: 0.0,
            multiplier: self.multiplier,
            max_interval: self.max_backoff,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }

    /// Delay before the attempt following failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let mut backoff = self.backoff();
        let mut delay = self.initial_backoff;
        for _ in 0..attempt.max(1) {
            delay = backoff.next_backoff().unwrap_or(self.max_backoff);
        }
        delay
    }

    /// `attempt` is the number of attempts already made, including the one that
    /// produced `error`.
    pub fn decide(&self, attempt: u32, error: &Error) -> RetryDecision {
        let mut backoff = self.backoff();
        for _ in 1..attempt {
            backoff.next_backoff();
        }
        self.decide_next(attempt, error, &mut backoff)
    }

    /// Same as [`decide`](Self::decide), drawing the delay from a schedule that
    /// has already produced one delay per earlier retry.
    pub fn decide_next(
        &self,
        attempt: u32,
        error: &Error,
        backoff: &mut ExponentialBackoff,
    ) -> RetryDecision {
        if error.is_cancelled() || !error.is_retryable() || attempt >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        match backoff.next_backoff() {
            Some(delay) => RetryDecision::RetryAfter(delay),
            None => RetryDecision::GiveUp,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Run `operation` until it succeeds or the policy gives up.
///
/// Each attempt is bounded by `policy.attempt_timeout`; the backoff sleep ends
/// early with [`Error::Cancelled`] when `cancel` fires. The closure receives the
/// 1-based attempt number. Only the final error is returned.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = policy.backoff();
    let mut attempt = 0;

    loop {
        attempt += 1;

        let outcome = match tokio::time::timeout(policy.attempt_timeout, operation(attempt)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::Timeout {
                operation: operation_name.to_string(),
                after_ms: policy.attempt_timeout.as_millis() as u64,
            }),
        };

        let e = match outcome {
            Ok(result) => {
                if attempt > 1 {
                    debug!(
                        operation = operation_name,
                        attempts = attempt,
                        "Operation succeeded after retries"
                    );
                }
                return Ok(result);
            }
            Err(e) => e,
        };

        match policy.decide_next(attempt, &e, &mut backoff) {
            RetryDecision::GiveUp => {
                if e.is_retryable() {
                    warn!(
                        operation = operation_name,
                        attempts = attempt,
                        error = %e,
                        "Operation failed after max attempts"
                    );
                }
                return Err(e);
            }
            RetryDecision::RetryAfter(delay) => {
                metrics::counter!("shipper_retries_total", "operation" => operation_name.to_string())
                    .increment(1);
                debug!(
                    operation = operation_name,
                    attempt,
                    retry_after_ms = delay.as_millis() as u64,
                    error = %e,
                    "Operation failed, retrying"
                );

                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn policy(max_attempts: u32, initial_secs: u64, max_secs: u64) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_secs(initial_secs),
            max_backoff: Duration::from_secs(max_secs),
            multiplier: 2.0,
            attempt_timeout: Duration::from_secs(60),
        }
    }

    #[test]
    fn decide_backs_off_exponentially_then_gives_up() {
        let policy = policy(3, 1, 10);
        let err = Error::storage("b", "503");

        assert_eq!(
            policy.decide(1, &err),
            RetryDecision::RetryAfter(Duration::from_secs(1))
        );
        assert_eq!(
            policy.decide(2, &err),
            RetryDecision::RetryAfter(Duration::from_secs(2))
        );
        assert_eq!(policy.decide(3, &err), RetryDecision::GiveUp);
    }

    #[test]
    fn decide_caps_at_max_backoff() {
        let policy = policy(10, 1, 3);
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(3));
        assert_eq!(policy.delay(9), Duration::from_secs(3));
    }

    #[test]
    fn running_schedule_matches_attempt_indexed_delays() {
        let policy = policy(10, 1, 3);
        let mut backoff = policy.backoff();

        let drawn: Vec<Duration> = (0..5).filter_map(|_| backoff.next_backoff()).collect();
        let indexed: Vec<Duration> = (1..=5).map(|n| policy.delay(n)).collect();

        assert_eq!(
            drawn,
            [1, 2, 3, 3, 3].map(Duration::from_secs).to_vec()
        );
        assert_eq!(drawn, indexed);

        let err = Error::storage("b", "503");
        let mut running = policy.backoff();
        assert_eq!(
            policy.decide_next(1, &err, &mut running),
            RetryDecision::RetryAfter(Duration::from_secs(1))
        );
        assert_eq!(
            policy.decide_next(2, &err, &mut running),
            policy.decide(2, &err)
        );
    }

    #[test]
    fn decide_never_retries_terminal_errors() {
        let policy = policy(5, 1, 10);
        assert_eq!(
            policy.decide(1, &Error::decode("b/o", "bad json")),
            RetryDecision::GiveUp
        );
        assert_eq!(policy.decide(1, &Error::Cancelled), RetryDecision::GiveUp);
    }

    proptest! {
        #[test]
        fn delay_is_monotonic_and_bounded(
            initial_ms in 1u64..5_000,
            extra_ms in 0u64..60_000,
            multiplier in 1.0f64..4.0,
            attempt in 1u32..64,
        ) {
            let policy = RetryPolicy {
                max_attempts: 100,
                initial_backoff: Duration::from_millis(initial_ms),
                max_backoff: Duration::from_millis(initial_ms + extra_ms),
                multiplier,
                attempt_timeout: Duration::from_secs(1),
            };
            let current = policy.delay(attempt);
            prop_assert!(current <= policy.max_backoff);
            prop_assert!(policy.delay(attempt + 1) >= current);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_max_attempts_with_expected_delays() {
        let policy = policy(3, 1, 10);
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let start = Instant::now();

        let result: Result<()> = retry_with_backoff(&policy, "open", &CancellationToken::new(), |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::storage("b", "connection reset")) }
        })
        .await;

        assert!(matches!(result, Err(Error::Storage { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 1s after the first failure, 2s after the second.
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let policy = policy(5, 1, 10);

        let result = retry_with_backoff(&policy, "list", &CancellationToken::new(), |attempt| async move {
            if attempt < 3 {
                Err(Error::storage("b", "throttled"))
            } else {
                Ok(attempt)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_timeout_counts_as_transient() {
        let mut policy = policy(2, 1, 1);
        policy.attempt_timeout = Duration::from_secs(5);

        let result = retry_with_backoff(&policy, "open", &CancellationToken::new(), |attempt| async move {
            if attempt == 1 {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Ok(attempt)
        })
        .await;

        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let policy = policy(5, 60, 60);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let result: Result<()> = retry_with_backoff(&policy, "list", &cancel, |_| async {
            Err(Error::storage("b", "503"))
        })
        .await;

        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(60));
    }
}

//! Bounded retry with exponential backoff around an [`Evaluator`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use sweep_types::{Configuration, EvaluationError, EvaluationResult, SimulationResult};
use tracing::{debug, warn};

use crate::evaluator::Evaluator;

/// Retry policy for transient evaluation failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt; the call is made at most
    /// `max_retries + 1` times.
    pub max_retries: u32,
    /// Delay before the first retry; doubled for each further retry.
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Each attempt that runs longer than this counts as transient.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            attempt_timeout: Duration::from_secs(30 * 60),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Backoff before retry number `retry` (1-based): `base * 2^(retry-1)`,
    /// capped at `max_delay`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// The wait before retry number `retry`, never shorter than the
    /// backend's own hint.
    pub fn delay_for(&self, retry: u32, hint: Option<Duration>) -> Duration {
        let backoff = self.backoff(retry);
        hint.map_or(backoff, |h| backoff.max(h))
    }
}

/// Wraps an evaluator with per-attempt timeouts and retries on
/// [`EvaluationError::Transient`]. Permanent failures pass straight through.
///
/// Once the retry budget is spent the call fails with a transient error
/// whose message is `retries exhausted`.
#[derive(Debug, Clone)]
pub struct RetryingEvaluator<E> {
    inner: E,
    policy: RetryPolicy,
}

impl<E: Evaluator> RetryingEvaluator<E> {
    pub fn new(inner: E, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn attempt(&self, configuration: &Configuration) -> EvaluationResult<SimulationResult> {
        match tokio::time::timeout(self.policy.attempt_timeout, self.inner.evaluate(configuration))
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(EvaluationError::transient(format!(
                "attempt timed out after {:?}",
                self.policy.attempt_timeout
            ))),
        }
    }
}

#[async_trait]
impl<E: Evaluator> Evaluator for RetryingEvaluator<E> {
    async fn evaluate(&self, configuration: &Configuration) -> EvaluationResult<SimulationResult> {
        let mut retry = 0u32;
        loop {
            match self.attempt(configuration).await {
                Ok(result) => {
                    if retry > 0 {
                        debug!(retries = retry, configuration = %configuration, "evaluation recovered");
                    }
                    return Ok(result);
                }
                Err(EvaluationError::Transient {
                    message,
                    retry_after,
                }) => {
                    if retry >= self.policy.max_retries {
                        warn!(
                            configuration = %configuration,
                            attempts = retry + 1,
                            last_error = %message,
                            "giving up after transient failures"
                        );
                        return Err(EvaluationError::transient("retries exhausted"));
                    }
                    retry += 1;
                    let delay = self.policy.delay_for(retry, retry_after);
                    warn!(
                        configuration = %configuration,
                        attempt = retry,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "transient evaluation failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(permanent) => return Err(permanent),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use sweep_types::InSampleStats;
    use tokio::time::Instant;

    /// Replays a fixed script of outcomes, then succeeds forever.
    struct Scripted {
        script: Mutex<VecDeque<EvaluationResult<SimulationResult>>>,
        calls: AtomicUsize,
        hang: bool,
    }

    impl Scripted {
        fn new(script: Vec<EvaluationResult<SimulationResult>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
                hang: false,
            }
        }

        fn hanging() -> Self {
            Self {
                hang: true,
                ..Self::new(Vec::new())
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn ok() -> SimulationResult {
        SimulationResult {
            id: "alpha".into(),
            insample: InSampleStats::default(),
        }
    }

    #[async_trait]
    impl Evaluator for Scripted {
        async fn evaluate(&self, _: &Configuration) -> EvaluationResult<SimulationResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok(ok()))
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::default()
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.backoff(1), Duration::from_secs(1));
        assert_eq!(p.backoff(2), Duration::from_secs(2));
        assert_eq!(p.backoff(5), Duration::from_secs(16));
        assert_eq!(p.backoff(12), Duration::from_secs(60));
        assert_eq!(p.backoff(40), Duration::from_secs(60));
    }

    #[test]
    fn hint_sets_minimum_wait() {
        let p = policy();
        assert_eq!(
            p.delay_for(1, Some(Duration::from_secs(7))),
            Duration::from_secs(7)
        );
        assert_eq!(
            p.delay_for(3, Some(Duration::from_millis(500))),
            Duration::from_secs(4)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_then_succeeds() {
        let inner = Scripted::new(vec![
            Err(EvaluationError::transient("429")),
            Err(EvaluationError::transient("503")),
        ]);
        let evaluator = RetryingEvaluator::new(inner, policy());

        let start = Instant::now();
        let result = evaluator.evaluate(&Configuration::new()).await;
        assert!(result.is_ok());
        assert_eq!(evaluator.inner.calls(), 3);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn honours_retry_after_hint() {
        let inner = Scripted::new(vec![Err(EvaluationError::Transient {
            message: "rate limited".into(),
            retry_after: Some(Duration::from_secs(10)),
        })]);
        let evaluator = RetryingEvaluator::new(inner, policy());

        let start = Instant::now();
        evaluator.evaluate(&Configuration::new()).await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(10) && elapsed < Duration::from_secs(11));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_retries() {
        let script = (0..10)
            .map(|_| Err(EvaluationError::transient("503")))
            .collect();
        let evaluator = RetryingEvaluator::new(Scripted::new(script), policy());

        let err = evaluator
            .evaluate(&Configuration::new())
            .await
            .unwrap_err();
        assert_eq!(err, EvaluationError::transient("retries exhausted"));
        assert_eq!(evaluator.inner.calls(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_is_not_retried() {
        let inner = Scripted::new(vec![Err(EvaluationError::permanent("401 unauthorized"))]);
        let evaluator = RetryingEvaluator::new(inner, policy());

        let err = evaluator
            .evaluate(&Configuration::new())
            .await
            .unwrap_err();
        assert_eq!(err, EvaluationError::permanent("401 unauthorized"));
        assert_eq!(evaluator.inner.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_count_as_transient() {
        let evaluator = RetryingEvaluator::new(
            Scripted::hanging(),
            policy()
                .with_max_retries(1)
                .with_attempt_timeout(Duration::from_secs(5)),
        );

        let err = evaluator
            .evaluate(&Configuration::new())
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(evaluator.inner.calls(), 2);
    }
}

//! Retry/backoff policy for control-plane calls.
//!
//! Server faults and throttling are retried with capped exponential backoff
//! plus jitter. Throttled calls start from a much higher floor but stop
//! growing earlier.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use stratus_common::Image;

use crate::{ControlPlane, ProviderError};

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Base delay (ms) for ordinary retryable failures.
pub const BASE_DELAY_MS: u64 = 30;
/// Base delay (ms) once the control plane asks us to slow down.
pub const THROTTLE_BASE_DELAY_MS: u64 = 1000;
pub const MAX_EXPONENT: u32 = 13;
pub const THROTTLE_MAX_EXPONENT: u32 = 8;
/// Jitter is drawn from `0..=MAX_JITTER_MS`.
pub const MAX_JITTER_MS: u32 = 29;

/// What the retry policy gets to see of a failed call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallOutcome {
    pub status: Option<u16>,
    pub retryable: bool,
    pub throttled: bool,
}

impl CallOutcome {
    pub fn from_error(err: &ProviderError) -> Self {
        Self {
            status: err.status(),
            retryable: err.is_retryable(),
            throttled: err.is_throttle(),
        }
    }

    pub fn is_throttle(&self) -> bool {
        matches!(self.status, Some(502 | 503 | 504)) || self.throttled
    }

    pub fn is_server_fault(&self) -> bool {
        matches!(self.status, Some(s) if s >= 500)
    }
}

/// Source of backoff jitter. Injected so delays are reproducible in tests.
pub trait JitterSource: Send + Sync {
    /// Uniform integer in `0..=upper`.
    fn jitter(&self, upper: u32) -> u32;
}

pub struct RandomJitter {
    rng: Mutex<StdRng>,
}

impl RandomJitter {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for RandomJitter {
    fn default() -> Self {
        Self::new()
    }
}

impl JitterSource for RandomJitter {
    fn jitter(&self, upper: u32) -> u32 {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        rng.gen_range(0..=upper)
    }
}

/// Always returns the same value (clamped to `upper`).
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedJitter(pub u32);

impl JitterSource for FixedJitter {
    fn jitter(&self, upper: u32) -> u32 {
        self.0.min(upper)
    }
}

#[derive(Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    jitter: Arc<dyn JitterSource>,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, jitter: Arc<dyn JitterSource>) -> Self {
        Self {
            max_retries,
            jitter,
        }
    }

    pub fn with_max_retries(max_retries: u32) -> Self {
        Self::new(max_retries, Arc::new(RandomJitter::new()))
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn should_retry(&self, outcome: &CallOutcome) -> bool {
        if outcome.is_server_fault() {
            return true;
        }
        outcome.retryable || outcome.is_throttle()
    }

    /// Delay before retry number `attempt` (0 = first retry).
    pub fn next_delay(&self, outcome: &CallOutcome, attempt: u32) -> Duration {
        let (base, cap) = if outcome.is_throttle() {
            (THROTTLE_BASE_DELAY_MS, THROTTLE_MAX_EXPONENT)
        } else {
            (BASE_DELAY_MS, MAX_EXPONENT)
        };
        let exponent = attempt.min(cap);
        let jitter = u64::from(self.jitter.jitter(MAX_JITTER_MS));
        Duration::from_millis((1u64 << exponent) * (jitter + base))
    }

    /// Runs `call` until it succeeds, fails permanently, or the retry budget
    /// is spent. The last error is returned unchanged.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &'static str,
        mut call: F,
    ) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 0;
        loop {
            let err = match call().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            let outcome = CallOutcome::from_error(&err);
            if !self.should_retry(&outcome) {
                return Err(err);
            }
            if attempt >= self.max_retries {
                tracing::warn!(
                    operation,
                    retries = attempt,
                    error = %err,
                    "control-plane call exhausted its retries"
                );
                return Err(err);
            }
            let delay = self.next_delay(&outcome, attempt);
            tracing::warn!(
                operation,
                attempt = attempt + 1,
                throttled = outcome.is_throttle(),
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "control-plane call failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::with_max_retries(DEFAULT_MAX_RETRIES)
    }
}

/// Routes every call of the wrapped control plane through a [`RetryPolicy`].
pub struct RetryingControlPlane {
    inner: Arc<dyn ControlPlane>,
    policy: Arc<RetryPolicy>,
}

impl RetryingControlPlane {
    pub fn new(inner: Arc<dyn ControlPlane>, policy: Arc<RetryPolicy>) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl ControlPlane for RetryingControlPlane {
    async fn lookup_image(&self, image_id: &str) -> Result<Image, ProviderError> {
        let inner = &self.inner;
        self.policy
            .run("lookup_image", move || inner.lookup_image(image_id))
            .await
    }

    async fn create_instances(
        &self,
        image_id: &str,
        count: u32,
        user_data: &str,
    ) -> Result<Vec<String>, ProviderError> {
        let inner = &self.inner;
        self.policy
            .run("create_instances", move || {
                inner.create_instances(image_id, count, user_data)
            })
            .await
    }

    async fn terminate_instance(&self, instance_id: &str) -> Result<(), ProviderError> {
        let inner = &self.inner;
        self.policy
            .run("terminate_instance", move || inner.terminate_instance(instance_id))
            .await
    }

    async fn stop_instance(&self, instance_id: &str) -> Result<(), ProviderError> {
        let inner = &self.inner;
        self.policy
            .run("stop_instance", move || inner.stop_instance(instance_id))
            .await
    }

    async fn start_instance(&self, instance_id: &str) -> Result<(), ProviderError> {
        let inner = &self.inner;
        self.policy
            .run("start_instance", move || inner.start_instance(instance_id))
            .await
    }

    async fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        mount_point: &str,
    ) -> Result<(), ProviderError> {
        let inner = &self.inner;
        self.policy
            .run("attach_volume", move || {
                inner.attach_volume(volume_id, instance_id, mount_point)
            })
            .await
    }

    async fn create_tags(
        &self,
        resource_id: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), ProviderError> {
        let inner = &self.inner;
        self.policy
            .run("create_tags", move || inner.create_tags(resource_id, tags))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_retries: u32, jitter: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Arc::new(FixedJitter(jitter)))
    }

    fn http(status: u16) -> CallOutcome {
        CallOutcome {
            status: Some(status),
            ..CallOutcome::default()
        }
    }

    #[test]
    fn throttle_classification() {
        for status in [502, 503, 504] {
            assert!(http(status).is_throttle(), "{status} should throttle");
        }
        assert!(!http(500).is_throttle());
        assert!(!http(429).is_throttle());
        let flagged = CallOutcome {
            status: Some(400),
            throttled: true,
            ..CallOutcome::default()
        };
        assert!(flagged.is_throttle());
    }

    #[test]
    fn retry_eligibility() {
        let p = policy(3, 0);
        assert!(p.should_retry(&http(500)));
        assert!(p.should_retry(&http(501)));
        assert!(p.should_retry(&http(503)));
        assert!(!p.should_retry(&http(400)));
        assert!(!p.should_retry(&http(404)));
        assert!(!p.should_retry(&CallOutcome::default()));
        assert!(p.should_retry(&CallOutcome {
            retryable: true,
            ..CallOutcome::default()
        }));
        assert!(p.should_retry(&CallOutcome {
            throttled: true,
            ..CallOutcome::default()
        }));
    }

    #[test]
    fn outcome_from_provider_errors() {
        let o = CallOutcome::from_error(&ProviderError::Throttled("slow down".into()));
        assert!(o.throttled && o.is_throttle());
        let o = CallOutcome::from_error(&ProviderError::Transport("reset".into()));
        assert!(o.retryable && !o.is_throttle());
        let o = CallOutcome::from_error(&ProviderError::NotFound("ami".into()));
        assert_eq!(o, CallOutcome::default());
    }

    #[test]
    fn delay_uses_base_and_cap() {
        let p = policy(3, 7);
        // 2^0 * (7 + 30)
        assert_eq!(p.next_delay(&http(500), 0), Duration::from_millis(37));
        assert_eq!(p.next_delay(&http(500), 3), Duration::from_millis(8 * 37));
        assert_eq!(
            p.next_delay(&http(500), 40),
            Duration::from_millis((1 << 13) * 37)
        );
        // throttled: 2^1 * (7 + 1000)
        assert_eq!(p.next_delay(&http(503), 1), Duration::from_millis(2 * 1007));
        assert_eq!(
            p.next_delay(&http(503), 9),
            Duration::from_millis((1 << 8) * 1007)
        );
    }

    #[test]
    fn delay_is_monotonic_and_bounded() {
        let p = RetryPolicy::new(3, Arc::new(RandomJitter::seeded(42)));
        for (outcome, base, cap) in [
            (http(500), BASE_DELAY_MS, MAX_EXPONENT),
            (http(502), THROTTLE_BASE_DELAY_MS, THROTTLE_MAX_EXPONENT),
        ] {
            let bound = Duration::from_millis((1u64 << cap) * (u64::from(MAX_JITTER_MS) + base));
            let mut previous = Duration::ZERO;
            for attempt in 0..=cap {
                let delay = p.next_delay(&outcome, attempt);
                assert!(delay >= previous, "attempt {attempt}: {delay:?} < {previous:?}");
                assert!(delay <= bound);
                previous = delay;
            }
            for attempt in cap..cap + 10 {
                assert!(p.next_delay(&outcome, attempt) <= bound);
            }
        }
    }

    #[test]
    fn random_jitter_stays_in_range() {
        let jitter = RandomJitter::seeded(7);
        for _ in 0..1000 {
            assert!(jitter.jitter(MAX_JITTER_MS) <= MAX_JITTER_MS);
        }
        assert_eq!(FixedJitter(100).jitter(MAX_JITTER_MS), MAX_JITTER_MS);
    }

    #[tokio::test(start_paused = true)]
    async fn run_retries_server_faults_until_success() {
        let p = policy(3, 0);
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let result = p
            .run("test", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ProviderError::Http {
                            status: 500,
                            message: "boom".into(),
                        })
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 30ms + 60ms of backoff
        assert!(started.elapsed() >= Duration::from_millis(90));
    }

    #[tokio::test(start_paused = true)]
    async fn run_gives_up_after_budget() {
        let p = policy(2, 0);
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = p
            .run("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::Throttled("slow down".into())) }
            })
            .await;
        assert_eq!(result, Err(ProviderError::Throttled("slow down".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn run_does_not_retry_permanent_errors() {
        let p = policy(5, 0);
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = p
            .run("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(ProviderError::Http {
                        status: 400,
                        message: "bad request".into(),
                    })
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

//! Exponential-backoff retry built at init and shared process-wide.

use std::time::{Duration, Instant};

use rand::Rng;

use crate::core::CancelToken;

const DEFAULT_MULTIPLIER: f64 = 2.0;
const JITTER_FRACTION: f64 = 0.2;

/// Retry schedule: exponential growth from `initial` up to `max`, with
/// ±20% jitter, giving up once `expiration` has elapsed.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    expiration: Option<Duration>,
}

impl RetryPolicy {
    pub fn exponential(initial: Duration) -> Self {
        Self {
            initial,
            max: initial.saturating_mul(64),
            multiplier: DEFAULT_MULTIPLIER,
            expiration: None,
        }
    }

    pub fn with_max_interval(mut self, max: Duration) -> Self {
        self.max = max;
        self
    }

    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    pub fn expiration(&self) -> Option<Duration> {
        self.expiration
    }

    /// Delay before retry number `attempt` (zero-based), jittered.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial.as_secs_f64() * self.multiplier.powi(attempt.min(63) as i32);
        let capped = base.min(self.max.as_secs_f64());
        let jitter = rand::rng().random_range(-JITTER_FRACTION..=JITTER_FRACTION);
        Duration::from_secs_f64((capped * (1.0 + jitter)).max(0.0))
    }
}

/// Run `op` until it succeeds, the error stops being retryable, the
/// policy expires, or `cancel` fires. The sleep between attempts is
/// cancellable; on cancellation the last error is returned.
pub fn retry<T, E>(
    policy: RetryPolicy,
    cancel: &CancelToken,
    mut is_retryable: impl FnMut(&E) -> bool,
    mut op: impl FnMut() -> Result<T, E>,
) -> Result<T, E> {
    let started = Instant::now();
    let mut attempt = 0u32;
    loop {
        let err = match op() {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if !is_retryable(&err) {
            return Err(err);
        }
        let delay = policy.delay_for(attempt);
        if let Some(expiration) = policy.expiration()
            && started.elapsed() + delay >= expiration
        {
            return Err(err);
        }
        if cancel.wait_timeout(delay) {
            return Err(err);
        }
        attempt += 1;
    }
}

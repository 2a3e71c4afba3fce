use std::{fmt::Display, future::Future, time::Duration};

use metrics::counter;
use rand::Rng;
use tracing::{debug, warn};

use crate::error::ResponseStatus;

/// Lower bound of the multiplicative jitter applied to retry delays.
pub const JITTER_MIN: f64 = 0.8;
/// Upper bound of the multiplicative jitter applied to retry delays.
pub const JITTER_MAX: f64 = 1.2;

#[derive(Clone, Debug, PartialEq)]
pub struct RetryOptions {
    /// Retries after the first attempt; the operation runs at most `max_retries + 1` times.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// When set, errors carrying a status outside this list are not retried.
    pub retryable_status_codes: Option<Vec<u16>>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(10_000),
            backoff_factor: 2.0,
            retryable_status_codes: None,
        }
    }
}

impl RetryOptions {
    pub fn with_retryable_status_codes(mut self, codes: impl Into<Vec<u16>>) -> Self {
        self.retryable_status_codes = Some(codes.into());
        self
    }

    /// Delay before retry `attempt` (0-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        exponential_delay(
            self.initial_delay,
            self.backoff_factor,
            attempt,
            self.max_delay,
        )
    }

    /// Whether `err` may be retried under these options.
    pub fn is_retryable<E: ResponseStatus>(&self, err: &E) -> bool {
        match (&self.retryable_status_codes, err.response_status()) {
            (Some(codes), Some(status)) => codes.contains(&status),
            _ => true,
        }
    }

    fn jittered_delay(&self, attempt: u32) -> Duration {
        let sample = rand::rng().random_range(0.0..=1.0);
        apply_jitter(self.base_delay(attempt), sample)
    }
}

/// `min(initial * factor^attempt, max)`, computed in whole milliseconds.
pub fn exponential_delay(
    initial: Duration,
    factor: f64,
    attempt: u32,
    max: Duration,
) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let scaled = initial.as_millis() as f64 * factor.powi(exponent);
    let max_ms = max.as_millis() as f64;
    if !scaled.is_finite() || scaled >= max_ms {
        return max;
    }
    if scaled <= 0.0 {
        return Duration::ZERO;
    }
    Duration::from_millis(scaled.round() as u64).min(max)
}

/// Scales `base` by a factor in `[JITTER_MIN, JITTER_MAX]`; `sample` is clamped to `[0, 1]`.
pub fn apply_jitter(base: Duration, sample: f64) -> Duration {
    let sample = if sample.is_nan() {
        0.5
    } else {
        sample.clamp(0.0, 1.0)
    };
    let factor = (JITTER_MIN + sample * (JITTER_MAX - JITTER_MIN)).clamp(JITTER_MIN, JITTER_MAX);
    base.mul_f64(factor)
}

/// Runs `operation` until it succeeds or the retry budget in `options` is spent.
///
/// The last error is returned unchanged once retries are exhausted or the
/// error carries a status that `options` does not list as retryable.
pub async fn with_retry<T, E, F, Fut>(mut operation: F, options: &RetryOptions) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: ResponseStatus + Display,
{
    let mut attempt: u32 = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(attempts = attempt + 1, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => {
                if !options.is_retryable(&err) {
                    debug!(
                        status = ?err.response_status(),
                        error = %err,
                        "non-retryable failure, giving up"
                    );
                    return Err(err);
                }
                if attempt >= options.max_retries {
                    warn!(attempts = attempt + 1, error = %err, "retry budget exhausted");
                    return Err(err);
                }
                let delay = options.jittered_delay(attempt);
                counter!("widget_retry_attempts_total").increment(1);
                debug!(attempt = attempt + 1, ?delay, error = %err, "retrying after failure");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::HttpStatusError;

    fn fast_options(max_retries: u32) -> RetryOptions {
        RetryOptions {
            max_retries,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
            backoff_factor: 2.0,
            retryable_status_codes: None,
        }
    }

    #[test]
    fn base_delay_grows_and_caps() {
        let options = fast_options(5);
        assert_eq!(options.base_delay(0), Duration::from_millis(100));
        assert_eq!(options.base_delay(3), Duration::from_millis(800));
        assert_eq!(options.base_delay(4), Duration::from_millis(1_000));
        assert_eq!(options.base_delay(40), Duration::from_millis(1_000));
    }

    #[test]
    fn base_delay_matches_formula_for_fractional_factor() {
        let options = RetryOptions {
            initial_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
            backoff_factor: 1.5,
            ..RetryOptions::default()
        };
        for attempt in 0..12u32 {
            let expected = (1_000.0 * 1.5f64.powi(attempt as i32)).min(30_000.0).round() as u64;
            assert_eq!(options.base_delay(attempt), Duration::from_millis(expected));
        }
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let options = fast_options(8);
        for attempt in 0..8 {
            let base = options.base_delay(attempt);
            let low = base.mul_f64(JITTER_MIN);
            let high = base.mul_f64(JITTER_MAX);
            for sample in [0.0, 0.1, 0.25, 0.5, 0.75, 0.9, 1.0, -3.0, 7.0] {
                let jittered = apply_jitter(base, sample);
                assert!(jittered >= low && jittered <= high, "{jittered:?} outside [{low:?}, {high:?}]");
            }
            for _ in 0..50 {
                let jittered = options.jittered_delay(attempt);
                assert!(jittered >= low && jittered <= high);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry(
            || async {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                if call < 2 {
                    Err(HttpStatusError::new(503, "busy"))
                } else {
                    Ok("done")
                }
            },
            &fast_options(3),
        )
        .await;
        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_retry_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(HttpStatusError::new(500, "boom"))
            },
            &fast_options(2),
        )
        .await;
        assert_eq!(result.unwrap_err().status, 500);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn unlisted_status_aborts_immediately() {
        let calls = AtomicU32::new(0);
        let options = fast_options(5).with_retryable_status_codes([429, 503]);
        let result: Result<(), _> = with_retry(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(HttpStatusError::new(401, "unauthorized"))
            },
            &options,
        )
        .await;
        assert_eq!(result.unwrap_err().status, 401);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn total_delay_is_bounded_by_jittered_schedule() {
        let options = fast_options(3);
        let started = tokio::time::Instant::now();
        let _: Result<(), _> = with_retry(
            || async { Err(HttpStatusError::new(502, "bad gateway")) },
            &options,
        )
        .await;
        let ceiling: Duration = (0..3).map(|i| options.base_delay(i).mul_f64(JITTER_MAX)).sum();
        assert!(started.elapsed() <= ceiling + Duration::from_millis(1));
    }
}

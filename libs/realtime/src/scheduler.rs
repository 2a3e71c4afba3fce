use std::{
    future::Future,
    sync::atomic::{AtomicBool, AtomicU32, Ordering},
    time::Duration,
};

use metrics::counter;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use widget_resilience::exponential_delay;

/// Backoff for re-establishing the realtime connection.
#[derive(Clone, Debug, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub backoff_factor: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
            max_attempts: 20,
            backoff_factor: 1.5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay slept before attempt `attempt` (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        exponential_delay(
            self.initial_delay,
            self.backoff_factor,
            attempt,
            self.max_delay,
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("reconnection gave up after {attempts} attempts")]
    Exhausted { attempts: u32 },
    #[error("reconnection stopped")]
    Stopped,
    #[error("a reconnection loop is already running")]
    AlreadyRunning,
}

/// Result of one reconnection attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttemptOutcome {
    Connected,
    Failed,
    /// Nothing was attempted (an open circuit refused the call); retry after
    /// the given delay without spending an attempt.
    Deferred(Duration),
}

impl From<bool> for AttemptOutcome {
    fn from(connected: bool) -> Self {
        if connected { Self::Connected } else { Self::Failed }
    }
}

/// Floor for deferred retries so a circuit about to half-open is not spun on.
const MIN_DEFERRAL: Duration = Duration::from_millis(100);

/// Runs one reconnection loop at a time.
#[derive(Debug)]
pub struct ReconnectionScheduler {
    policy: ReconnectPolicy,
    attempts: AtomicU32,
    running: AtomicBool,
    stop: watch::Sender<bool>,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl ReconnectionScheduler {
    pub fn new(policy: ReconnectPolicy) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            policy,
            attempts: AtomicU32::new(0),
            running: AtomicBool::new(false),
            stop,
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Attempts made by the current (or last failed) run.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Cancels the running loop, dropping its pending timer.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub async fn start<F, Fut>(&self, mut attempt_fn: F) -> Result<(), SchedulerError>
    where
        F: FnMut() -> Fut,
        Fut: Future,
        Fut::Output: Into<AttemptOutcome>,
    {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SchedulerError::AlreadyRunning);
        }
        let _guard = RunningGuard(&self.running);
        self.stop.send_replace(false);
        let mut stop = self.stop.subscribe();
        self.attempts.store(0, Ordering::SeqCst);
        let mut deferred: Option<Duration> = None;

        while self.attempts() < self.policy.max_attempts {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            let delay = deferred
                .take()
                .unwrap_or_else(|| self.policy.delay_for_attempt(attempt));
            debug!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "scheduling reconnect");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stopped(&mut stop) => {
                    info!("reconnection stopped");
                    return Err(SchedulerError::Stopped);
                }
            }

            counter!("widget_reconnect_attempts_total").increment(1);
            let outcome: AttemptOutcome = tokio::select! {
                outcome = attempt_fn() => outcome.into(),
                _ = stopped(&mut stop) => {
                    info!("reconnection stopped");
                    return Err(SchedulerError::Stopped);
                }
            };
            match outcome {
                AttemptOutcome::Connected => {
                    info!(attempt = attempt + 1, "reconnected");
                    self.attempts.store(0, Ordering::SeqCst);
                    return Ok(());
                }
                AttemptOutcome::Failed => {
                    warn!(attempt = attempt + 1, max = self.policy.max_attempts, "reconnect attempt failed");
                }
                AttemptOutcome::Deferred(retry_in) => {
                    self.attempts.fetch_sub(1, Ordering::SeqCst);
                    let retry_in = retry_in.max(MIN_DEFERRAL);
                    debug!(
                        attempt = attempt + 1,
                        retry_in_ms = retry_in.as_millis() as u64,
                        "reconnect deferred, attempt not counted"
                    );
                    deferred = Some(retry_in);
                }
            }
        }

        let attempts = self.attempts();
        warn!(attempts, "reconnection attempts exhausted");
        Err(SchedulerError::Exhausted { attempts })
    }
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    // a dropped sender counts as stopped
    let _ = stop.wait_for(|stopped| *stopped).await;
}

impl Default for ReconnectionScheduler {
    fn default() -> Self {
        Self::new(ReconnectPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::time::Instant;

    use super::*;

    fn policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts,
            ..ReconnectPolicy::default()
        }
    }

    #[test]
    fn delays_grow_by_factor_and_cap() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1_500));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2_250));
        assert_eq!(policy.delay_for_attempt(19), Duration::from_millis(30_000));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_third_attempt_and_resets_counter() {
        let scheduler = ReconnectionScheduler::new(policy(5));
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let result = scheduler
            .start(|| async { calls.fetch_add(1, Ordering::SeqCst) == 2 })
            .await;

        assert_eq!(result, Ok(()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.attempts(), 0);
        assert_eq!(started.elapsed(), Duration::from_millis(1_000 + 1_500 + 2_250));
        assert!(!scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_max_attempts() {
        let scheduler = ReconnectionScheduler::new(policy(3));
        let result = scheduler.start(|| async { false }).await;
        assert_eq!(result, Err(SchedulerError::Exhausted { attempts: 3 }));
    }

    #[tokio::test(start_paused = true)]
    async fn deferred_attempts_do_not_spend_the_budget() {
        let scheduler = ReconnectionScheduler::new(policy(2));
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let result = scheduler
            .start(|| async {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0..=2 => AttemptOutcome::Deferred(Duration::from_secs(5)),
                    _ => AttemptOutcome::Failed,
                }
            })
            .await;

        assert_eq!(result, Err(SchedulerError::Exhausted { attempts: 2 }));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(
            started.elapsed(),
            Duration::from_millis(1_000 + 3 * 5_000 + 1_500)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_pending_timer() {
        let scheduler = Arc::new(ReconnectionScheduler::new(policy(5)));
        let calls = Arc::new(AtomicU32::new(0));
        let task = {
            let scheduler = scheduler.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                scheduler
                    .start(|| {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            false
                        }
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(scheduler.is_running());
        assert_eq!(
            scheduler.start(|| async { true }).await,
            Err(SchedulerError::AlreadyRunning)
        );
        scheduler.stop();

        assert_eq!(task.await.unwrap(), Err(SchedulerError::Stopped));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!scheduler.is_running());
    }
}

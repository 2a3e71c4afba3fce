use std::{fmt::Display, future::Future, sync::Arc, time::Duration};

use dashmap::DashMap;
use metrics::counter;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    error::{ResilienceError, ResponseStatus},
    retry::{RetryOptions, with_retry},
};

#[derive(Clone, Debug, PartialEq)]
pub struct CircuitOptions {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub half_open_success_threshold: u32,
}

impl Default for CircuitOptions {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_success_threshold: 2,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Point-in-time copy of a named circuit.
#[derive(Clone, Debug, PartialEq)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure: Option<Instant>,
    pub successes_in_half_open: u32,
    pub options: CircuitOptions,
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    successes_in_half_open: u32,
    options: CircuitOptions,
}

impl Circuit {
    fn new(options: CircuitOptions) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure: None,
            successes_in_half_open: 0,
            options,
        }
    }

    /// Cool-down left while open; `None` once a half-open trial call may run.
    fn cooldown(&self, now: Instant) -> Option<Duration> {
        if self.state != CircuitState::Open {
            return None;
        }
        let elapsed = self
            .last_failure
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or(Duration::MAX);
        (elapsed <= self.options.reset_timeout).then(|| self.options.reset_timeout - elapsed)
    }

    /// Returns the remaining cool-down when the call must fail fast.
    fn admit(&mut self, name: &str, now: Instant) -> Result<(), Duration> {
        if self.state != CircuitState::Open {
            return Ok(());
        }
        if let Some(remaining) = self.cooldown(now) {
            return Err(remaining);
        }
        self.state = CircuitState::HalfOpen;
        self.successes_in_half_open = 0;
        info!(circuit = name, "circuit breaker half-open trial");
        record_transition(name, CircuitState::HalfOpen);
        Ok(())
    }

    fn on_success(&mut self, name: &str) {
        match self.state {
            CircuitState::Closed => {
                if self.failure_count > 0 {
                    debug!(
                        circuit = name,
                        failures = self.failure_count,
                        "resetting failure counter"
                    );
                }
                self.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                self.successes_in_half_open += 1;
                if self.successes_in_half_open >= self.options.half_open_success_threshold {
                    self.state = CircuitState::Closed;
                    self.failure_count = 0;
                    self.successes_in_half_open = 0;
                    info!(circuit = name, "circuit breaker closed");
                    record_transition(name, CircuitState::Closed);
                }
            }
            // Another call re-opened the circuit while this one was in flight.
            CircuitState::Open => {}
        }
    }

    fn on_failure(&mut self, name: &str, now: Instant) {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure = Some(now);
        match self.state {
            CircuitState::Closed => {
                if self.failure_count >= self.options.failure_threshold {
                    self.open(name);
                }
            }
            CircuitState::HalfOpen => self.open(name),
            CircuitState::Open => {}
        }
    }

    fn open(&mut self, name: &str) {
        self.state = CircuitState::Open;
        self.successes_in_half_open = 0;
        warn!(
            circuit = name,
            failures = self.failure_count,
            reopen_in = ?self.options.reset_timeout,
            "circuit breaker opened"
        );
        record_transition(name, CircuitState::Open);
    }

    fn snapshot(&self, name: &str) -> CircuitSnapshot {
        CircuitSnapshot {
            name: name.to_string(),
            state: self.state,
            failure_count: self.failure_count,
            last_failure: self.last_failure,
            successes_in_half_open: self.successes_in_half_open,
            options: self.options.clone(),
        }
    }
}

fn record_transition(name: &str, state: CircuitState) {
    counter!(
        "widget_circuit_events_total",
        "circuit" => name.to_string(),
        "state" => state.as_str(),
    )
    .increment(1);
}

/// Named circuit breakers, created lazily on first use.
///
/// Cloning shares the underlying circuits. Every state change happens inside
/// a single map-entry critical section, before or after the guarded future
/// is awaited, never across it.
#[derive(Clone, Default)]
pub struct CircuitRegistry {
    circuits: Arc<DashMap<String, Circuit>>,
}

impl CircuitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `operation` behind the circuit called `name`.
    ///
    /// `options` only apply when the circuit does not exist yet.
    pub async fn with_circuit_breaker<T, E, F, Fut>(
        &self,
        operation: F,
        name: &str,
        options: &CircuitOptions,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.guarded(operation, name, options, |_| true).await
    }

    /// Circuit breaker outermost, retries inside: an open circuit pre-empts
    /// every retry, and a fully retried call counts once against the circuit.
    ///
    /// Failures that stopped retrying because their status is not retryable
    /// leave the circuit untouched.
    pub async fn with_resilience<T, E, F, Fut>(
        &self,
        operation: F,
        name: &str,
        retry: Option<&RetryOptions>,
        circuit: Option<&CircuitOptions>,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ResponseStatus + Display,
    {
        let retry = retry.cloned().unwrap_or_default();
        let circuit = circuit.cloned().unwrap_or_default();
        self.guarded(
            || with_retry(operation, &retry),
            name,
            &circuit,
            |err| retry.is_retryable(err),
        )
        .await
    }

    /// Whether a call made now would fail fast. An open circuit whose reset
    /// timeout has passed reports `false` even before its next call moves it
    /// to half-open.
    pub fn is_circuit_open(&self, name: &str) -> bool {
        let now = Instant::now();
        self.circuits
            .get(name)
            .is_some_and(|circuit| circuit.cooldown(now).is_some())
    }

    pub fn reset_circuit(&self, name: &str) {
        if let Some(mut circuit) = self.circuits.get_mut(name) {
            let options = circuit.options.clone();
            *circuit = Circuit::new(options);
            info!(circuit = name, "circuit breaker reset");
        }
    }

    pub fn circuit_state(&self, name: &str) -> Option<CircuitSnapshot> {
        self.circuits.get(name).map(|circuit| circuit.snapshot(name))
    }

    async fn guarded<T, E, F, Fut, C>(
        &self,
        operation: F,
        name: &str,
        options: &CircuitOptions,
        counts_as_failure: C,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
    {
        self.admit(name, options)?;
        match operation().await {
            Ok(value) => {
                self.update(name, options, |circuit| circuit.on_success(name));
                Ok(value)
            }
            Err(err) => {
                if counts_as_failure(&err) {
                    let now = Instant::now();
                    self.update(name, options, |circuit| circuit.on_failure(name, now));
                } else {
                    debug!(circuit = name, "failure not counted against circuit");
                }
                Err(ResilienceError::Operation(err))
            }
        }
    }

    fn admit<E>(&self, name: &str, options: &CircuitOptions) -> Result<(), ResilienceError<E>> {
        let now = Instant::now();
        let mut circuit = self
            .circuits
            .entry(name.to_string())
            .or_insert_with(|| Circuit::new(options.clone()));
        circuit.admit(name, now).map_err(|retry_in| {
            debug!(circuit = name, ?retry_in, "circuit open, failing fast");
            ResilienceError::CircuitOpen {
                circuit: name.to_string(),
                retry_in,
            }
        })
    }

    fn update(&self, name: &str, options: &CircuitOptions, apply: impl FnOnce(&mut Circuit)) {
        let mut circuit = self
            .circuits
            .entry(name.to_string())
            .or_insert_with(|| Circuit::new(options.clone()));
        apply(&mut circuit);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::HttpStatusError;

    fn options(threshold: u32) -> CircuitOptions {
        CircuitOptions {
            failure_threshold: threshold,
            reset_timeout: Duration::from_secs(10),
            half_open_success_threshold: 1,
        }
    }

    async fn fail(registry: &CircuitRegistry, name: &str, opts: &CircuitOptions) {
        let _ = registry
            .with_circuit_breaker(
                || async { Err::<(), _>(HttpStatusError::new(500, "down")) },
                name,
                opts,
            )
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn opens_exactly_on_threshold() {
        let registry = CircuitRegistry::new();
        let opts = options(3);
        for expected in 1..3u32 {
            fail(&registry, "config", &opts).await;
            let state = registry.circuit_state("config").unwrap();
            assert_eq!(state.state, CircuitState::Closed);
            assert_eq!(state.failure_count, expected);
        }
        fail(&registry, "config", &opts).await;
        assert!(registry.is_circuit_open("config"));
    }

    #[tokio::test(start_paused = true)]
    async fn success_in_closed_resets_failures() {
        let registry = CircuitRegistry::new();
        let opts = options(3);
        fail(&registry, "message", &opts).await;
        fail(&registry, "message", &opts).await;
        registry
            .with_circuit_breaker(|| async { Ok::<_, HttpStatusError>(1) }, "message", &opts)
            .await
            .unwrap();
        assert_eq!(registry.circuit_state("message").unwrap().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_fails_fast_without_invoking() {
        let registry = CircuitRegistry::new();
        let opts = options(1);
        fail(&registry, "security", &opts).await;

        let calls = AtomicU32::new(0);
        let result = registry
            .with_circuit_breaker(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, HttpStatusError>(())
                },
                "security",
                &opts,
            )
            .await;
        assert!(matches!(result, Err(ResilienceError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_after_timeout_and_failure_reopens() {
        let registry = CircuitRegistry::new();
        let opts = options(1);
        fail(&registry, "config", &opts).await;
        let opened_at = registry.circuit_state("config").unwrap().last_failure.unwrap();

        // Exactly at the timeout the circuit is still open.
        tokio::time::advance(Duration::from_secs(10)).await;
        let result = registry
            .with_circuit_breaker(|| async { Ok::<_, HttpStatusError>(()) }, "config", &opts)
            .await;
        assert!(result.unwrap_err().is_circuit_open());

        tokio::time::advance(Duration::from_millis(1)).await;
        let observed = std::sync::Mutex::new(None);
        let _ = registry
            .with_circuit_breaker(
                || {
                    *observed.lock().unwrap() = registry.circuit_state("config").map(|s| s.state);
                    async { Err::<(), _>(HttpStatusError::new(503, "still down")) }
                },
                "config",
                &opts,
            )
            .await;
        assert_eq!(*observed.lock().unwrap(), Some(CircuitState::HalfOpen));

        let state = registry.circuit_state("config").unwrap();
        assert_eq!(state.state, CircuitState::Open);
        assert!(state.last_failure.unwrap() > opened_at);
    }

    #[tokio::test(start_paused = true)]
    async fn open_flag_clears_once_reset_timeout_passes() {
        let registry = CircuitRegistry::new();
        let opts = options(1);
        fail(&registry, "config", &opts).await;
        assert!(registry.is_circuit_open("config"));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(registry.is_circuit_open("config"));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(!registry.is_circuit_open("config"));
        assert_eq!(
            registry.circuit_state("config").unwrap().state,
            CircuitState::Open
        );
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_closes_after_success_threshold() {
        let registry = CircuitRegistry::new();
        let opts = CircuitOptions {
            half_open_success_threshold: 2,
            ..options(1)
        };
        fail(&registry, "config", &opts).await;
        tokio::time::advance(Duration::from_secs(11)).await;

        registry
            .with_circuit_breaker(|| async { Ok::<_, HttpStatusError>(()) }, "config", &opts)
            .await
            .unwrap();
        assert_eq!(
            registry.circuit_state("config").unwrap().state,
            CircuitState::HalfOpen
        );
        registry
            .with_circuit_breaker(|| async { Ok::<_, HttpStatusError>(()) }, "config", &opts)
            .await
            .unwrap();
        assert_eq!(
            registry.circuit_state("config").unwrap().state,
            CircuitState::Closed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reset_returns_circuit_to_closed() {
        let registry = CircuitRegistry::new();
        let opts = options(1);
        fail(&registry, "config", &opts).await;
        assert!(registry.is_circuit_open("config"));
        registry.reset_circuit("config");
        let state = registry.circuit_state("config").unwrap();
        assert_eq!(state.state, CircuitState::Closed);
        assert_eq!(state.failure_count, 0);
        assert_eq!(state.options, opts);
    }

    #[test]
    fn unknown_circuit_has_no_state() {
        let registry = CircuitRegistry::new();
        assert!(registry.circuit_state("missing").is_none());
        assert!(!registry.is_circuit_open("missing"));
        registry.reset_circuit("missing");
    }
}

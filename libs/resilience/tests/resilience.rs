use std::{
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

use widget_resilience::{
    CircuitOptions, CircuitRegistry, CircuitState, HttpStatusError, ResilienceError, RetryOptions,
};

fn retry_options(max_retries: u32) -> RetryOptions {
    RetryOptions {
        max_retries,
        initial_delay: Duration::from_millis(50),
        max_delay: Duration::from_millis(400),
        backoff_factor: 2.0,
        retryable_status_codes: None,
    }
}

fn circuit_options(failure_threshold: u32) -> CircuitOptions {
    CircuitOptions {
        failure_threshold,
        reset_timeout: Duration::from_secs(5),
        half_open_success_threshold: 1,
    }
}

#[tokio::test(start_paused = true)]
async fn transient_failures_recover_within_retry_budget() {
    let registry = CircuitRegistry::new();
    let calls = AtomicU32::new(0);

    let value = registry
        .with_resilience(
            || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(HttpStatusError::new(503, "warming up"))
                } else {
                    Ok("config-v2")
                }
            },
            "config",
            Some(&retry_options(3)),
            Some(&circuit_options(5)),
        )
        .await
        .expect("third attempt succeeds");

    assert_eq!(value, "config-v2");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let state = registry.circuit_state("config").expect("circuit exists");
    assert_eq!(state.state, CircuitState::Closed);
    assert_eq!(state.failure_count, 0);
}

#[tokio::test(start_paused = true)]
#[tracing_test::traced_test]
async fn repeated_failures_open_circuit_and_shed_load() {
    let registry = CircuitRegistry::new();
    let calls = AtomicU32::new(0);
    let retry = retry_options(1);
    let circuit = circuit_options(3);

    for _ in 0..3 {
        let result: Result<(), _> = registry
            .with_resilience(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(HttpStatusError::new(500, "down"))
                },
                "message",
                Some(&retry),
                Some(&circuit),
            )
            .await;
        assert!(matches!(result, Err(ResilienceError::Operation(_))));
    }
    // Each independent call spent its full retry budget.
    assert_eq!(calls.load(Ordering::SeqCst), 6);
    assert!(registry.is_circuit_open("message"));

    for _ in 0..4 {
        let result: Result<(), _> = registry
            .with_resilience(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(HttpStatusError::new(500, "down"))
                },
                "message",
                Some(&retry),
                Some(&circuit),
            )
            .await;
        assert!(result.unwrap_err().is_circuit_open());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 6);

    tokio::time::advance(Duration::from_secs(6)).await;
    let value = registry
        .with_resilience(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, HttpStatusError>(7)
            },
            "message",
            Some(&retry),
            Some(&circuit),
        )
        .await
        .expect("trial call is admitted after reset timeout");
    assert_eq!(value, 7);
    assert_eq!(calls.load(Ordering::SeqCst), 7);
    assert_eq!(
        registry.circuit_state("message").unwrap().state,
        CircuitState::Closed
    );
    assert!(logs_contain("circuit breaker opened"));
    assert!(logs_contain("circuit breaker closed"));
}

#[tokio::test(start_paused = true)]
async fn non_retryable_status_does_not_count_against_circuit() {
    let registry = CircuitRegistry::new();
    let calls = AtomicU32::new(0);
    let retry = retry_options(3).with_retryable_status_codes([408, 429, 500, 502, 503, 504]);
    let circuit = circuit_options(2);

    for _ in 0..5 {
        let result: Result<(), _> = registry
            .with_resilience(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(HttpStatusError::new(403, "forbidden"))
                },
                "security",
                Some(&retry),
                Some(&circuit),
            )
            .await;
        let err = result.unwrap_err().into_operation().expect("operation error");
        assert_eq!(err.status, 403);
    }

    // One attempt per call, and the circuit never moved.
    assert_eq!(calls.load(Ordering::SeqCst), 5);
    let state = registry.circuit_state("security").unwrap();
    assert_eq!(state.state, CircuitState::Closed);
    assert_eq!(state.failure_count, 0);
}

#[tokio::test(start_paused = true)]
async fn circuits_are_isolated_by_name_and_registry() {
    let first = CircuitRegistry::new();
    let second = CircuitRegistry::new();
    let circuit = circuit_options(1);

    let _: Result<(), _> = first
        .with_circuit_breaker(
            || async { Err(HttpStatusError::new(500, "down")) },
            "config",
            &circuit,
        )
        .await;

    assert!(first.is_circuit_open("config"));
    assert!(!first.is_circuit_open("message"));
    assert!(!second.is_circuit_open("config"));
    assert!(first.clone().is_circuit_open("config"));
}

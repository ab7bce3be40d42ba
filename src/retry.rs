//! Retry manager: bounded attempts with exponential backoff and jitter.
//!
//! Before every attempt the manager consults the circuit breaker; failures
//! are branched on [`StageOutcome`] data, never on error downcasting.
//! Backoff sleeps are tokio sleeps local to the calling flow's task — a
//! retrying flow never stalls its neighbors.

use crate::config::RetryPolicy;
use crate::error::{FlowError, Result};
use crate::events::EventOutcome;
use crate::executor::StageOutcome;
use crate::stage::Stage;
use crate::state::FlowControlState;
use rand::Rng;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Exponential backoff for a 1-indexed attempt, capped at the policy max.
#[must_use]
pub fn calculate_backoff(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(63);
    let factor = policy.multiplier.powi(exponent as i32);
    let delay_ms = (policy.base_delay_ms as f64 * factor).min(policy.max_delay_ms as f64);
    Duration::from_millis(delay_ms as u64)
}

/// Scale a delay by a random factor in `1 ± jitter`.
///
/// Jitter desynchronizes retry storms when several flows hit the same
/// failing dependency at once.
#[must_use]
pub fn with_jitter(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return delay;
    }
    let factor = rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter);
    delay.mul_f64(factor)
}

/// Drives attempts for one stage under one retry policy.
#[derive(Debug, Clone)]
pub struct RetryManager {
    policy: RetryPolicy,
}

impl RetryManager {
    /// Create a manager for the given policy.
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Run `attempt_fn` until it succeeds, fails fatally, or attempts run out.
    ///
    /// Contract:
    /// - A disallowed first attempt fails fast with [`FlowError::CircuitOpen`]
    ///   — nothing is invoked and no delay is incurred.
    /// - A disallow after at least one real attempt consumes an attempt
    ///   without delay; exhaustion then surfaces [`FlowError::RetriesExhausted`]
    ///   carrying the circuit-open detail.
    /// - `Err` from `attempt_fn` is structural (loop detected, emergency
    ///   stop, flow timeout) and propagates immediately, never retried.
    /// - [`StageOutcome::FatalFailure`] propagates immediately as
    ///   [`FlowError::StageFailed`].
    pub async fn execute_with_retry<F, Fut>(
        &self,
        state: &FlowControlState,
        stage: Stage,
        mut attempt_fn: F,
    ) -> Result<Value>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<StageOutcome>>,
    {
        let max_attempts = self.policy.max_attempts;
        let mut last_error = String::from("no attempts were made");
        let mut any_invoked = false;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                state.bump_retry(stage);
            }

            if !state.breaker_allow(stage) {
                let remaining_ms = state.breaker_cooldown_remaining_ms(stage);
                state.record_event(
                    format!("retry_blocked:{}", stage),
                    stage,
                    0,
                    EventOutcome::Blocked,
                );
                if !any_invoked {
                    return Err(FlowError::CircuitOpen {
                        stage,
                        cooldown_remaining_ms: remaining_ms,
                    });
                }
                debug!(stage = %stage, attempt, "attempt refused by open circuit");
                last_error = format!("circuit open ({}ms of cooldown remaining)", remaining_ms);
                continue;
            }

            any_invoked = true;
            match attempt_fn(attempt).await? {
                StageOutcome::Success(output) => {
                    state.record_stage_success(stage);
                    return Ok(output);
                }
                StageOutcome::FatalFailure { message } => {
                    state.record_stage_failure(stage);
                    return Err(FlowError::stage_failed(stage, message));
                }
                StageOutcome::RetryableFailure { message } => {
                    state.record_stage_failure(stage);
                    debug!(stage = %stage, attempt, error = %message, "retryable failure");
                    last_error = message;
                    if attempt < max_attempts {
                        let delay =
                            with_jitter(calculate_backoff(&self.policy, attempt), self.policy.jitter);
                        debug!(stage = %stage, delay_ms = delay.as_millis() as u64, "backing off");
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(FlowError::RetriesExhausted {
            stage,
            attempts: max_attempts,
            last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BreakerPolicy, FlowConfig};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 1000,
            jitter: 0.0,
        }
    }

    fn state_with_threshold(threshold: u32) -> FlowControlState {
        FlowControlState::new(&FlowConfig {
            breaker: BreakerPolicy {
                failure_threshold: threshold,
                cooldown_secs: 60,
            },
            ..FlowConfig::default()
        })
    }

    #[test]
    fn test_backoff_curve_monotone_and_capped() {
        let p = policy(10);
        let mut prev = Duration::ZERO;
        for attempt in 1..=8 {
            let delay = calculate_backoff(&p, attempt);
            assert!(delay >= prev, "backoff decreased at attempt {}", attempt);
            assert!(delay <= Duration::from_millis(p.max_delay_ms));
            prev = delay;
        }
        assert_eq!(calculate_backoff(&p, 1), Duration::from_millis(100));
        assert_eq!(calculate_backoff(&p, 2), Duration::from_millis(200));
        assert_eq!(calculate_backoff(&p, 8), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let base = Duration::from_millis(1000);
        for _ in 0..100 {
            let jittered = with_jitter(base, 0.1);
            assert!(jittered >= Duration::from_millis(900));
            assert!(jittered <= Duration::from_millis(1100));
        }
        assert_eq!(with_jitter(base, 0.0), base);
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_runs_exactly_max_attempts() {
        let state = state_with_threshold(100);
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let result = RetryManager::new(policy(3))
            .execute_with_retry(&state, Stage::Draft, |_| {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(StageOutcome::retryable("still broken"))
                }
            })
            .await;

        assert!(matches!(
            result,
            Err(FlowError::RetriesExhausted { attempts: 3, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(state.retry_count(Stage::Draft), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_failures_resets_breaker() {
        let state = state_with_threshold(3);
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let result = RetryManager::new(policy(3))
            .execute_with_retry(&state, Stage::Draft, |_| {
                let calls = Arc::clone(&calls_clone);
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Ok(StageOutcome::retryable("transient"))
                    } else {
                        Ok(StageOutcome::success(json!({"draft": "done"})))
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), json!({"draft": "done"}));
        assert_eq!(state.retry_count(Stage::Draft), 2);
        // Success resets the consecutive failure count: breaker stays closed.
        assert!(state.breaker_allow(Stage::Draft));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_failure_skips_retries() {
        let state = state_with_threshold(100);
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let result = RetryManager::new(policy(5))
            .execute_with_retry(&state, Stage::Validate, |_| {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(StageOutcome::fatal("topic is empty"))
                }
            })
            .await;

        assert!(matches!(result, Err(FlowError::StageFailed { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_consumes_attempts_without_invoking() {
        // Threshold 3, 5 attempts: the breaker opens on the third failure,
        // so attempts 4 and 5 are refused without running or sleeping.
        let state = state_with_threshold(3);
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let started = tokio::time::Instant::now();
        let result = RetryManager::new(policy(5))
            .execute_with_retry(&state, Stage::Style, |_| {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(StageOutcome::retryable("style service down"))
                }
            })
            .await;

        match result {
            Err(FlowError::RetriesExhausted { attempts, last_error, .. }) => {
                assert_eq!(attempts, 5);
                assert!(last_error.contains("circuit open"));
            }
            other => panic!("expected RetriesExhausted, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // The three real attempts backed off 100 + 200 + 400ms. The blocked
        // attempts added no delay on top of that.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(700));
        assert!(elapsed < Duration::from_millis(800));
    }

    #[tokio::test]
    async fn test_preopened_circuit_fails_fast() {
        let state = state_with_threshold(1);
        state.record_stage_failure(Stage::Quality);

        let result = RetryManager::new(policy(3))
            .execute_with_retry(&state, Stage::Quality, |_| async {
                panic!("must not be invoked");
                #[allow(unreachable_code)]
                Ok(StageOutcome::retryable(""))
            })
            .await;

        assert!(matches!(result, Err(FlowError::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn test_structural_error_propagates_immediately() {
        let state = state_with_threshold(100);
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let result = RetryManager::new(policy(5))
            .execute_with_retry(&state, Stage::Draft, |_| {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(FlowError::loop_detected("critical_risk", "runaway"))
                }
            })
            .await;

        assert!(matches!(result, Err(FlowError::LoopDetected { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

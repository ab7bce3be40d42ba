//! The stage manager: end-to-end orchestration of one flow.
//!
//! Drives the fixed linear sequence (validate → research → audience →
//! draft → style → quality) and consults every control subsystem around
//! each stage call:
//!
//! 1. Execution guards check the flow's time budget.
//! 2. Loop prevention checks the blocklist and risk level.
//! 3. The retry manager (which consults the circuit breaker) drives
//!    attempts of the external stage executor, each wrapped in the guard.
//! 4. Every attempt is recorded into the flow control state.
//!
//! The result is always terminal: `Completed` with output or `Failed` with
//! a structured reason and the full audit trail. No exception ever escapes
//! this boundary in a shape callers cannot introspect.

use crate::config::FlowConfig;
use crate::error::{FlowError, Result};
use crate::events::EventOutcome;
use crate::executor::{StageContext, StageExecutor, StageOutcome};
use crate::guard::{ExecutionGuard, ResourceProbe};
use crate::retry::RetryManager;
use crate::stage::Stage;
use crate::state::{AuditTrail, FlowControlState, HealthReport};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};
use uuid::Uuid;

/// Terminal result of one flow execution.
#[derive(Debug)]
pub struct FlowResult {
    /// Unique id of the flow execution.
    pub flow_id: Uuid,
    /// Terminal stage: `Completed` or `Failed`.
    pub final_stage: Stage,
    /// Final pipeline output, present iff the flow completed.
    pub output: Option<Value>,
    /// Structured failure reason, present iff the flow failed.
    pub error: Option<FlowError>,
    /// Full audit trail for diagnosis without re-running.
    pub audit_trail: AuditTrail,
}

impl FlowResult {
    /// True if the flow reached `Completed`.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.final_stage == Stage::Completed
    }
}

/// Orchestrator for one flow execution.
///
/// Owns the control state, guard, and configuration; the stage executor is
/// an injected collaborator. One manager drives exactly one flow and is
/// consumed by [`run`](Self::run); concurrent flows are independent
/// manager instances with no shared mutable state.
pub struct StageManager {
    config: FlowConfig,
    state: Arc<FlowControlState>,
    guard: ExecutionGuard,
    executor: Arc<dyn StageExecutor>,
}

impl StageManager {
    /// Create a manager, validating the configuration up front.
    pub fn new(config: FlowConfig, executor: Arc<dyn StageExecutor>) -> Result<Self> {
        config.validate()?;
        let state = Arc::new(FlowControlState::new(&config));
        let guard = ExecutionGuard::new(config.guards.clone());
        Ok(Self {
            config,
            state,
            guard,
            executor,
        })
    }

    /// Replace the guard's resource probe (used by tests and embedders with
    /// their own sampling).
    #[must_use]
    pub fn with_resource_probe(mut self, probe: Box<dyn ResourceProbe>) -> Self {
        self.guard = ExecutionGuard::with_probe(self.config.guards.clone(), probe);
        self
    }

    /// Shared handle to the flow control state, e.g. for concurrent health
    /// monitoring while the flow runs.
    #[must_use]
    pub fn state(&self) -> Arc<FlowControlState> {
        Arc::clone(&self.state)
    }

    /// Snapshot of flow health.
    #[must_use]
    pub fn health_report(&self) -> HealthReport {
        self.state.health_report()
    }

    /// Run the flow to a terminal stage.
    ///
    /// Each stage's output becomes the next stage's input. Consumes the
    /// manager: a flow runs exactly once.
    pub async fn run(self, initial_input: Value) -> FlowResult {
        info!(flow = %self.state.flow_id(), "flow starting");
        let mut payload = initial_input;

        for stage in Stage::pipeline() {
            match self.run_stage(stage, &payload).await {
                Ok(output) => {
                    payload = output;
                    let next = match stage.successor() {
                        Ok(next) => next,
                        Err(e) => return self.finish_failed(e),
                    };
                    if let Err(e) = self.state.transition(next) {
                        return self.finish_failed(e);
                    }
                }
                Err(e) => return self.finish_failed(e),
            }
        }

        info!(flow = %self.state.flow_id(), "flow completed");
        FlowResult {
            flow_id: self.state.flow_id(),
            final_stage: self.state.current_stage(),
            output: Some(payload),
            error: None,
            audit_trail: self.state.audit_trail(),
        }
    }

    async fn run_stage(&self, stage: Stage, input: &Value) -> Result<Value> {
        self.guard.check_flow_deadline()?;
        self.state.check_not_blocked(stage)?;

        let method = format!("execute_stage:{}", stage);
        self.state.check_method_allowed(&method)?;

        let retry = RetryManager::new(self.config.retry_policy(stage).clone());
        let ctx = StageContext::new(Arc::clone(&self.state), stage);

        let guard = &self.guard;
        let state = self.state.as_ref();
        let executor = self.executor.as_ref();
        let ctx = &ctx;
        let method = method.as_str();

        retry
            .execute_with_retry(state, stage, |_attempt| async move {
                let started = Instant::now();
                let result = guard.guard(stage, executor.execute(stage, input, ctx)).await;
                let duration_ms = started.elapsed().as_millis() as u64;

                let outcome = match result {
                    Ok(outcome) => {
                        let event_outcome = if outcome.is_success() {
                            EventOutcome::Success
                        } else {
                            EventOutcome::Failure
                        };
                        state.record_event(method, stage, duration_ms, event_outcome);
                        outcome
                    }
                    Err(violation @ FlowError::Timeout { .. }) => {
                        state.record_event(method, stage, duration_ms, EventOutcome::Timeout);
                        StageOutcome::retryable(violation.to_string())
                    }
                    Err(violation @ FlowError::ResourceExceeded { .. }) => {
                        state.record_event(
                            method,
                            stage,
                            duration_ms,
                            EventOutcome::ResourceViolation,
                        );
                        StageOutcome::retryable(violation.to_string())
                    }
                    // Flow timeout and other guard-level errors are structural.
                    Err(e) => return Err(e),
                };

                // The detector may have gone critical during the attempt
                // (runaway executor callbacks); prevention takes precedence
                // over whatever the executor returned.
                if let Some(reason) = state.emergency_stop_reason() {
                    return Err(FlowError::loop_detected("emergency_stop", reason));
                }
                Ok(outcome)
            })
            .await
    }

    fn finish_failed(&self, err: FlowError) -> FlowResult {
        error!(flow = %self.state.flow_id(), error = %err, "flow failed");
        // If the flow is already terminal this is a no-op; the original
        // error still wins.
        let _ = self.state.fail(err.to_string());
        FlowResult {
            flow_id: self.state.flow_id(),
            final_stage: self.state.current_stage(),
            output: None,
            error: Some(err),
            audit_trail: self.state.audit_trail(),
        }
    }
}

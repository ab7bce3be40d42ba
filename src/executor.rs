//! The stage executor collaborator interface.
//!
//! The orchestrator treats stage execution as opaque: one callable per
//! stage, success or failure, nothing else. Executors return a tagged
//! [`StageOutcome`] instead of throwing — the retry manager branches on
//! data, never on exception taxonomy.
//!
//! [`StageContext`] is the executor's line back into the control system:
//! any internal call an executor makes can be announced via
//! [`StageContext::enter`], which feeds the loop prevention detector. A
//! runaway executor that hammers `enter` gets cut off with `LoopDetected`
//! mid-stage rather than at the next stage boundary.

use crate::error::{FlowError, Result};
use crate::events::EventOutcome;
use crate::stage::Stage;
use crate::state::FlowControlState;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Tagged result of one stage attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// Stage produced its output.
    Success(Value),
    /// Stage failed in a way worth retrying (transient upstream error).
    RetryableFailure { message: String },
    /// Stage failed in a way retries cannot fix (invalid input, contract
    /// violation). Propagates immediately.
    FatalFailure { message: String },
}

impl StageOutcome {
    /// Successful outcome carrying the stage output.
    #[must_use]
    pub fn success(output: Value) -> Self {
        Self::Success(output)
    }

    /// Transient failure.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::RetryableFailure {
            message: message.into(),
        }
    }

    /// Non-retryable failure.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::FatalFailure {
            message: message.into(),
        }
    }

    /// True for the success variant.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// Per-stage handle handed to executors for call bookkeeping.
#[derive(Debug, Clone)]
pub struct StageContext {
    state: Arc<FlowControlState>,
    stage: Stage,
}

impl StageContext {
    /// Create a context bound to one stage of one flow.
    #[must_use]
    pub fn new(state: Arc<FlowControlState>, stage: Stage) -> Self {
        Self { state, stage }
    }

    /// The stage this context is bound to.
    #[must_use]
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Announce an executor-internal call.
    ///
    /// Records an execution event and reassesses loop risk synchronously.
    /// Fails with [`FlowError::LoopDetected`] once the detector goes
    /// CRITICAL or the method has been blocked by an earlier emergency
    /// stop; a well-behaved executor propagates that error as a fatal
    /// outcome.
    pub fn enter(&self, method: &str) -> Result<()> {
        self.state.check_method_allowed(method)?;
        let assessment = self
            .state
            .record_event(method, self.stage, 0, EventOutcome::Success);
        if assessment.level.is_critical() {
            let detail = assessment
                .patterns
                .first()
                .map(std::string::ToString::to_string)
                .unwrap_or_else(|| "critical loop risk".to_string());
            return Err(FlowError::loop_detected("critical_risk", detail));
        }
        Ok(())
    }
}

/// One callable per stage; opaque to the orchestrator.
///
/// Implementations may be LLM calls, HTTP services, or test scripts; the
/// orchestrator only requires the success/failure distinction.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Execute a stage against its input, producing output or a failure.
    async fn execute(&self, stage: Stage, input: &Value, ctx: &StageContext) -> StageOutcome;
}

//! Custom error types for flowguard.
//!
//! Every failure the flow controller can surface is a variant here, so
//! callers can branch on structured data instead of parsing messages.
//! The taxonomy separates transient stage failures (absorbed by the retry
//! manager) from structural failures (which always terminate the flow).

use crate::stage::Stage;
use thiserror::Error;

/// Main error type for flow execution control.
#[derive(Error, Debug)]
pub enum FlowError {
    // =========================================================================
    // Stage Graph Errors
    // =========================================================================
    /// Attempted a transition the stage graph does not allow.
    #[error("Invalid transition from {from} to {to}: {reason}")]
    InvalidTransition {
        from: Stage,
        to: Stage,
        reason: String,
    },

    // =========================================================================
    // Circuit Breaker / Retry Errors
    // =========================================================================
    /// Stage is temporarily disabled by its circuit breaker.
    #[error("Circuit breaker open for stage {stage} ({cooldown_remaining_ms}ms of cooldown remaining)")]
    CircuitOpen {
        stage: Stage,
        cooldown_remaining_ms: u64,
    },

    /// Stage failed on every allowed attempt.
    #[error("Stage {stage} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        stage: Stage,
        attempts: u32,
        last_error: String,
    },

    /// Stage executor reported a failure that must not be retried.
    #[error("Stage {stage} failed fatally: {message}")]
    StageFailed { stage: Stage, message: String },

    // =========================================================================
    // Guard Violations
    // =========================================================================
    /// A single stage call exceeded its wall-clock budget.
    #[error("Stage {stage} timed out after {elapsed_ms}ms (limit {limit_ms}ms)")]
    Timeout {
        stage: Stage,
        elapsed_ms: u64,
        limit_ms: u64,
    },

    /// The whole flow exceeded its wall-clock budget.
    #[error("Flow exceeded total time budget: {elapsed_ms}ms (limit {limit_ms}ms)")]
    FlowTimeout { elapsed_ms: u64, limit_ms: u64 },

    /// Process resource usage crossed a configured threshold during a stage call.
    #[error("Resource limit exceeded during stage {stage}: {resource} at {observed:.1} (limit {limit:.1})")]
    ResourceExceeded {
        stage: Stage,
        resource: String,
        observed: f64,
        limit: f64,
    },

    // =========================================================================
    // Loop Prevention Errors
    // =========================================================================
    /// The loop detector found a runaway execution pattern.
    #[error("Loop detected ({pattern}): {detail}")]
    LoopDetected { pattern: String, detail: String },

    /// The flow was irreversibly terminated by the loop prevention system.
    #[error("Emergency stop: {reason}")]
    EmergencyStop { reason: String },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// A configuration field failed validation at flow start.
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfig { field: String, reason: String },
}

impl FlowError {
    /// Create an invalid-transition error.
    pub fn invalid_transition(from: Stage, to: Stage, reason: impl Into<String>) -> Self {
        Self::InvalidTransition {
            from,
            to,
            reason: reason.into(),
        }
    }

    /// Create a fatal stage failure.
    pub fn stage_failed(stage: Stage, message: impl Into<String>) -> Self {
        Self::StageFailed {
            stage,
            message: message.into(),
        }
    }

    /// Create a loop-detected error.
    pub fn loop_detected(pattern: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::LoopDetected {
            pattern: pattern.into(),
            detail: detail.into(),
        }
    }

    /// Create an invalid-config error.
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Check if this error may be retried by the retry manager.
    ///
    /// Guard violations are terminal for the current attempt but the stage
    /// itself may still be retried, subject to circuit breaker policy.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::ResourceExceeded { .. })
    }

    /// Check if this error always terminates the flow, regardless of retry
    /// policy.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidTransition { .. }
                | Self::LoopDetected { .. }
                | Self::EmergencyStop { .. }
                | Self::InvalidConfig { .. }
                | Self::FlowTimeout { .. }
        )
    }

    /// Short machine-readable label for audit records.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::StageFailed { .. } => "stage_failed",
            Self::Timeout { .. } => "timeout",
            Self::FlowTimeout { .. } => "flow_timeout",
            Self::ResourceExceeded { .. } => "resource_exceeded",
            Self::LoopDetected { .. } => "loop_detected",
            Self::EmergencyStop { .. } => "emergency_stop",
            Self::InvalidConfig { .. } => "invalid_config",
        }
    }
}

/// Convenience Result type for flowguard operations.
pub type Result<T> = std::result::Result<T, FlowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let timeout = FlowError::Timeout {
            stage: Stage::Draft,
            elapsed_ms: 1000,
            limit_ms: 500,
        };
        assert!(timeout.is_retryable());
        assert!(!timeout.is_fatal());

        let loop_err = FlowError::loop_detected("method_repetition", "execute_stage x12");
        assert!(!loop_err.is_retryable());
        assert!(loop_err.is_fatal());
    }

    #[test]
    fn test_fatal_classification() {
        let invalid = FlowError::invalid_transition(Stage::Draft, Stage::Validate, "backwards");
        assert!(invalid.is_fatal());

        let exhausted = FlowError::RetriesExhausted {
            stage: Stage::Style,
            attempts: 3,
            last_error: "boom".to_string(),
        };
        assert!(!exhausted.is_fatal());
        assert!(!exhausted.is_retryable());
    }

    #[test]
    fn test_error_kind_labels() {
        let err = FlowError::CircuitOpen {
            stage: Stage::Quality,
            cooldown_remaining_ms: 1500,
        };
        assert_eq!(err.kind(), "circuit_open");
        assert!(err.to_string().contains("quality"));
    }
}

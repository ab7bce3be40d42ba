//! Thread-safe, per-flow mutable state.
//!
//! [`FlowControlState`] is the single aggregation point the other
//! subsystems report into and read from: current stage, transition history,
//! retry counters, the execution event log, the circuit breaker, and the
//! loop prevention detector all live behind one mutex. Exactly one instance
//! exists per running flow; there are no process-wide singletons, so
//! concurrent flows never share mutable state.
//!
//! The lock is held only for short bookkeeping operations. Stage execution
//! itself (the long-blocking part) always runs outside the lock.

use crate::breaker::{BreakerSnapshot, CircuitBreaker};
use crate::config::FlowConfig;
use crate::error::{FlowError, Result};
use crate::events::{EventLog, EventOutcome, ExecutionEvent};
use crate::prevention::{LoopPreventionSystem, LoopRiskAssessment, RiskLevel};
use crate::stage::Stage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{info, warn};
use uuid::Uuid;

/// Immutable record of one attempted stage transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// Unique record id.
    pub id: Uuid,
    /// Stage the flow moved from.
    pub from: Stage,
    /// Stage the flow moved to.
    pub to: Stage,
    /// When the transition happened.
    pub at: DateTime<Utc>,
    /// Whether this transition represents forward progress (false only for
    /// the transition into `Failed`).
    pub success: bool,
    /// Error summary attached to a failure transition.
    pub error: Option<String>,
}

/// Read-only snapshot of flow health, safe to take while the flow runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Flow this report describes.
    pub flow_id: Uuid,
    /// Stage the flow is currently in.
    pub current_stage: Stage,
    /// Per-stage fraction of successful invocations.
    pub success_rate_per_stage: HashMap<Stage, f64>,
    /// Most recent loop risk level.
    pub risk_level: RiskLevel,
    /// Circuit breaker snapshots for every stage that has been attempted.
    pub circuit_breakers: HashMap<Stage, BreakerSnapshot>,
    /// Retries consumed per stage.
    pub retry_counts: HashMap<Stage, u32>,
    /// Transitions retained in history.
    pub transition_count: usize,
    /// Events retained in the log.
    pub event_count: usize,
    /// When the snapshot was taken.
    pub generated_at: DateTime<Utc>,
}

/// Full audit output: everything needed to diagnose a flow without re-running.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditTrail {
    /// Transition history, oldest first.
    pub transitions: Vec<TransitionRecord>,
    /// Execution events, oldest first.
    pub events: Vec<ExecutionEvent>,
}

/// All mutable flow state, guarded by the one lock in [`FlowControlState`].
#[derive(Debug)]
struct FlowInner {
    current: Stage,
    history: VecDeque<TransitionRecord>,
    max_history: usize,
    /// Every stage that has appeared as a transition target.
    visited: HashSet<Stage>,
    /// Stages the flow has successfully moved past.
    completed: HashSet<Stage>,
    retry_counts: HashMap<Stage, u32>,
    events: EventLog,
    breaker: CircuitBreaker,
    prevention: LoopPreventionSystem,
    risk_level: RiskLevel,
}

/// Thread-safe control state for one flow execution.
#[derive(Debug)]
pub struct FlowControlState {
    flow_id: Uuid,
    inner: Mutex<FlowInner>,
}

impl FlowControlState {
    /// Create the state for a new flow, starting at `Validate`.
    #[must_use]
    pub fn new(config: &FlowConfig) -> Self {
        Self {
            flow_id: Uuid::new_v4(),
            inner: Mutex::new(FlowInner {
                current: Stage::Validate,
                history: VecDeque::new(),
                max_history: config.max_history,
                visited: HashSet::new(),
                completed: HashSet::new(),
                retry_counts: HashMap::new(),
                events: EventLog::new(config.max_events),
                breaker: CircuitBreaker::new(config.breaker.clone()),
                prevention: LoopPreventionSystem::new(config.loop_thresholds.clone()),
                risk_level: RiskLevel::Low,
            }),
        }
    }

    /// Unique id of this flow execution.
    #[must_use]
    pub fn flow_id(&self) -> Uuid {
        self.flow_id
    }

    fn lock(&self) -> MutexGuard<'_, FlowInner> {
        // A poisoned lock means a panic mid-bookkeeping; the records are
        // append-only, so continuing with the inner value is sound.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stage the flow is currently in.
    #[must_use]
    pub fn current_stage(&self) -> Stage {
        self.lock().current
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Move the flow to `to`, recording a successful transition.
    ///
    /// Validates both the stage graph (single successor, `Failed` from
    /// anywhere) and the linear-progression invariant: a stage that already
    /// appeared in this run's history can never be a target again.
    pub fn transition(&self, to: Stage) -> Result<TransitionRecord> {
        self.transition_inner(to, true, None)
    }

    /// Move the flow to `Failed`, attaching the terminal error summary.
    pub fn fail(&self, error_summary: impl Into<String>) -> Result<TransitionRecord> {
        self.transition_inner(Stage::Failed, false, Some(error_summary.into()))
    }

    fn transition_inner(
        &self,
        to: Stage,
        success: bool,
        error: Option<String>,
    ) -> Result<TransitionRecord> {
        let mut inner = self.lock();
        let from = inner.current;
        if !from.can_transition_to(to) {
            return Err(FlowError::invalid_transition(
                from,
                to,
                "not the successor stage",
            ));
        }
        if inner.visited.contains(&to) {
            return Err(FlowError::invalid_transition(
                from,
                to,
                "stage already visited in this run",
            ));
        }

        let record = TransitionRecord {
            id: Uuid::new_v4(),
            from,
            to,
            at: Utc::now(),
            success,
            error,
        };
        if inner.history.len() == inner.max_history {
            inner.history.pop_front();
        }
        inner.history.push_back(record.clone());
        inner.visited.insert(to);
        if to != Stage::Failed {
            // Moving forward means `from` finished its work.
            inner.completed.insert(from);
        }
        inner.current = to;
        info!(flow = %self.flow_id, from = %from, to = %to, success, "stage transition");
        Ok(record)
    }

    // =========================================================================
    // Events and loop prevention
    // =========================================================================

    /// Append an execution event and synchronously reassess loop risk.
    ///
    /// On a CRITICAL assessment the emergency stop fires before this method
    /// returns: the implicated method/stage is blocked for the rest of the
    /// run and the flow is marked stopped.
    pub fn record_event(
        &self,
        method: impl Into<String>,
        stage: Stage,
        duration_ms: u64,
        outcome: EventOutcome,
    ) -> LoopRiskAssessment {
        let mut inner = self.lock();
        inner
            .events
            .record(ExecutionEvent::new(method, stage, duration_ms, outcome));
        let assessment = inner.prevention.assess(&inner.events, &inner.completed);
        inner.risk_level = assessment.level;
        if assessment.level.requires_intervention() {
            warn!(
                flow = %self.flow_id,
                level = %assessment.level,
                "elevated loop risk"
            );
        }
        if assessment.level.is_critical() {
            let reason = assessment
                .patterns
                .first()
                .map(|p| p.to_string())
                .unwrap_or_else(|| "critical loop risk".to_string());
            inner.prevention.emergency_stop(&assessment.patterns, reason);
        }
        assessment
    }

    /// Fail fast if the flow was emergency-stopped or the stage is blocked.
    pub fn check_not_blocked(&self, stage: Stage) -> Result<()> {
        let inner = self.lock();
        if inner.prevention.is_stage_blocked(stage) {
            return Err(FlowError::loop_detected(
                "blocked_stage",
                format!("stage {} blocked by emergency stop", stage),
            ));
        }
        if let Some(reason) = inner.prevention.stop_reason() {
            return Err(FlowError::EmergencyStop {
                reason: reason.to_string(),
            });
        }
        Ok(())
    }

    /// Fail fast if a method was blocked by an emergency stop.
    pub fn check_method_allowed(&self, method: &str) -> Result<()> {
        let inner = self.lock();
        if inner.prevention.is_method_blocked(method) {
            return Err(FlowError::loop_detected(
                "blocked_method",
                format!("method {} blocked by emergency stop", method),
            ));
        }
        Ok(())
    }

    /// True once the emergency stop has fired.
    #[must_use]
    pub fn is_emergency_stopped(&self) -> bool {
        self.lock().prevention.is_stopped()
    }

    /// Reason for the emergency stop, if one fired.
    #[must_use]
    pub fn emergency_stop_reason(&self) -> Option<String> {
        self.lock().prevention.stop_reason().map(str::to_string)
    }

    // =========================================================================
    // Circuit breaker pass-throughs
    // =========================================================================

    /// Ask the circuit breaker whether this stage may be attempted.
    pub fn breaker_allow(&self, stage: Stage) -> bool {
        self.lock().breaker.allow(stage)
    }

    /// Remaining cooldown for an open stage breaker, in milliseconds.
    #[must_use]
    pub fn breaker_cooldown_remaining_ms(&self, stage: Stage) -> u64 {
        self.lock().breaker.cooldown_remaining_ms(stage)
    }

    /// Record a successful stage attempt with the breaker.
    pub fn record_stage_success(&self, stage: Stage) {
        self.lock().breaker.record_success(stage);
    }

    /// Record a failed stage attempt with the breaker.
    pub fn record_stage_failure(&self, stage: Stage) {
        self.lock().breaker.record_failure(stage);
    }

    // =========================================================================
    // Retry counters
    // =========================================================================

    /// Increment the retry counter for a stage.
    pub fn bump_retry(&self, stage: Stage) {
        *self.lock().retry_counts.entry(stage).or_default() += 1;
    }

    /// Retries consumed by a stage so far.
    #[must_use]
    pub fn retry_count(&self, stage: Stage) -> u32 {
        self.lock().retry_counts.get(&stage).copied().unwrap_or(0)
    }

    // =========================================================================
    // Reporting
    // =========================================================================

    /// Snapshot flow health. Safe to call concurrently with writers; the
    /// copy is taken under the lock and released immediately.
    #[must_use]
    pub fn health_report(&self) -> HealthReport {
        let inner = self.lock();
        let mut success_rates = HashMap::new();
        for stage in Stage::pipeline() {
            if let Some(rate) = inner.events.success_rate(stage) {
                success_rates.insert(stage, rate);
            }
        }
        HealthReport {
            flow_id: self.flow_id,
            current_stage: inner.current,
            success_rate_per_stage: success_rates,
            risk_level: inner.risk_level,
            circuit_breakers: inner.breaker.snapshots(),
            retry_counts: inner.retry_counts.clone(),
            transition_count: inner.history.len(),
            event_count: inner.events.len(),
            generated_at: Utc::now(),
        }
    }

    /// Clone out the full audit trail.
    #[must_use]
    pub fn audit_trail(&self) -> AuditTrail {
        let inner = self.lock();
        AuditTrail {
            transitions: inner.history.iter().cloned().collect(),
            events: inner.events.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> FlowControlState {
        FlowControlState::new(&FlowConfig::default())
    }

    #[test]
    fn test_full_linear_walk() {
        let s = state();
        for stage in [
            Stage::Research,
            Stage::Audience,
            Stage::Draft,
            Stage::Style,
            Stage::Quality,
            Stage::Completed,
        ] {
            let record = s.transition(stage).unwrap();
            assert!(record.success);
        }
        assert_eq!(s.current_stage(), Stage::Completed);
        assert_eq!(s.audit_trail().transitions.len(), 6);
    }

    #[test]
    fn test_rejects_skipping_stages() {
        let s = state();
        let err = s.transition(Stage::Draft).unwrap_err();
        assert!(matches!(err, FlowError::InvalidTransition { .. }));
    }

    #[test]
    fn test_no_stage_targeted_twice() {
        let s = state();
        s.transition(Stage::Research).unwrap();
        // Backwards is rejected by the graph before the visited check.
        assert!(s.transition(Stage::Research).is_err());

        let trail = s.audit_trail();
        let mut seen = HashSet::new();
        for record in &trail.transitions {
            assert!(seen.insert(record.to), "{} targeted twice", record.to);
        }
    }

    #[test]
    fn test_fail_from_any_stage_exactly_once() {
        let s = state();
        s.transition(Stage::Research).unwrap();
        let record = s.fail("research exploded").unwrap();
        assert!(!record.success);
        assert_eq!(record.error.as_deref(), Some("research exploded"));
        assert_eq!(s.current_stage(), Stage::Failed);
        // Terminal: nothing more is allowed, including failing again.
        assert!(s.fail("again").is_err());
    }

    #[test]
    fn test_history_bounded_by_cap() {
        let config = FlowConfig {
            max_history: 2,
            ..FlowConfig::default()
        };
        let s = FlowControlState::new(&config);
        s.transition(Stage::Research).unwrap();
        s.transition(Stage::Audience).unwrap();
        s.transition(Stage::Draft).unwrap();
        let trail = s.audit_trail();
        assert_eq!(trail.transitions.len(), 2);
        assert_eq!(trail.transitions[0].to, Stage::Audience);
    }

    #[test]
    fn test_record_event_escalates_to_emergency_stop() {
        let s = state();
        let mut last = None;
        for _ in 0..12 {
            last = Some(s.record_event("generate", Stage::Draft, 1, EventOutcome::Failure));
        }
        let assessment = last.unwrap();
        assert!(assessment.level.is_critical());
        assert!(s.is_emergency_stopped());
        assert!(s.check_method_allowed("generate").is_err());
        assert!(s.check_not_blocked(Stage::Draft).is_err());
    }

    #[test]
    fn test_health_report_snapshot() {
        let s = state();
        s.record_event("execute_stage", Stage::Validate, 3, EventOutcome::Success);
        s.record_event("execute_stage", Stage::Validate, 3, EventOutcome::Failure);
        s.bump_retry(Stage::Validate);
        s.record_stage_failure(Stage::Validate);

        let report = s.health_report();
        assert_eq!(report.current_stage, Stage::Validate);
        assert_eq!(report.success_rate_per_stage[&Stage::Validate], 0.5);
        assert_eq!(report.retry_counts[&Stage::Validate], 1);
        assert!(report.circuit_breakers.contains_key(&Stage::Validate));
        assert_eq!(report.event_count, 2);
    }

    #[test]
    fn test_retry_counters_per_stage() {
        let s = state();
        s.bump_retry(Stage::Draft);
        s.bump_retry(Stage::Draft);
        assert_eq!(s.retry_count(Stage::Draft), 2);
        assert_eq!(s.retry_count(Stage::Style), 0);
    }
}

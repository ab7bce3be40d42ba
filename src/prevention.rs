//! Loop prevention: runaway-pattern detection over the execution event log.
//!
//! This is the defense most directly motivated by the incidents that shaped
//! this crate (CPU pinned near 100% by an uncontrolled call loop). The
//! detector watches the `(method, stage, timestamp)` event stream for three
//! pattern classes and is deliberately conservative: an extra abort is
//! cheaper than a missed runaway.
//!
//! - **Method repetition**: the same method invoked too many times within a
//!   sliding window.
//! - **Cyclic calls**: a short call sequence (A→B→A...) repeating.
//! - **Stage oscillation**: an event for a stage the flow already completed.
//!   Structurally impossible given the linear stage graph, kept as
//!   defense-in-depth against buggy extensions.
//!
//! Assessments are transient: recomputed from the log on every check, never
//! persisted.

use crate::config::LoopThresholds;
use crate::events::EventLog;
use crate::stage::Stage;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, error};

/// Risk level of the current execution pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// No pattern observed.
    Low,
    /// Pattern observed, well below hard limits. Log only.
    Medium,
    /// Pattern approaching hard limits. Flagged in the audit trail.
    High,
    /// Hard limit breached. Emergency stop.
    Critical,
}

impl RiskLevel {
    /// Returns true if this level should be flagged in the audit trail.
    #[must_use]
    pub fn requires_intervention(&self) -> bool {
        matches!(self, Self::High | Self::Critical)
    }

    /// Returns true for the terminal level.
    #[must_use]
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::Critical)
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// A detected execution pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LoopPattern {
    /// Same method invoked `count` times within the sliding window.
    MethodRepetition {
        method: String,
        count: u32,
        window_secs: u64,
    },
    /// The trailing call sequence repeats a short cycle.
    CyclicCalls { cycle: Vec<String>, repetitions: u32 },
    /// An event arrived for a stage that already completed.
    StageOscillation { stage: Stage },
}

impl std::fmt::Display for LoopPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MethodRepetition {
                method,
                count,
                window_secs,
            } => write!(f, "method {} repeated {}x within {}s", method, count, window_secs),
            Self::CyclicCalls { cycle, repetitions } => {
                write!(f, "cycle [{}] repeated {}x", cycle.join(" -> "), repetitions)
            }
            Self::StageOscillation { stage } => {
                write!(f, "re-entry of completed stage {}", stage)
            }
        }
    }
}

/// What the orchestrator should do about the assessed risk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    /// No pattern; proceed normally.
    Continue,
    /// Pattern observed; keep watching, log only.
    Monitor,
    /// Pattern approaching limits; allow the stage but flag the audit trail.
    FlagAndContinue,
    /// Hard limit breached; terminate the flow.
    EmergencyStop,
}

/// Transient risk assessment, recomputed on demand from the event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopRiskAssessment {
    /// Overall risk level (worst of all triggered patterns).
    pub level: RiskLevel,
    /// Every pattern that triggered, worst first.
    pub patterns: Vec<LoopPattern>,
    /// Recommended orchestrator action.
    pub action: RecommendedAction,
}

impl LoopRiskAssessment {
    fn clear() -> Self {
        Self {
            level: RiskLevel::Low,
            patterns: Vec::new(),
            action: RecommendedAction::Continue,
        }
    }

    fn action_for(level: RiskLevel) -> RecommendedAction {
        match level {
            RiskLevel::Low => RecommendedAction::Continue,
            RiskLevel::Medium => RecommendedAction::Monitor,
            RiskLevel::High => RecommendedAction::FlagAndContinue,
            RiskLevel::Critical => RecommendedAction::EmergencyStop,
        }
    }
}

/// Number of trailing methods inspected for cycle detection.
const CYCLE_SCAN_DEPTH: usize = 32;

/// Anomaly detector plus the per-run blocklist populated by emergency stops.
#[derive(Debug)]
pub struct LoopPreventionSystem {
    thresholds: LoopThresholds,
    blocked_stages: HashSet<Stage>,
    blocked_methods: HashSet<String>,
    stop_reason: Option<String>,
}

impl LoopPreventionSystem {
    /// Create a detector with the given thresholds.
    #[must_use]
    pub fn new(thresholds: LoopThresholds) -> Self {
        Self {
            thresholds,
            blocked_stages: HashSet::new(),
            blocked_methods: HashSet::new(),
            stop_reason: None,
        }
    }

    /// Assess the current risk from the event log.
    ///
    /// `completed` is the set of stages the flow has already moved past;
    /// only the newest event is checked against it (older events for a
    /// stage legitimately predate its completion).
    #[must_use]
    pub fn assess(&self, events: &EventLog, completed: &HashSet<Stage>) -> LoopRiskAssessment {
        let mut patterns = Vec::new();
        let mut level = RiskLevel::Low;

        if let Some((pattern, risk)) = self.check_repetition(events) {
            level = level.max(risk);
            patterns.push(pattern);
        }
        if let Some((pattern, risk)) = self.check_cycles(events) {
            level = level.max(risk);
            patterns.push(pattern);
        }
        if let Some(pattern) = Self::check_oscillation(events, completed) {
            level = RiskLevel::Critical;
            patterns.push(pattern);
        }

        if patterns.is_empty() {
            return LoopRiskAssessment::clear();
        }
        patterns.sort_by_key(|p| match p {
            LoopPattern::StageOscillation { .. } => 0,
            LoopPattern::MethodRepetition { .. } => 1,
            LoopPattern::CyclicCalls { .. } => 2,
        });
        debug!(level = %level, patterns = patterns.len(), "loop risk assessed");
        LoopRiskAssessment {
            level,
            patterns,
            action: LoopRiskAssessment::action_for(level),
        }
    }

    fn check_repetition(&self, events: &EventLog) -> Option<(LoopPattern, RiskLevel)> {
        let window = self.thresholds.repetition_window();
        let recent = events.recent(window);
        if recent.is_empty() {
            return None;
        }

        let mut counts: std::collections::HashMap<&str, u32> = std::collections::HashMap::new();
        for event in &recent {
            *counts.entry(event.method.as_str()).or_default() += 1;
        }
        let (method, count) = counts.into_iter().max_by_key(|(_, c)| *c)?;

        let limit = self.thresholds.repetition_limit;
        let risk = if count > limit {
            RiskLevel::Critical
        } else if count * 5 >= limit * 4 {
            RiskLevel::High
        } else if count * 2 >= limit {
            RiskLevel::Medium
        } else {
            return None;
        };
        Some((
            LoopPattern::MethodRepetition {
                method: method.to_string(),
                count,
                window_secs: self.thresholds.repetition_window_secs,
            },
            risk,
        ))
    }

    fn check_cycles(&self, events: &EventLog) -> Option<(LoopPattern, RiskLevel)> {
        let methods: Vec<&str> = events
            .iter()
            .map(|e| e.method.as_str())
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .take(CYCLE_SCAN_DEPTH)
            .collect();
        // `methods` is newest-first here.

        let mut best: Option<(Vec<String>, u32)> = None;
        for len in self.thresholds.min_cycle_len..=self.thresholds.max_cycle_len {
            if methods.len() < len * 2 {
                continue;
            }
            let cycle = &methods[..len];
            // A cycle of identical methods is plain repetition, not a cycle.
            if cycle.iter().all(|m| *m == cycle[0]) {
                continue;
            }
            let mut repetitions = 1u32;
            let mut offset = len;
            while offset + len <= methods.len() && methods[offset..offset + len] == *cycle {
                repetitions += 1;
                offset += len;
            }
            if repetitions >= self.thresholds.cycle_limit
                && best.as_ref().map(|(_, r)| repetitions > *r).unwrap_or(true)
            {
                // Store in execution order (oldest call of the cycle first).
                let ordered: Vec<String> = cycle.iter().rev().map(|s| s.to_string()).collect();
                best = Some((ordered, repetitions));
            }
        }

        let (cycle, repetitions) = best?;
        let risk = if repetitions >= self.thresholds.cycle_limit * 2 {
            RiskLevel::Critical
        } else {
            RiskLevel::High
        };
        Some((LoopPattern::CyclicCalls { cycle, repetitions }, risk))
    }

    fn check_oscillation(events: &EventLog, completed: &HashSet<Stage>) -> Option<LoopPattern> {
        let newest = events.iter().last()?;
        if completed.contains(&newest.stage) {
            Some(LoopPattern::StageOscillation { stage: newest.stage })
        } else {
            None
        }
    }

    /// Irreversibly stop the flow, blocking the implicated method and stage
    /// for the remainder of the run.
    pub fn emergency_stop(&mut self, patterns: &[LoopPattern], reason: impl Into<String>) {
        let reason = reason.into();
        error!(reason = %reason, "EMERGENCY STOP triggered by loop prevention");
        for pattern in patterns {
            match pattern {
                LoopPattern::MethodRepetition { method, .. } => {
                    self.blocked_methods.insert(method.clone());
                }
                LoopPattern::CyclicCalls { cycle, .. } => {
                    for method in cycle {
                        self.blocked_methods.insert(method.clone());
                    }
                }
                LoopPattern::StageOscillation { stage } => {
                    self.blocked_stages.insert(*stage);
                }
            }
        }
        if self.stop_reason.is_none() {
            self.stop_reason = Some(reason);
        }
    }

    /// True once an emergency stop has fired. Irreversible.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stop_reason.is_some()
    }

    /// Reason for the emergency stop, if one fired.
    #[must_use]
    pub fn stop_reason(&self) -> Option<&str> {
        self.stop_reason.as_deref()
    }

    /// True if this stage was blocked by an emergency stop.
    #[must_use]
    pub fn is_stage_blocked(&self, stage: Stage) -> bool {
        self.blocked_stages.contains(&stage)
    }

    /// True if this method was blocked by an emergency stop.
    #[must_use]
    pub fn is_method_blocked(&self, method: &str) -> bool {
        self.blocked_methods.contains(method)
    }
}

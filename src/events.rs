//! Append-only execution event log.
//!
//! Every guarded invocation inside a flow is recorded as an
//! [`ExecutionEvent`]. The log feeds both the loop prevention detector and
//! the health report, and is bounded: once the configured cap is reached,
//! the oldest entries are evicted so memory stays flat no matter how long a
//! flow runs.

use crate::stage::Stage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use uuid::Uuid;

/// Outcome of a single guarded invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    /// Invocation completed successfully.
    Success,
    /// Invocation returned a failure.
    Failure,
    /// Invocation exceeded its wall-clock budget.
    Timeout,
    /// Invocation was cut off by a resource threshold.
    ResourceViolation,
    /// Invocation was refused before running (open circuit, blocked stage).
    Blocked,
}

impl EventOutcome {
    /// True for outcomes that count toward a stage's success rate numerator.
    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    /// True for guard violations.
    #[must_use]
    pub fn is_violation(self) -> bool {
        matches!(self, Self::Timeout | Self::ResourceViolation)
    }
}

impl std::fmt::Display for EventOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Timeout => "timeout",
            Self::ResourceViolation => "resource_violation",
            Self::Blocked => "blocked",
        };
        write!(f, "{}", s)
    }
}

/// Immutable audit record of one invocation. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    /// Unique event id.
    pub id: Uuid,
    /// Name of the invoked method (e.g. `execute_stage`).
    pub method: String,
    /// Stage the invocation belonged to.
    pub stage: Stage,
    /// Wall-clock start time.
    pub started_at: DateTime<Utc>,
    /// Duration of the invocation in milliseconds.
    pub duration_ms: u64,
    /// How the invocation ended.
    pub outcome: EventOutcome,
}

impl ExecutionEvent {
    /// Create a new event stamped with the current time.
    #[must_use]
    pub fn new(method: impl Into<String>, stage: Stage, duration_ms: u64, outcome: EventOutcome) -> Self {
        Self {
            id: Uuid::new_v4(),
            method: method.into(),
            stage,
            started_at: Utc::now(),
            duration_ms,
            outcome,
        }
    }

    /// Override the start timestamp (used by tests to build synthetic streams).
    #[must_use]
    pub fn with_started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = started_at;
        self
    }
}

/// Bounded, append-only event log with oldest-first eviction.
#[derive(Debug, Clone)]
pub struct EventLog {
    entries: VecDeque<ExecutionEvent>,
    cap: usize,
}

impl EventLog {
    /// Create a log bounded to `cap` entries.
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(cap.min(256)),
            cap: cap.max(1),
        }
    }

    /// Append an event, evicting the oldest entry if over the cap.
    pub fn record(&mut self, event: ExecutionEvent) {
        if self.entries.len() == self.cap {
            self.entries.pop_front();
        }
        self.entries.push_back(event);
    }

    /// Number of retained events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the log holds no events.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate retained events, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &ExecutionEvent> {
        self.entries.iter()
    }

    /// Events that started within `window` of the newest event.
    ///
    /// Using the newest event as the reference point keeps the query
    /// deterministic for synthetic streams with fabricated timestamps.
    #[must_use]
    pub fn recent(&self, window: Duration) -> Vec<&ExecutionEvent> {
        let Some(newest) = self.entries.back() else {
            return Vec::new();
        };
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        let cutoff = newest.started_at - window;
        self.entries
            .iter()
            .filter(|e| e.started_at >= cutoff)
            .collect()
    }

    /// Fraction of a stage's invocations that succeeded, if any were recorded.
    #[must_use]
    pub fn success_rate(&self, stage: Stage) -> Option<f64> {
        let mut total = 0u64;
        let mut ok = 0u64;
        for event in &self.entries {
            if event.stage == stage {
                total += 1;
                if event.outcome.is_success() {
                    ok += 1;
                }
            }
        }
        if total == 0 {
            None
        } else {
            Some(ok as f64 / total as f64)
        }
    }

    /// Clone out the full retained log, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ExecutionEvent> {
        self.entries.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(method: &str, stage: Stage, outcome: EventOutcome) -> ExecutionEvent {
        ExecutionEvent::new(method, stage, 5, outcome)
    }

    #[test]
    fn test_eviction_at_cap() {
        let mut log = EventLog::new(3);
        for i in 0..5 {
            log.record(event(&format!("m{}", i), Stage::Draft, EventOutcome::Success));
        }
        assert_eq!(log.len(), 3);
        let methods: Vec<_> = log.iter().map(|e| e.method.as_str()).collect();
        assert_eq!(methods, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn test_success_rate_per_stage() {
        let mut log = EventLog::new(100);
        log.record(event("execute_stage", Stage::Draft, EventOutcome::Success));
        log.record(event("execute_stage", Stage::Draft, EventOutcome::Failure));
        log.record(event("execute_stage", Stage::Style, EventOutcome::Success));

        assert_eq!(log.success_rate(Stage::Draft), Some(0.5));
        assert_eq!(log.success_rate(Stage::Style), Some(1.0));
        assert_eq!(log.success_rate(Stage::Quality), None);
    }

    #[test]
    fn test_recent_window_filters_old_events() {
        let mut log = EventLog::new(100);
        let old = event("a", Stage::Draft, EventOutcome::Success)
            .with_started_at(Utc::now() - chrono::Duration::seconds(120));
        let fresh = event("b", Stage::Draft, EventOutcome::Success);
        log.record(old);
        log.record(fresh);

        let recent = log.recent(Duration::from_secs(60));
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].method, "b");
    }

    #[test]
    fn test_events_are_immutable_records() {
        let e = event("execute_stage", Stage::Validate, EventOutcome::Blocked);
        let json = serde_json::to_string(&e).unwrap();
        let back: ExecutionEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, e.id);
        assert_eq!(back.outcome, EventOutcome::Blocked);
    }
}

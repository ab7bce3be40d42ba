//! Per-stage circuit breaker.
//!
//! Each stage gets an independent CLOSED / OPEN / HALF_OPEN state machine
//! driven purely by counted failures, counted successes, and elapsed time.
//! The breaker knows nothing about retries or loop detection; it only
//! answers "may this stage be attempted right now".
//!
//! State machine:
//!
//! ```text
//! CLOSED --failures >= threshold--> OPEN --cooldown elapsed--> HALF_OPEN
//!   ^                                 ^                            |
//!   |------------success--------------+---------failure------------|
//! ```

use crate::config::BreakerPolicy;
use crate::stage::Stage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, warn};

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Normal operation, attempts allowed.
    Closed,
    /// Tripped; attempts refused until the cooldown elapses.
    Open,
    /// Cooldown elapsed; exactly one trial attempt allowed.
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        };
        write!(f, "{}", s)
    }
}

/// Read-only view of one stage's breaker, for health reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    /// Current state.
    pub state: BreakerState,
    /// Consecutive failures since the last success.
    pub consecutive_failures: u32,
    /// Timestamp of the most recent recorded failure.
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Timestamp at which the breaker last opened.
    pub opened_at: Option<DateTime<Utc>>,
}

/// Internal per-stage record. Created lazily on first use.
#[derive(Debug)]
struct StageBreaker {
    state: BreakerState,
    consecutive_failures: u32,
    last_failure_at: Option<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
    /// Monotonic instant of the last open, for cooldown arithmetic.
    opened_instant: Option<Instant>,
    /// A half-open trial has been handed out and not yet resolved.
    trial_in_flight: bool,
}

impl StageBreaker {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            opened_at: None,
            opened_instant: None,
            trial_in_flight: false,
        }
    }
}

/// Circuit breaker covering every stage of one flow.
///
/// Not internally synchronized: the owning [`FlowControlState`] serializes
/// access behind its lock.
///
/// [`FlowControlState`]: crate::state::FlowControlState
#[derive(Debug)]
pub struct CircuitBreaker {
    policy: BreakerPolicy,
    stages: HashMap<Stage, StageBreaker>,
}

impl CircuitBreaker {
    /// Create a breaker with the given policy.
    #[must_use]
    pub fn new(policy: BreakerPolicy) -> Self {
        Self {
            policy,
            stages: HashMap::new(),
        }
    }

    fn entry(&mut self, stage: Stage) -> &mut StageBreaker {
        self.stages.entry(stage).or_insert_with(StageBreaker::new)
    }

    /// May this stage be attempted right now?
    ///
    /// Returns false while OPEN with cooldown unexpired. Once the cooldown
    /// elapses, the breaker moves to HALF_OPEN and hands out exactly one
    /// trial: further `allow` calls return false until the trial's outcome
    /// is recorded.
    pub fn allow(&mut self, stage: Stage) -> bool {
        let cooldown = self.policy.cooldown();
        let breaker = self.entry(stage);
        match breaker.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = breaker
                    .opened_instant
                    .map(|t| t.elapsed())
                    .unwrap_or_default();
                if elapsed >= cooldown {
                    debug!(stage = %stage, "circuit breaker cooldown elapsed, entering half-open");
                    breaker.state = BreakerState::HalfOpen;
                    breaker.trial_in_flight = true;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if breaker.trial_in_flight {
                    false
                } else {
                    breaker.trial_in_flight = true;
                    true
                }
            }
        }
    }

    /// Milliseconds of cooldown remaining for an open stage, zero otherwise.
    #[must_use]
    pub fn cooldown_remaining_ms(&self, stage: Stage) -> u64 {
        let Some(breaker) = self.stages.get(&stage) else {
            return 0;
        };
        if breaker.state != BreakerState::Open {
            return 0;
        }
        let cooldown = self.policy.cooldown();
        breaker
            .opened_instant
            .map(|t| cooldown.saturating_sub(t.elapsed()).as_millis() as u64)
            .unwrap_or(0)
    }

    /// Record a successful attempt: closes the breaker and resets counts.
    pub fn record_success(&mut self, stage: Stage) {
        let breaker = self.entry(stage);
        if breaker.state != BreakerState::Closed {
            debug!(stage = %stage, from = %breaker.state, "circuit breaker closing after success");
        }
        breaker.state = BreakerState::Closed;
        breaker.consecutive_failures = 0;
        breaker.trial_in_flight = false;
    }

    /// Record a failed attempt.
    ///
    /// A failure while HALF_OPEN reopens immediately and restarts the
    /// cooldown. In CLOSED, the breaker opens once the consecutive failure
    /// count reaches the threshold.
    pub fn record_failure(&mut self, stage: Stage) {
        let threshold = self.policy.failure_threshold;
        let breaker = self.entry(stage);
        breaker.consecutive_failures = breaker.consecutive_failures.saturating_add(1);
        breaker.last_failure_at = Some(Utc::now());
        breaker.trial_in_flight = false;

        let should_open = match breaker.state {
            BreakerState::HalfOpen => true,
            BreakerState::Closed => breaker.consecutive_failures >= threshold,
            BreakerState::Open => false,
        };
        if should_open {
            warn!(
                stage = %stage,
                failures = breaker.consecutive_failures,
                "circuit breaker opening"
            );
            breaker.state = BreakerState::Open;
            breaker.opened_at = Some(Utc::now());
            breaker.opened_instant = Some(Instant::now());
        }
    }

    /// Snapshot one stage's breaker, if it has been used.
    #[must_use]
    pub fn snapshot(&self, stage: Stage) -> Option<BreakerSnapshot> {
        self.stages.get(&stage).map(|b| BreakerSnapshot {
            state: b.state,
            consecutive_failures: b.consecutive_failures,
            last_failure_at: b.last_failure_at,
            opened_at: b.opened_at,
        })
    }

    /// Snapshot every stage breaker that has been used.
    #[must_use]
    pub fn snapshots(&self) -> HashMap<Stage, BreakerSnapshot> {
        self.stages
            .keys()
            .filter_map(|s| self.snapshot(*s).map(|snap| (*s, snap)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(BreakerPolicy {
            failure_threshold: threshold,
            cooldown_secs,
        })
    }

    #[test]
    fn test_opens_after_exactly_threshold_failures() {
        let mut cb = breaker(3, 60);
        assert!(cb.allow(Stage::Style));
        cb.record_failure(Stage::Style);
        assert!(cb.allow(Stage::Style));
        cb.record_failure(Stage::Style);
        assert!(cb.allow(Stage::Style));
        cb.record_failure(Stage::Style);

        assert!(!cb.allow(Stage::Style));
        assert_eq!(cb.snapshot(Stage::Style).unwrap().state, BreakerState::Open);
        assert!(cb.cooldown_remaining_ms(Stage::Style) > 0);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let mut cb = breaker(3, 60);
        cb.record_failure(Stage::Draft);
        cb.record_failure(Stage::Draft);
        cb.record_success(Stage::Draft);
        cb.record_failure(Stage::Draft);
        cb.record_failure(Stage::Draft);
        // Only two consecutive failures since the success: still closed.
        assert!(cb.allow(Stage::Draft));
    }

    #[test]
    fn test_half_open_allows_single_trial() {
        let mut cb = breaker(1, 0);
        cb.record_failure(Stage::Quality);
        // Zero cooldown: first allow moves to half-open and grants the trial.
        assert!(cb.allow(Stage::Quality));
        // Trial unresolved: no second attempt.
        assert!(!cb.allow(Stage::Quality));

        cb.record_success(Stage::Quality);
        assert_eq!(
            cb.snapshot(Stage::Quality).unwrap().state,
            BreakerState::Closed
        );
        assert!(cb.allow(Stage::Quality));
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let mut cb = breaker(1, 0);
        cb.record_failure(Stage::Research);
        assert!(cb.allow(Stage::Research)); // half-open trial
        cb.record_failure(Stage::Research);
        assert_eq!(
            cb.snapshot(Stage::Research).unwrap().state,
            BreakerState::Open
        );
    }

    #[test]
    fn test_stages_are_independent() {
        let mut cb = breaker(1, 60);
        cb.record_failure(Stage::Style);
        assert!(!cb.allow(Stage::Style));
        assert!(cb.allow(Stage::Draft));
    }

    #[test]
    fn test_snapshots_only_cover_used_stages() {
        let mut cb = breaker(3, 60);
        cb.record_failure(Stage::Draft);
        let snaps = cb.snapshots();
        assert_eq!(snaps.len(), 1);
        assert!(snaps.contains_key(&Stage::Draft));
    }
}

//! Typed configuration for flow execution control.
//!
//! Every tunable the controller recognizes is an explicit field on one of
//! these structs. Configuration is supplied once at flow start and read-only
//! afterwards; there is no runtime reconfiguration mid-flow.
//!
//! The numeric defaults (failure threshold 3, five-minute stage timeout,
//! thirty-minute flow timeout) are tuning parameters, not load-bearing
//! constants.

use crate::error::{FlowError, Result};
use crate::stage::Stage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Default base backoff delay in milliseconds for retry attempts.
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 2000;

/// Default maximum backoff delay in milliseconds.
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 30_000;

/// Default exponential backoff multiplier.
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Retry behavior for a single stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    /// Base delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Exponential multiplier applied per attempt.
    pub multiplier: f64,
    /// Cap on any single delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Jitter fraction in [0, 1): each delay is scaled by `1 ± jitter`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: DEFAULT_BACKOFF_BASE_MS,
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_delay_ms: DEFAULT_MAX_BACKOFF_MS,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Fast retries for cheap stages (validation).
    #[must_use]
    pub fn fast() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            multiplier: 2.0,
            max_delay_ms: 2_000,
            jitter: 0.1,
        }
    }

    /// Slow, patient retries for expensive generation stages.
    #[must_use]
    pub fn patient() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 5_000,
            multiplier: 2.0,
            max_delay_ms: 60_000,
            jitter: 0.2,
        }
    }

    /// Validates the policy fields.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(FlowError::invalid_config(
                "retry.max_attempts",
                "must be at least 1",
            ));
        }
        if self.multiplier < 1.0 || !self.multiplier.is_finite() {
            return Err(FlowError::invalid_config(
                "retry.multiplier",
                format!("must be a finite value >= 1.0, got {}", self.multiplier),
            ));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(FlowError::invalid_config(
                "retry.max_delay_ms",
                "must be >= base_delay_ms",
            ));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(FlowError::invalid_config(
                "retry.jitter",
                format!("must be in [0, 1), got {}", self.jitter),
            ));
        }
        Ok(())
    }
}

/// Circuit breaker policy, shared by all stages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BreakerPolicy {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,
    /// Seconds the breaker stays open before allowing a half-open trial.
    pub cooldown_secs: u64,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_secs: 30,
        }
    }
}

impl BreakerPolicy {
    /// Cooldown as a `Duration`.
    #[must_use]
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    /// Validates the policy fields.
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(FlowError::invalid_config(
                "breaker.failure_threshold",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Wall-clock and resource limits enforced around every stage call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GuardLimits {
    /// Maximum duration of a single stage call, in seconds.
    pub stage_timeout_secs: u64,
    /// Maximum duration of the whole flow, in seconds.
    pub flow_timeout_secs: u64,
    /// Process CPU usage threshold in percent (0 disables the check).
    pub max_cpu_percent: f64,
    /// Process memory threshold in bytes (0 disables the check).
    pub max_memory_bytes: u64,
    /// Interval between resource samples, in milliseconds.
    pub sample_interval_ms: u64,
}

impl Default for GuardLimits {
    fn default() -> Self {
        Self {
            stage_timeout_secs: 300,
            flow_timeout_secs: 1800,
            max_cpu_percent: 90.0,
            max_memory_bytes: 2 * 1024 * 1024 * 1024,
            sample_interval_ms: 500,
        }
    }
}

impl GuardLimits {
    /// Per-stage timeout as a `Duration`.
    #[must_use]
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    /// Whole-flow timeout as a `Duration`.
    #[must_use]
    pub fn flow_timeout(&self) -> Duration {
        Duration::from_secs(self.flow_timeout_secs)
    }

    /// Validates the limit fields.
    pub fn validate(&self) -> Result<()> {
        if self.stage_timeout_secs == 0 {
            return Err(FlowError::invalid_config(
                "guards.stage_timeout_secs",
                "must be positive",
            ));
        }
        if self.flow_timeout_secs < self.stage_timeout_secs {
            return Err(FlowError::invalid_config(
                "guards.flow_timeout_secs",
                "must be >= stage_timeout_secs",
            ));
        }
        if self.max_cpu_percent < 0.0 || self.max_cpu_percent > 100.0 {
            return Err(FlowError::invalid_config(
                "guards.max_cpu_percent",
                format!("must be in [0, 100], got {}", self.max_cpu_percent),
            ));
        }
        if self.sample_interval_ms == 0 {
            return Err(FlowError::invalid_config(
                "guards.sample_interval_ms",
                "must be positive",
            ));
        }
        Ok(())
    }
}

/// Thresholds for the loop prevention detector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoopThresholds {
    /// Invocations of the same method within the window that breach the
    /// hard limit.
    pub repetition_limit: u32,
    /// Sliding window for repetition counting, in seconds.
    pub repetition_window_secs: u64,
    /// Consecutive repeats of a call cycle that count as High risk.
    pub cycle_limit: u32,
    /// Shortest cycle length the detector looks for.
    pub min_cycle_len: usize,
    /// Longest cycle length the detector looks for.
    pub max_cycle_len: usize,
}

impl Default for LoopThresholds {
    fn default() -> Self {
        Self {
            repetition_limit: 10,
            repetition_window_secs: 60,
            cycle_limit: 3,
            min_cycle_len: 2,
            max_cycle_len: 4,
        }
    }
}

impl LoopThresholds {
    /// Sliding window as a `Duration`.
    #[must_use]
    pub fn repetition_window(&self) -> Duration {
        Duration::from_secs(self.repetition_window_secs)
    }

    /// Validates the threshold fields.
    pub fn validate(&self) -> Result<()> {
        if self.repetition_limit == 0 {
            return Err(FlowError::invalid_config(
                "loop.repetition_limit",
                "must be at least 1",
            ));
        }
        if self.cycle_limit == 0 {
            return Err(FlowError::invalid_config(
                "loop.cycle_limit",
                "must be at least 1",
            ));
        }
        if self.min_cycle_len < 2 {
            return Err(FlowError::invalid_config(
                "loop.min_cycle_len",
                "must be at least 2",
            ));
        }
        if self.max_cycle_len < self.min_cycle_len {
            return Err(FlowError::invalid_config(
                "loop.max_cycle_len",
                "must be >= min_cycle_len",
            ));
        }
        Ok(())
    }
}

/// Complete configuration for one flow execution.
///
/// # Example
///
/// ```
/// use flowguard::config::{FlowConfig, RetryPolicy};
/// use flowguard::stage::Stage;
///
/// let config = FlowConfig::default()
///     .with_retry_override(Stage::Validate, RetryPolicy::fast())
///     .with_retry_override(Stage::Draft, RetryPolicy::patient());
/// assert!(config.validate().is_ok());
/// assert_eq!(config.retry_policy(Stage::Validate).base_delay_ms, 200);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Retry policy applied to stages without an override.
    pub default_retry: RetryPolicy,
    /// Per-stage retry overrides.
    pub retry_overrides: HashMap<Stage, RetryPolicy>,
    /// Circuit breaker policy.
    pub breaker: BreakerPolicy,
    /// Execution guard limits.
    pub guards: GuardLimits,
    /// Loop prevention thresholds.
    pub loop_thresholds: LoopThresholds,
    /// Maximum transition records kept before oldest-first eviction.
    pub max_history: usize,
    /// Maximum execution events kept before oldest-first eviction.
    pub max_events: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            default_retry: RetryPolicy::default(),
            retry_overrides: HashMap::new(),
            breaker: BreakerPolicy::default(),
            guards: GuardLimits::default(),
            loop_thresholds: LoopThresholds::default(),
            max_history: Self::DEFAULT_MAX_HISTORY,
            max_events: Self::DEFAULT_MAX_EVENTS,
        }
    }
}

impl FlowConfig {
    /// Default cap on retained transition records.
    pub const DEFAULT_MAX_HISTORY: usize = 200;
    /// Default cap on retained execution events.
    pub const DEFAULT_MAX_EVENTS: usize = 2000;

    /// Returns the retry policy for a stage, falling back to the default.
    #[must_use]
    pub fn retry_policy(&self, stage: Stage) -> &RetryPolicy {
        self.retry_overrides.get(&stage).unwrap_or(&self.default_retry)
    }

    /// Replace the default retry policy.
    #[must_use]
    pub fn with_default_retry(mut self, policy: RetryPolicy) -> Self {
        self.default_retry = policy;
        self
    }

    /// Set a per-stage retry override.
    #[must_use]
    pub fn with_retry_override(mut self, stage: Stage, policy: RetryPolicy) -> Self {
        self.retry_overrides.insert(stage, policy);
        self
    }

    /// Replace the guard limits.
    #[must_use]
    pub fn with_guards(mut self, guards: GuardLimits) -> Self {
        self.guards = guards;
        self
    }

    /// Replace the breaker policy.
    #[must_use]
    pub fn with_breaker(mut self, breaker: BreakerPolicy) -> Self {
        self.breaker = breaker;
        self
    }

    /// Replace the loop thresholds.
    #[must_use]
    pub fn with_loop_thresholds(mut self, thresholds: LoopThresholds) -> Self {
        self.loop_thresholds = thresholds;
        self
    }

    /// Validates every recognized field.
    pub fn validate(&self) -> Result<()> {
        self.default_retry.validate()?;
        for (stage, policy) in &self.retry_overrides {
            policy.validate().map_err(|e| {
                FlowError::invalid_config(format!("retry_overrides.{}", stage), e.to_string())
            })?;
        }
        self.breaker.validate()?;
        self.guards.validate()?;
        self.loop_thresholds.validate()?;
        if self.max_history == 0 {
            return Err(FlowError::invalid_config(
                "max_history",
                "must be positive",
            ));
        }
        if self.max_events == 0 {
            return Err(FlowError::invalid_config("max_events", "must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        assert!(FlowConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_history_cap_rejected() {
        let config = FlowConfig {
            max_history: 0,
            ..FlowConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_policy_validation() {
        let mut policy = RetryPolicy::default();
        assert!(policy.validate().is_ok());

        policy.max_attempts = 0;
        assert!(policy.validate().is_err());

        policy = RetryPolicy {
            jitter: 1.5,
            ..RetryPolicy::default()
        };
        assert!(policy.validate().is_err());

        policy = RetryPolicy {
            max_delay_ms: 10,
            base_delay_ms: 100,
            ..RetryPolicy::default()
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_per_stage_override_lookup() {
        let config = FlowConfig::default()
            .with_retry_override(Stage::Validate, RetryPolicy::fast());
        assert_eq!(config.retry_policy(Stage::Validate).base_delay_ms, 200);
        assert_eq!(
            config.retry_policy(Stage::Draft).base_delay_ms,
            DEFAULT_BACKOFF_BASE_MS
        );
    }

    #[test]
    fn test_guard_limits_validation() {
        let mut limits = GuardLimits::default();
        assert!(limits.validate().is_ok());

        limits.flow_timeout_secs = 1;
        assert!(limits.validate().is_err());

        limits = GuardLimits {
            max_cpu_percent: 120.0,
            ..GuardLimits::default()
        };
        assert!(limits.validate().is_err());
    }

    #[test]
    fn test_loop_thresholds_validation() {
        let mut thresholds = LoopThresholds::default();
        assert!(thresholds.validate().is_ok());

        thresholds.min_cycle_len = 1;
        assert!(thresholds.validate().is_err());
    }
}

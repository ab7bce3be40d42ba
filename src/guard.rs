//! Execution guards: wall-clock and resource limits around stage calls.
//!
//! Every stage invocation runs inside [`ExecutionGuard::guard`], which races
//! the stage future against the per-call deadline, the whole-flow deadline,
//! and a periodic resource sampler. Cancellation is cooperative: a losing
//! stage future is dropped, never awaited further, and its eventual result
//! (if the underlying work keeps running somewhere) is discarded.

use crate::config::GuardLimits;
use crate::error::{FlowError, Result};
use crate::stage::Stage;
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// One observation of process resource usage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSample {
    /// Process CPU usage since the previous sample, in percent.
    pub cpu_percent: f64,
    /// Resident set size in bytes.
    pub memory_bytes: u64,
}

/// Source of resource samples.
///
/// Injected so tests can script violations without burning real CPU.
pub trait ResourceProbe: Send {
    /// Take a sample, or `None` if sampling is unavailable on this platform.
    fn sample(&mut self) -> Option<ResourceSample>;
}

/// Probe reading `/proc/self` on Linux. Returns `None` elsewhere.
#[derive(Debug, Default)]
pub struct ProcProbe {
    last_cpu: Option<(u64, Instant)>,
}

/// Linux default clock ticks per second (`_SC_CLK_TCK`).
#[cfg(target_os = "linux")]
const CLK_TCK: f64 = 100.0;

impl ProcProbe {
    /// Create a probe.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(target_os = "linux")]
    fn read_cpu_ticks() -> Option<u64> {
        let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
        // Skip past the parenthesized command name; fields after it are
        // space-separated, with utime and stime at positions 12 and 13.
        let rest = stat.rsplit_once(')')?.1;
        let fields: Vec<&str> = rest.split_whitespace().collect();
        let utime: u64 = fields.get(11)?.parse().ok()?;
        let stime: u64 = fields.get(12)?.parse().ok()?;
        Some(utime + stime)
    }

    #[cfg(target_os = "linux")]
    fn read_rss_bytes() -> Option<u64> {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        for line in status.lines() {
            if let Some(rest) = line.strip_prefix("VmRSS:") {
                let kb: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
                return Some(kb * 1024);
            }
        }
        None
    }
}

impl ResourceProbe for ProcProbe {
    #[cfg(target_os = "linux")]
    fn sample(&mut self) -> Option<ResourceSample> {
        let ticks = Self::read_cpu_ticks()?;
        let now = Instant::now();
        let memory_bytes = Self::read_rss_bytes().unwrap_or(0);
        let cpu_percent = match self.last_cpu {
            Some((prev_ticks, prev_at)) => {
                let wall = now.duration_since(prev_at).as_secs_f64();
                if wall < 0.1 {
                    // A sub-100ms window turns a single 10ms tick into a
                    // huge percentage; keep the previous anchor and report
                    // idle until the window is wide enough.
                    return Some(ResourceSample {
                        cpu_percent: 0.0,
                        memory_bytes,
                    });
                }
                let cpu_secs = ticks.saturating_sub(prev_ticks) as f64 / CLK_TCK;
                (cpu_secs / wall) * 100.0
            }
            None => 0.0,
        };
        self.last_cpu = Some((ticks, now));
        Some(ResourceSample {
            cpu_percent,
            memory_bytes,
        })
    }

    #[cfg(not(target_os = "linux"))]
    fn sample(&mut self) -> Option<ResourceSample> {
        None
    }
}

/// Guards stage calls against the configured time and resource budgets.
///
/// One guard per flow execution; the flow clock starts when the guard is
/// created.
pub struct ExecutionGuard {
    limits: GuardLimits,
    // tokio clock, so paused-clock tests can exercise the flow deadline.
    flow_started: tokio::time::Instant,
    probe: Mutex<Box<dyn ResourceProbe>>,
}

impl std::fmt::Debug for ExecutionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionGuard")
            .field("limits", &self.limits)
            .field("flow_started", &self.flow_started)
            .field("probe", &"<dyn ResourceProbe>")
            .finish()
    }
}

impl ExecutionGuard {
    /// Create a guard with the default `/proc` probe.
    #[must_use]
    pub fn new(limits: GuardLimits) -> Self {
        Self::with_probe(limits, Box::new(ProcProbe::new()))
    }

    /// Create a guard with an injected probe.
    #[must_use]
    pub fn with_probe(limits: GuardLimits, probe: Box<dyn ResourceProbe>) -> Self {
        Self {
            limits,
            flow_started: tokio::time::Instant::now(),
            probe: Mutex::new(probe),
        }
    }

    /// Time elapsed since the flow started.
    #[must_use]
    pub fn flow_elapsed(&self) -> Duration {
        self.flow_started.elapsed()
    }

    /// Check the whole-flow deadline without running anything.
    pub fn check_flow_deadline(&self) -> Result<()> {
        let elapsed = self.flow_elapsed();
        if elapsed >= self.limits.flow_timeout() {
            return Err(FlowError::FlowTimeout {
                elapsed_ms: elapsed.as_millis() as u64,
                limit_ms: self.limits.flow_timeout().as_millis() as u64,
            });
        }
        Ok(())
    }

    /// Run a stage future under the time and resource budgets.
    ///
    /// On violation the future is dropped, not awaited further; the caller
    /// must treat any side effects of the abandoned work as void.
    pub async fn guard<T, F>(&self, stage: Stage, fut: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        self.check_flow_deadline()?;
        let stage_timeout = self.limits.stage_timeout();
        let flow_remaining = self
            .limits
            .flow_timeout()
            .saturating_sub(self.flow_elapsed());
        let budget = stage_timeout.min(flow_remaining);
        let flow_bound = flow_remaining < stage_timeout;

        let started = tokio::time::Instant::now();
        let deadline = tokio::time::sleep(budget);
        let mut sampler = tokio::time::interval(Duration::from_millis(self.limits.sample_interval_ms));
        sampler.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tokio::pin!(fut);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                out = &mut fut => return Ok(out),
                () = &mut deadline => {
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    warn!(stage = %stage, elapsed_ms, "stage call abandoned at deadline");
                    return Err(if flow_bound {
                        FlowError::FlowTimeout {
                            elapsed_ms: self.flow_elapsed().as_millis() as u64,
                            limit_ms: self.limits.flow_timeout().as_millis() as u64,
                        }
                    } else {
                        FlowError::Timeout {
                            stage,
                            elapsed_ms,
                            limit_ms: budget.as_millis() as u64,
                        }
                    });
                }
                _ = sampler.tick() => {
                    if let Some(violation) = self.check_resources(stage) {
                        warn!(stage = %stage, error = %violation, "stage call abandoned on resource violation");
                        return Err(violation);
                    }
                }
            }
        }
    }

    fn check_resources(&self, stage: Stage) -> Option<FlowError> {
        let sample = self
            .probe
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sample()?;
        debug!(
            stage = %stage,
            cpu = sample.cpu_percent,
            memory = sample.memory_bytes,
            "resource sample"
        );
        if self.limits.max_cpu_percent > 0.0 && sample.cpu_percent > self.limits.max_cpu_percent {
            return Some(FlowError::ResourceExceeded {
                stage,
                resource: "cpu_percent".to_string(),
                observed: sample.cpu_percent,
                limit: self.limits.max_cpu_percent,
            });
        }
        if self.limits.max_memory_bytes > 0 && sample.memory_bytes > self.limits.max_memory_bytes {
            return Some(FlowError::ResourceExceeded {
                stage,
                resource: "memory_bytes".to_string(),
                observed: sample.memory_bytes as f64,
                limit: self.limits.max_memory_bytes as f64,
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Probe that replays a fixed script of samples.
    struct ScriptedProbe {
        samples: Vec<ResourceSample>,
    }

    impl ResourceProbe for ScriptedProbe {
        fn sample(&mut self) -> Option<ResourceSample> {
            if self.samples.is_empty() {
                None
            } else {
                Some(self.samples.remove(0))
            }
        }
    }

    fn limits_ms(stage_ms: u64, flow_ms: u64) -> GuardLimits {
        GuardLimits {
            stage_timeout_secs: stage_ms / 1000,
            flow_timeout_secs: flow_ms / 1000,
            max_cpu_percent: 0.0,
            max_memory_bytes: 0,
            sample_interval_ms: 50,
        }
    }

    #[tokio::test]
    async fn test_fast_future_passes_through() {
        let guard = ExecutionGuard::new(GuardLimits::default());
        let result = guard.guard(Stage::Validate, async { 41 + 1 }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_future_times_out_within_epsilon() {
        let guard = ExecutionGuard::with_probe(
            limits_ms(1000, 60_000),
            Box::new(ScriptedProbe { samples: vec![] }),
        );
        let wall = Instant::now();
        let result = guard
            .guard(Stage::Draft, async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            })
            .await;
        match result {
            Err(FlowError::Timeout { stage, .. }) => assert_eq!(stage, Stage::Draft),
            other => panic!("expected Timeout, got {:?}", other),
        }
        // Paused clock: virtually instant, and certainly not the full hour.
        assert!(wall.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flow_deadline_wins_over_stage_budget() {
        let guard = ExecutionGuard::with_probe(
            limits_ms(300_000, 1000),
            Box::new(ScriptedProbe { samples: vec![] }),
        );
        let result = guard
            .guard(Stage::Style, async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            })
            .await;
        assert!(matches!(result, Err(FlowError::FlowTimeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resource_violation_aborts_call() {
        let limits = GuardLimits {
            max_cpu_percent: 90.0,
            ..GuardLimits::default()
        };
        let probe = ScriptedProbe {
            samples: vec![
                ResourceSample {
                    cpu_percent: 50.0,
                    memory_bytes: 1024,
                },
                ResourceSample {
                    cpu_percent: 99.0,
                    memory_bytes: 1024,
                },
            ],
        };
        let guard = ExecutionGuard::with_probe(limits, Box::new(probe));
        let result = guard
            .guard(Stage::Research, async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            })
            .await;
        match result {
            Err(FlowError::ResourceExceeded { resource, observed, .. }) => {
                assert_eq!(resource, "cpu_percent");
                assert!((observed - 99.0).abs() < f64::EPSILON);
            }
            other => panic!("expected ResourceExceeded, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_violation_detected() {
        let limits = GuardLimits {
            max_memory_bytes: 1000,
            ..GuardLimits::default()
        };
        let probe = ScriptedProbe {
            samples: vec![ResourceSample {
                cpu_percent: 1.0,
                memory_bytes: 4096,
            }],
        };
        let guard = ExecutionGuard::with_probe(limits, Box::new(probe));
        let result = guard
            .guard(Stage::Quality, async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            })
            .await;
        assert!(matches!(
            result,
            Err(FlowError::ResourceExceeded { .. })
        ));
    }

    #[tokio::test]
    async fn test_exhausted_flow_budget_rejects_before_running() {
        let limits = GuardLimits {
            stage_timeout_secs: 1,
            flow_timeout_secs: 1,
            ..GuardLimits::default()
        };
        let mut guard = ExecutionGuard::with_probe(limits, Box::new(ScriptedProbe { samples: vec![] }));
        guard.flow_started = tokio::time::Instant::now() - Duration::from_secs(5);
        let result = guard.guard(Stage::Validate, async { 1 }).await;
        assert!(matches!(result, Err(FlowError::FlowTimeout { .. })));
    }
}

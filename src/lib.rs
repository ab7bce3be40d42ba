//! Flowguard - Flow Execution Control
//!
//! Execution control for multi-stage content generation flows: a stage
//! state machine, per-stage circuit breakers, retries with exponential
//! backoff, loop prevention with emergency stop, and time/resource guards,
//! all aggregated behind one thread-safe per-flow state object.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`stage`] - The fixed linear stage pipeline and its transition rules
//! - [`state`] - Thread-safe per-flow control state and audit trail
//! - [`breaker`] - Per-stage circuit breaker
//! - [`retry`] - Bounded retries with exponential backoff and jitter
//! - [`prevention`] - Loop detection, risk assessment, and emergency stop
//! - [`guard`] - Stage/flow timeouts and resource limit enforcement
//! - [`manager`] - The orchestrator that drives a flow end to end
//! - [`executor`] - The stage executor trait implemented by embedders
//! - [`config`] - Tunable policies and thresholds
//! - [`error`] - Custom error types and handling
//!
//! # Example
//!
//! ```rust,ignore
//! use flowguard::{FlowConfig, StageManager};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let manager = StageManager::new(FlowConfig::default(), Arc::new(MyExecutor))?;
//! let result = manager.run(json!({ "topic": "fermentation" })).await;
//! if result.is_completed() {
//!     println!("{}", result.output.unwrap());
//! }
//! ```

pub mod breaker;
pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod guard;
pub mod manager;
pub mod prevention;
pub mod retry;
pub mod stage;
pub mod state;

// Re-export commonly used types
pub use error::{FlowError, Result};

// Re-export config types
pub use config::{
    BreakerPolicy, FlowConfig, GuardLimits, LoopThresholds, RetryPolicy, DEFAULT_BACKOFF_BASE_MS,
    DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_MAX_BACKOFF_MS,
};

// Re-export stage machine types
pub use stage::Stage;
pub use state::{AuditTrail, FlowControlState, HealthReport, TransitionRecord};

// Re-export orchestration types
pub use executor::{StageContext, StageExecutor, StageOutcome};
pub use manager::{FlowResult, StageManager};
pub use retry::{calculate_backoff, with_jitter, RetryManager};

// Re-export control subsystem types
pub use breaker::{BreakerSnapshot, BreakerState, CircuitBreaker};
pub use events::{EventLog, EventOutcome, ExecutionEvent};
pub use guard::{ExecutionGuard, ResourceProbe, ResourceSample};
pub use prevention::{
    LoopPattern, LoopPreventionSystem, LoopRiskAssessment, RecommendedAction, RiskLevel,
};

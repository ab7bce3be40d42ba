//! The fixed, linear stage graph of the content pipeline.
//!
//! The pipeline is deliberately a straight line: each stage has exactly one
//! successor, and `Failed` is reachable from anywhere. There is no branching
//! and no way to revisit a stage. An earlier branching design produced
//! runaway loops; the linearity here is a hard constraint, not a
//! simplification.
//!
//! # Example
//!
//! ```
//! use flowguard::stage::Stage;
//!
//! assert_eq!(Stage::Validate.successor().unwrap(), Stage::Research);
//! assert!(Stage::Completed.is_terminal());
//! ```

use crate::error::{FlowError, Result};
use serde::{Deserialize, Serialize};

/// One step in the content pipeline's fixed sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Input validation.
    Validate,
    /// Topic research.
    Research,
    /// Audience alignment.
    Audience,
    /// Content drafting.
    Draft,
    /// Style checking.
    Style,
    /// Final quality gate.
    Quality,
    /// Terminal: flow finished successfully.
    Completed,
    /// Terminal: flow aborted.
    Failed,
}

impl Stage {
    /// The working stages in execution order (terminals excluded).
    #[must_use]
    pub fn pipeline() -> [Stage; 6] {
        [
            Self::Validate,
            Self::Research,
            Self::Audience,
            Self::Draft,
            Self::Style,
            Self::Quality,
        ]
    }

    /// Returns the single valid successor of this stage.
    ///
    /// Pure function: no side effects, no shared state. Fails with
    /// [`FlowError::InvalidTransition`] for terminal stages.
    pub fn successor(self) -> Result<Stage> {
        match self {
            Self::Validate => Ok(Self::Research),
            Self::Research => Ok(Self::Audience),
            Self::Audience => Ok(Self::Draft),
            Self::Draft => Ok(Self::Style),
            Self::Style => Ok(Self::Quality),
            Self::Quality => Ok(Self::Completed),
            Self::Completed | Self::Failed => Err(FlowError::invalid_transition(
                self,
                self,
                "terminal stage has no successor",
            )),
        }
    }

    /// Returns true for the two terminal stages.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Check whether `to` is a legal direct transition target from this stage.
    ///
    /// `Failed` is reachable from any non-terminal stage; everything else
    /// must be the unique successor.
    #[must_use]
    pub fn can_transition_to(self, to: Stage) -> bool {
        if self.is_terminal() {
            return false;
        }
        if to == Self::Failed {
            return true;
        }
        self.successor().map(|next| next == to).unwrap_or(false)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Validate => "validate",
            Self::Research => "research",
            Self::Audience => "audience",
            Self::Draft => "draft",
            Self::Style => "style",
            Self::Quality => "quality",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_successor_chain_is_linear() {
        let mut stage = Stage::Validate;
        let mut visited = vec![stage];
        while !stage.is_terminal() {
            stage = stage.successor().unwrap();
            assert!(!visited.contains(&stage), "cycle at {}", stage);
            visited.push(stage);
        }
        assert_eq!(stage, Stage::Completed);
        assert_eq!(visited.len(), 7);
    }

    #[test]
    fn test_successor_is_pure() {
        // Same input, same output, twice.
        assert_eq!(Stage::Draft.successor().unwrap(), Stage::Style);
        assert_eq!(Stage::Draft.successor().unwrap(), Stage::Style);
    }

    #[test]
    fn test_terminal_stages_have_no_successor() {
        assert!(Stage::Completed.successor().is_err());
        assert!(Stage::Failed.successor().is_err());
        assert!(Stage::Completed.is_terminal());
        assert!(Stage::Failed.is_terminal());
        assert!(!Stage::Quality.is_terminal());
    }

    #[test]
    fn test_failed_reachable_from_any_working_stage() {
        for stage in Stage::pipeline() {
            assert!(stage.can_transition_to(Stage::Failed));
        }
        assert!(!Stage::Completed.can_transition_to(Stage::Failed));
    }

    #[test]
    fn test_no_backwards_transitions() {
        assert!(!Stage::Draft.can_transition_to(Stage::Validate));
        assert!(!Stage::Quality.can_transition_to(Stage::Draft));
        assert!(Stage::Draft.can_transition_to(Stage::Style));
    }

    #[test]
    fn test_display_roundtrip_serde() {
        let json = serde_json::to_string(&Stage::Audience).unwrap();
        assert_eq!(json, "\"audience\"");
        let back: Stage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Stage::Audience);
    }
}

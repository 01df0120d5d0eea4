//! Ultra-plan phase state
//!
//! The phase DAG is fixed:
//!
//!   Planning -> PlanSelection (multi-pass only) -> Refresh -> Execution
//!   -> Synthesis <-> Revision -> Consolidation -> Done
//!
//! The variant carried in the session record is the single source of truth
//! for where a run stands; resuming a session re-enters the recorded phase.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum Phase {
    Planning,
    PlanSelection,
    Refresh,
    Execution { group: usize },
    Synthesis,
    Revision { round: u32 },
    Consolidation,
    Done,
}

impl Phase {
    pub fn label(&self) -> &'static str {
        match self {
            Phase::Planning => "planning",
            Phase::PlanSelection => "plan_selection",
            Phase::Refresh => "refresh",
            Phase::Execution { .. } => "execution",
            Phase::Synthesis => "synthesis",
            Phase::Revision { .. } => "revision",
            Phase::Consolidation => "consolidation",
            Phase::Done => "done",
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Phase::Done)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Execution { group } => write!(f, "execution (group {})", group),
            Phase::Revision { round } => write!(f, "revision (round {})", round),
            other => write!(f, "{}", other.label()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_serialization() {
        let phase = Phase::Execution { group: 2 };
        let json = serde_json::to_string(&phase).unwrap();
        assert_eq!(json, r#"{"name":"execution","group":2}"#);

        let back: Phase = serde_json::from_str(&json).unwrap();
        assert_eq!(back, phase);
    }

    #[test]
    fn test_labels() {
        assert_eq!(Phase::Planning.label(), "planning");
        assert_eq!(Phase::Revision { round: 1 }.label(), "revision");
        assert!(Phase::Done.is_done());
        assert!(!Phase::Synthesis.is_done());
    }
}

//! Completion sentinel files
//!
//! Agents signal completion by writing a phase-named JSON file at the root
//! of their worktree. Files anywhere below the root are ignored. Unknown
//! fields are tolerated; a file that fails to parse is reported as
//! malformed and the instance keeps working.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::plan::Plan;
use crate::utils::error::{ClaudioError, Result};

pub const TASK_SENTINEL: &str = ".claudio-task-complete.json";
pub const SYNTHESIS_SENTINEL: &str = ".claudio-synthesis-complete.json";
pub const REVISION_SENTINEL: &str = ".claudio-revision-complete.json";
pub const CONSOLIDATION_SENTINEL: &str = ".claudio-consolidation-complete.json";
pub const GROUP_CONSOLIDATION_SENTINEL: &str = ".claudio-group-consolidation-complete.json";
pub const PLAN_FILE: &str = ".claudio-plan.json";

/// Declared completion state common to every sentinel schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Complete,
    Partial,
    Blocked,
    Failed,
    NeedsRevision,
}

impl CompletionStatus {
    /// Whether the declaring instance finished its work. `needs_revision`
    /// is a finished synthesis verdict, not an agent failure.
    pub fn is_success(self) -> bool {
        matches!(self, CompletionStatus::Complete | CompletionStatus::NeedsRevision)
    }
}

/// Which sentinel a supervisor watches for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentinelKind {
    Task,
    Synthesis,
    Revision,
    Consolidation,
    GroupConsolidation,
    /// Planning and plan selection: the plan document itself is the signal.
    Plan,
}

impl SentinelKind {
    pub fn filename(self) -> &'static str {
        match self {
            SentinelKind::Task => TASK_SENTINEL,
            SentinelKind::Synthesis => SYNTHESIS_SENTINEL,
            SentinelKind::Revision => REVISION_SENTINEL,
            SentinelKind::Consolidation => CONSOLIDATION_SENTINEL,
            SentinelKind::GroupConsolidation => GROUP_CONSOLIDATION_SENTINEL,
            SentinelKind::Plan => PLAN_FILE,
        }
    }
}

/// Task execution result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCompletion {
    pub status: CompletionStatus,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub branch_name: Option<String>,
    /// Set by the plan-selection manager: "select" or "merge".
    #[serde(default)]
    pub action: Option<String>,
    /// Candidate index for action="select"; -1 for action="merge".
    #[serde(default)]
    pub selected_index: Option<i64>,
}

/// One issue raised by a synthesis review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisIssue {
    pub task_id: String,
    pub description: String,
    #[serde(default)]
    pub severity: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisCompletion {
    pub status: CompletionStatus,
    #[serde(default)]
    pub issues_found: Vec<SynthesisIssue>,
    #[serde(default)]
    pub notes: String,
}

/// Per-task revision result. `revision_round` is 1-based: the first
/// revision of a task reports round 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevisionCompletion {
    pub status: CompletionStatus,
    #[serde(default)]
    pub revision_round: u32,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub files_modified: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidationCompletion {
    pub status: CompletionStatus,
    #[serde(default)]
    pub pr_urls: Vec<String>,
    #[serde(default)]
    pub notes: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Verification {
    #[serde(default)]
    pub overall_success: bool,
    #[serde(default)]
    pub details: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConsolidationCompletion {
    pub status: CompletionStatus,
    #[serde(default)]
    pub branch_name: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub issues_for_next_group: Vec<String>,
    #[serde(default)]
    pub verification: Option<Verification>,
}

/// A parsed sentinel, tagged by phase.
#[derive(Debug, Clone)]
pub enum Completion {
    Task(TaskCompletion),
    Synthesis(SynthesisCompletion),
    Revision(RevisionCompletion),
    Consolidation(ConsolidationCompletion),
    GroupConsolidation(GroupConsolidationCompletion),
    Plan(Box<Plan>),
}

impl Completion {
    pub fn status(&self) -> CompletionStatus {
        match self {
            Completion::Task(c) => c.status,
            Completion::Synthesis(c) => c.status,
            Completion::Revision(c) => c.status,
            Completion::Consolidation(c) => c.status,
            Completion::GroupConsolidation(c) => c.status,
            // A plan file that parsed is a completed planning run.
            Completion::Plan(_) => CompletionStatus::Complete,
        }
    }
}

/// Look for the phase sentinel at the worktree root only. Returns
/// `Ok(None)` while the file has not appeared.
pub fn poll_sentinel(worktree_root: &Path, kind: SentinelKind) -> Result<Option<Completion>> {
    let path = worktree_root.join(kind.filename());
    if !path.exists() {
        return Ok(None);
    }
    parse_sentinel(&path, kind).map(Some)
}

pub fn parse_sentinel(path: &Path, kind: SentinelKind) -> Result<Completion> {
    let raw = std::fs::read_to_string(path).map_err(ClaudioError::Io)?;
    let malformed = |reason: String| ClaudioError::MalformedSentinel {
        path: PathBuf::from(path),
        reason,
    };
    let completion = match kind {
        SentinelKind::Task => Completion::Task(
            serde_json::from_str(&raw).map_err(|e| malformed(e.to_string()))?,
        ),
        SentinelKind::Synthesis => Completion::Synthesis(
            serde_json::from_str(&raw).map_err(|e| malformed(e.to_string()))?,
        ),
        SentinelKind::Revision => Completion::Revision(
            serde_json::from_str(&raw).map_err(|e| malformed(e.to_string()))?,
        ),
        SentinelKind::Consolidation => Completion::Consolidation(
            serde_json::from_str(&raw).map_err(|e| malformed(e.to_string()))?,
        ),
        SentinelKind::GroupConsolidation => Completion::GroupConsolidation(
            serde_json::from_str(&raw).map_err(|e| malformed(e.to_string()))?,
        ),
        SentinelKind::Plan => Completion::Plan(Box::new(
            serde_json::from_str(&raw).map_err(|e| malformed(e.to_string()))?,
        )),
    };
    Ok(completion)
}

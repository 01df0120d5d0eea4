//! Session and instance data model
//!
//! A session is the unit of persistence: an ordered list of instances plus
//! an optional ultra-plan sub-record. Entities reference each other by
//! stable id; nothing here holds a live process.

pub mod lock;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use uuid::Uuid;

use crate::config::ConsolidationMode;
use crate::instance::sentinel::SynthesisIssue;
use crate::orchestrator::phase::Phase;
use crate::plan::Plan;

pub use lock::{LockInfo, SessionLock};
pub use store::SessionStore;

pub type SessionId = String;
pub type InstanceId = String;

/// Short id form used in branch and tmux names.
pub fn short_id(id: &str) -> &str {
    &id[..id.len().min(8)]
}

/// Current status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Created; worktree and process may not exist yet.
    Pending,
    /// Agent process is running.
    Working,
    /// Agent appears to be waiting for user input.
    WaitingInput,
    /// Output stopped advancing past the activity timeout.
    Stuck,
    Completed,
    Error,
    Timeout,
    /// Paused by a budget breach or the user; may re-enter `Working`.
    Paused,
}

impl InstanceStatus {
    /// Terminal with respect to spawning: no further process will run.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed
                | InstanceStatus::Error
                | InstanceStatus::Timeout
                | InstanceStatus::Stuck
        )
    }

    pub fn is_failure(self) -> bool {
        matches!(
            self,
            InstanceStatus::Error | InstanceStatus::Timeout | InstanceStatus::Stuck
        )
    }

    pub fn is_active(self) -> bool {
        matches!(self, InstanceStatus::Working | InstanceStatus::WaitingInput)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::Working => "working",
            InstanceStatus::WaitingInput => "waiting_input",
            InstanceStatus::Stuck => "stuck",
            InstanceStatus::Completed => "completed",
            InstanceStatus::Error => "error",
            InstanceStatus::Timeout => "timeout",
            InstanceStatus::Paused => "paused",
        };
        write!(f, "{}", s)
    }
}

/// Accumulated agent usage for one instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceMetrics {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    pub cost_usd: f64,
    pub api_calls: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl InstanceMetrics {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cache_read_tokens + self.cache_write_tokens
    }

    pub fn merge_totals(&mut self, other: &InstanceMetrics) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_write_tokens += other.cache_write_tokens;
        self.cost_usd += other.cost_usd;
        self.api_calls += other.api_calls;
    }
}

/// One agent run, bound to a worktree and branch for its whole life.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    /// Human task description.
    pub task: String,
    pub branch: String,
    pub worktree_path: PathBuf,
    pub status: InstanceStatus,
    #[serde(default)]
    pub depends_on: Vec<InstanceId>,
    #[serde(default)]
    pub metrics: InstanceMetrics,
    #[serde(default)]
    pub modified_files: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Instance {
    pub fn new(task: String, branch: String, worktree_path: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task,
            branch,
            worktree_path,
            status: InstanceStatus::Pending,
            depends_on: Vec::new(),
            metrics: InstanceMetrics::default(),
            modified_files: Vec::new(),
            created_at: Utc::now(),
            last_error: None,
        }
    }

    pub fn with_dependencies(mut self, deps: Vec<InstanceId>) -> Self {
        self.depends_on = deps;
        self
    }
}

/// Strategy-labelled candidate produced by one multi-pass planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidatePlan {
    pub strategy: String,
    pub plan: Plan,
}

/// Record of one group consolidator run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConsolidation {
    pub group: usize,
    pub branch: String,
    pub instance_id: InstanceId,
    #[serde(default)]
    pub notes: String,
    pub verification_passed: bool,
    #[serde(default)]
    pub issues_for_next_group: Vec<String>,
}

/// Runtime options for one ultra-plan run, frozen at start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UltraPlanRunConfig {
    pub max_parallel: usize,
    pub dry_run: bool,
    pub skip_synthesis: bool,
    pub auto_approve: bool,
    pub review: bool,
    pub multi_pass: bool,
    pub consolidation_mode: ConsolidationMode,
    pub max_revision_rounds: u32,
}

/// Ultra-plan state carried inside a session record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UltraPlanSession {
    pub objective: String,
    pub phase: Phase,
    /// Nil until planning completes; immutable after selection.
    #[serde(default)]
    pub plan: Option<Plan>,
    #[serde(default)]
    pub candidate_plans: Vec<CandidatePlan>,
    /// Index into `candidate_plans`, or `None` when plans were merged.
    #[serde(default)]
    pub selected_candidate: Option<usize>,
    pub config: UltraPlanRunConfig,
    /// Planner instance ids (one per strategy in multi-pass).
    #[serde(default)]
    pub planner_instances: Vec<InstanceId>,
    #[serde(default)]
    pub manager_instance: Option<InstanceId>,
    /// Task id -> instance id for the execution phase.
    #[serde(default)]
    pub task_instances: HashMap<String, InstanceId>,
    #[serde(default)]
    pub synthesis_instance: Option<InstanceId>,
    #[serde(default)]
    pub consolidation_instance: Option<InstanceId>,
    #[serde(default)]
    pub group_consolidations: Vec<GroupConsolidation>,
    /// Completed synthesis-revision rounds.
    #[serde(default)]
    pub revision_rounds: u32,
    /// Issues from the last synthesis pass, awaiting revision.
    #[serde(default)]
    pub pending_issues: Vec<SynthesisIssue>,
    #[serde(default)]
    pub error: Option<String>,
}

impl UltraPlanSession {
    pub fn new(objective: String, config: UltraPlanRunConfig) -> Self {
        Self {
            objective,
            phase: Phase::Planning,
            plan: None,
            candidate_plans: Vec::new(),
            selected_candidate: None,
            config,
            planner_instances: Vec::new(),
            manager_instance: None,
            task_instances: HashMap::new(),
            synthesis_instance: None,
            consolidation_instance: None,
            group_consolidations: Vec::new(),
            revision_rounds: 0,
            pending_issues: Vec::new(),
            error: None,
        }
    }

    /// Consolidated branch a group's work should stack onto.
    pub fn base_branch_for_group(&self, group: usize, main_branch: &str) -> String {
        if group == 0 {
            return main_branch.to_string();
        }
        self.group_consolidations
            .iter()
            .find(|g| g.group == group - 1)
            .map(|g| g.branch.clone())
            .unwrap_or_else(|| main_branch.to_string())
    }
}

/// The persisted unit: a named run with its instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub instances: Vec<Instance>,
    #[serde(default)]
    pub ultra_plan: Option<UltraPlanSession>,
}

impl Session {
    pub fn new(name: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            created_at: Utc::now(),
            instances: Vec::new(),
            ultra_plan: None,
        }
    }

    pub fn instance(&self, id: &str) -> Option<&Instance> {
        self.instances.iter().find(|i| i.id == id)
    }

    pub fn instance_mut(&mut self, id: &str) -> Option<&mut Instance> {
        self.instances.iter_mut().find(|i| i.id == id)
    }

    pub fn add_instance(&mut self, instance: Instance) -> InstanceId {
        let id = instance.id.clone();
        self.instances.push(instance);
        id
    }

    pub fn active_instances(&self) -> impl Iterator<Item = &Instance> {
        self.instances.iter().filter(|i| i.status.is_active())
    }

    pub fn total_cost_usd(&self) -> f64 {
        self.instances.iter().map(|i| i.metrics.cost_usd).sum()
    }
}

/// Summary row for `sessions list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub instance_count: usize,
    pub active_count: usize,
    pub phase: Option<Phase>,
}

impl From<&Session> for SessionInfo {
    fn from(s: &Session) -> Self {
        Self {
            id: s.id.clone(),
            name: s.name.clone(),
            created_at: s.created_at,
            instance_count: s.instances.len(),
            active_count: s.active_instances().count(),
            phase: s.ultra_plan.as_ref().map(|u| u.phase.clone()),
        }
    }
}

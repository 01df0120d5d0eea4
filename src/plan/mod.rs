//! Plan model and execution-order derivation

pub mod validate;

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::utils::error::{ClaudioError, Result};

pub use validate::{validate, Severity, ValidationMessage, ValidationResult};

/// Complexity tag for a planned task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

/// A single unit of work produced by a planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedTask {
    /// Stable id, referenced by `depends_on` entries.
    pub id: String,
    #[serde(default)]
    pub title: String,
    /// The agent prompt body for this task.
    #[serde(default)]
    pub description: String,
    /// Files the planner expects this task to touch.
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Lower runs earlier within a group.
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub complexity: Option<Complexity>,
}

/// A validated plan is immutable after selection; revisions re-enter task
/// worktrees without mutating it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub executive_summary: String,
    #[serde(default)]
    pub insights: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub tasks: Vec<PlannedTask>,
}

impl Plan {
    pub fn task(&self, id: &str) -> Option<&PlannedTask> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Task id -> predecessor ids.
    pub fn dependency_graph(&self) -> HashMap<&str, Vec<&str>> {
        self.tasks
            .iter()
            .map(|t| {
                (
                    t.id.as_str(),
                    t.depends_on.iter().map(String::as_str).collect(),
                )
            })
            .collect()
    }
}

/// Group-wise topological sort.
///
/// Each group is the set of tasks whose predecessors have all been scheduled
/// in earlier groups. Within a group, order is priority ascending then id
/// lexicographic, which makes the derivation deterministic.
pub fn derive_execution_order(plan: &Plan) -> Result<Vec<Vec<String>>> {
    let known: HashSet<&str> = plan.tasks.iter().map(|t| t.id.as_str()).collect();
    for task in &plan.tasks {
        for dep in &task.depends_on {
            if !known.contains(dep.as_str()) {
                return Err(ClaudioError::PlanInvalid(format!(
                    "task '{}' depends on unknown task '{}'",
                    task.id, dep
                )));
            }
        }
    }

    let mut scheduled: HashSet<&str> = HashSet::new();
    let mut remaining: Vec<&PlannedTask> = plan.tasks.iter().collect();
    let mut groups: Vec<Vec<String>> = Vec::new();

    while !remaining.is_empty() {
        let mut ready: Vec<&PlannedTask> = remaining
            .iter()
            .copied()
            .filter(|t| t.depends_on.iter().all(|d| scheduled.contains(d.as_str())))
            .collect();

        if ready.is_empty() {
            let mut cycle: Vec<String> = remaining.iter().map(|t| t.id.clone()).collect();
            cycle.sort();
            return Err(ClaudioError::PlanInvalid(format!(
                "dependency cycle among tasks: {}",
                cycle.join(", ")
            )));
        }

        ready.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.id.cmp(&b.id)));
        let ids: Vec<String> = ready.iter().map(|t| t.id.clone()).collect();
        for t in &ready {
            scheduled.insert(t.id.as_str());
        }
        remaining.retain(|t| !scheduled.contains(t.id.as_str()));
        groups.push(ids);
    }

    Ok(groups)
}

//! Phase prompt builders
//!
//! One builder per phase, each over a typed context. Builders validate
//! their required fields up front and fail with field-named errors. Every
//! rendered prompt ends with a Completion Protocol section naming the
//! phase sentinel, its JSON schema, and the worktree-root placement rule.

use crate::config::ConsolidationMode;
use crate::instance::sentinel::{
    CONSOLIDATION_SENTINEL, GROUP_CONSOLIDATION_SENTINEL, PLAN_FILE, REVISION_SENTINEL,
    SYNTHESIS_SENTINEL, TASK_SENTINEL,
};
use crate::instance::sentinel::SynthesisIssue;
use crate::plan::{Plan, PlannedTask};
use crate::session::{CandidatePlan, GroupConsolidation};

/// Strategy labels for multi-pass planning, one per planner.
pub const PLANNING_STRATEGIES: [&str; 3] = [
    "maximize-parallelism",
    "minimize-complexity",
    "balanced-approach",
];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PromptError {
    #[error("missing required field '{field}' for {phase} prompt")]
    MissingField {
        phase: &'static str,
        field: &'static str,
    },
}

fn require(
    phase: &'static str,
    field: &'static str,
    present: bool,
) -> Result<(), PromptError> {
    if present {
        Ok(())
    } else {
        Err(PromptError::MissingField { phase, field })
    }
}

fn completion_protocol(filename: &str, schema: &str) -> String {
    format!(
        "\n## Completion Protocol\n\n\
         When your work is finished, write a file named `{filename}` at the \
         ROOT of this worktree. The file is only recognized at the root; a \
         copy in any subdirectory is ignored. It must be valid JSON with \
         this shape:\n\n```json\n{schema}\n```\n\n\
         Writing this file is your final action. No further user interaction \
         will occur; do not ask questions or wait for confirmation.\n"
    )
}

pub struct PlanningContext<'a> {
    pub session_id: &'a str,
    pub objective: &'a str,
    /// Multi-pass strategy label; None for single-pass planning.
    pub strategy: Option<&'a str>,
}

pub fn build_planning_prompt(ctx: &PlanningContext) -> Result<String, PromptError> {
    require("planning", "session_id", !ctx.session_id.is_empty())?;
    require("planning", "objective", !ctx.objective.trim().is_empty())?;

    let mut prompt = format!(
        "# Planning\n\nSession: {}\n\nYou are the planning coordinator for this \
         objective:\n\n> {}\n\nDecompose the objective into independent tasks \
         suitable for parallel execution by separate coding agents, each in its \
         own git worktree. For each task give a stable id, a short title, a full \
         prompt-ready description, the files you expect it to touch, its \
         dependencies on other task ids, a priority (lower runs earlier), and a \
         complexity tag (low, medium, or high). Task descriptions must be \
         self-contained; agents cannot see each other's instructions.\n",
        ctx.session_id, ctx.objective
    );
    if let Some(strategy) = ctx.strategy {
        prompt.push_str(&format!(
            "\nApply the `{}` strategy when shaping the task graph.\n",
            strategy
        ));
    }
    prompt.push_str(&completion_protocol(
        PLAN_FILE,
        r#"{
  "executive_summary": "one paragraph",
  "insights": ["..."],
  "constraints": ["..."],
  "tasks": [
    {
      "id": "t1",
      "title": "short title",
      "description": "full agent prompt body",
      "files": ["src/lib.rs"],
      "depends_on": [],
      "priority": 1,
      "complexity": "medium"
    }
  ]
}"#,
    ));
    Ok(prompt)
}

pub struct SelectionContext<'a> {
    pub session_id: &'a str,
    pub objective: &'a str,
    pub candidates: &'a [CandidatePlan],
}

pub fn build_plan_selection_prompt(ctx: &SelectionContext) -> Result<String, PromptError> {
    require("plan-selection", "session_id", !ctx.session_id.is_empty())?;
    require("plan-selection", "objective", !ctx.objective.trim().is_empty())?;
    require("plan-selection", "candidates", !ctx.candidates.is_empty())?;

    let mut prompt = format!(
        "# Plan Selection\n\nSession: {}\n\nObjective:\n\n> {}\n\nThree planners \
         produced candidate plans with different strategies. Choose the best one, \
         or merge their strongest parts into a new plan.\n",
        ctx.session_id, ctx.objective
    );
    for (index, candidate) in ctx.candidates.iter().enumerate() {
        prompt.push_str(&format!(
            "\n## Candidate {} (strategy: {})\n\n```json\n{}\n```\n",
            index,
            candidate.strategy,
            serde_json::to_string_pretty(&candidate.plan).unwrap_or_default()
        ));
    }
    prompt.push_str(&format!(
        "\nIf you merge, write the merged plan to `{}` at the worktree root \
         first, using the same schema the candidates use.\n",
        PLAN_FILE
    ));
    prompt.push_str(&completion_protocol(
        TASK_SENTINEL,
        r#"{
  "status": "complete",
  "action": "select" or "merge",
  "selected_index": 0 (the chosen candidate, or -1 when action is "merge"),
  "summary": "why"
}"#,
    ));
    Ok(prompt)
}

pub struct TaskContext<'a> {
    pub session_id: &'a str,
    pub objective: &'a str,
    pub task: &'a PlannedTask,
    pub plan_summary: &'a str,
    pub group_index: usize,
    /// Consolidator record of the previous group, when group_index > 0.
    pub previous_group: Option<&'a GroupConsolidation>,
}

pub fn build_task_prompt(ctx: &TaskContext) -> Result<String, PromptError> {
    require("task", "session_id", !ctx.session_id.is_empty())?;
    require("task", "objective", !ctx.objective.trim().is_empty())?;
    require("task", "task.description", !ctx.task.description.trim().is_empty())?;

    let mut prompt = format!(
        "# Task {}: {}\n\nSession: {}\n\nOverall objective:\n\n> {}\n\n",
        ctx.task.id, ctx.task.title, ctx.session_id, ctx.objective
    );
    if !ctx.plan_summary.trim().is_empty() {
        prompt.push_str(&format!("Plan summary: {}\n\n", ctx.plan_summary));
    }
    prompt.push_str(&format!("## Your task\n\n{}\n", ctx.task.description));
    if !ctx.task.files.is_empty() {
        prompt.push_str(&format!(
            "\nExpected files: {}\n",
            ctx.task.files.join(", ")
        ));
    }
    if let Some(prev) = ctx.previous_group {
        prompt.push_str(&format!(
            "\n## Context from group {}\n\nConsolidator notes: {}\n",
            prev.group, prev.notes
        ));
        if !prev.issues_for_next_group.is_empty() {
            prompt.push_str("\nKnown issues to account for:\n");
            for issue in &prev.issues_for_next_group {
                prompt.push_str(&format!("- {}\n", issue));
            }
        }
    }
    prompt.push_str(
        "\nCommit your work to the current branch. Stay inside this worktree; \
         never write into another instance's checkout.\n",
    );
    prompt.push_str(&completion_protocol(
        TASK_SENTINEL,
        r#"{
  "status": "complete" | "partial" | "blocked" | "failed",
  "summary": "what was done",
  "files_modified": ["src/lib.rs"],
  "branch_name": "the branch you committed to"
}"#,
    ));
    Ok(prompt)
}

pub struct SynthesisContext<'a> {
    pub session_id: &'a str,
    pub objective: &'a str,
    pub plan: &'a Plan,
    /// (task id, completion summary) for every executed task.
    pub task_results: &'a [(String, String)],
}

pub fn build_synthesis_prompt(ctx: &SynthesisContext) -> Result<String, PromptError> {
    require("synthesis", "session_id", !ctx.session_id.is_empty())?;
    require("synthesis", "objective", !ctx.objective.trim().is_empty())?;
    require("synthesis", "plan", !ctx.plan.tasks.is_empty())?;

    let mut prompt = format!(
        "# Synthesis Review\n\nSession: {}\n\nObjective:\n\n> {}\n\nEvery planned \
         task has executed. Review the combined result for gaps, regressions, \
         and cross-task inconsistencies. Emit `needs_revision` with concrete \
         per-task issues if anything must be fixed before consolidation.\n\n\
         ## Task results\n",
        ctx.session_id, ctx.objective
    );
    for (task_id, summary) in ctx.task_results {
        prompt.push_str(&format!("- {}: {}\n", task_id, summary));
    }
    prompt.push_str(&completion_protocol(
        SYNTHESIS_SENTINEL,
        r#"{
  "status": "complete" | "needs_revision",
  "issues_found": [
    {"task_id": "t2", "description": "what is wrong", "severity": "high"}
  ],
  "notes": "overall assessment"
}"#,
    ));
    Ok(prompt)
}

pub struct RevisionContext<'a> {
    pub session_id: &'a str,
    pub task: &'a PlannedTask,
    pub issues: &'a [SynthesisIssue],
    /// 1-based: the first revision of a task is round 1.
    pub round: u32,
}

pub fn build_revision_prompt(ctx: &RevisionContext) -> Result<String, PromptError> {
    require("revision", "session_id", !ctx.session_id.is_empty())?;
    require("revision", "issues", !ctx.issues.is_empty())?;
    require("revision", "round", ctx.round >= 1)?;

    let mut prompt = format!(
        "# Revision (round {}) of task {}: {}\n\nSession: {}\n\nYou are back in \
         the worktree where this task was implemented. The synthesis review \
         found issues that must be fixed:\n\n",
        ctx.round, ctx.task.id, ctx.task.title, ctx.session_id
    );
    for issue in ctx.issues {
        prompt.push_str(&format!("- {}\n", issue.description));
    }
    prompt.push_str(
        "\nFix these issues on the current branch. Do not change the scope of \
         the original task.\n",
    );
    prompt.push_str(&completion_protocol(
        REVISION_SENTINEL,
        r#"{
  "status": "complete" | "blocked" | "failed",
  "revision_round": 1,
  "notes": "what changed",
  "files_modified": ["src/lib.rs"]
}"#,
    ));
    Ok(prompt)
}

pub struct ConsolidationContext<'a> {
    pub session_id: &'a str,
    pub objective: &'a str,
    pub group_branches: &'a [String],
    pub mode: ConsolidationMode,
    pub main_branch: &'a str,
}

pub fn build_consolidation_prompt(ctx: &ConsolidationContext) -> Result<String, PromptError> {
    require("consolidation", "session_id", !ctx.session_id.is_empty())?;
    require(
        "consolidation",
        "group_branches",
        !ctx.group_branches.is_empty(),
    )?;

    let mode_line = match ctx.mode {
        ConsolidationMode::Stacked => {
            "Create one PR per group branch, each stacked onto the previous \
             group's PR; the first targets the main branch."
        }
        ConsolidationMode::Single => {
            "Create a single PR containing all group branches merged together, \
             targeting the main branch."
        }
    };
    let mut prompt = format!(
        "# Consolidation\n\nSession: {}\n\nObjective:\n\n> {}\n\nAll groups are \
         consolidated on these branches (in execution order):\n\n",
        ctx.session_id, ctx.objective
    );
    for branch in ctx.group_branches {
        prompt.push_str(&format!("- {}\n", branch));
    }
    prompt.push_str(&format!(
        "\nMain branch: {}\n\n{}\n",
        ctx.main_branch, mode_line
    ));
    prompt.push_str(&completion_protocol(
        CONSOLIDATION_SENTINEL,
        r#"{
  "status": "complete" | "blocked" | "failed",
  "pr_urls": ["https://..."],
  "notes": "anything reviewers should know"
}"#,
    ));
    Ok(prompt)
}

pub struct GroupConsolidationContext<'a> {
    pub session_id: &'a str,
    pub objective: &'a str,
    pub group_index: usize,
    pub task_branches: &'a [String],
    /// Previous group's consolidated branch, or the main branch for group 0.
    pub base_branch: &'a str,
    pub target_branch: &'a str,
}

pub fn build_group_consolidation_prompt(
    ctx: &GroupConsolidationContext,
) -> Result<String, PromptError> {
    require("group-consolidation", "session_id", !ctx.session_id.is_empty())?;
    require(
        "group-consolidation",
        "task_branches",
        !ctx.task_branches.is_empty(),
    )?;
    require(
        "group-consolidation",
        "base_branch",
        !ctx.base_branch.is_empty(),
    )?;

    let mut prompt = format!(
        "# Group {} Consolidation\n\nSession: {}\n\nObjective:\n\n> {}\n\nMerge \
         the group's task branches into `{}`, which starts from `{}`:\n\n",
        ctx.group_index, ctx.session_id, ctx.objective, ctx.target_branch, ctx.base_branch
    );
    for branch in ctx.task_branches {
        prompt.push_str(&format!("- {}\n", branch));
    }
    prompt.push_str(
        "\nResolve conflicts in favor of the objective. Build and run the test \
         suite after merging; report the result in the verification block. \
         Record anything the next group's agents must know under \
         `issues_for_next_group`.\n",
    );
    prompt.push_str(&completion_protocol(
        GROUP_CONSOLIDATION_SENTINEL,
        r#"{
  "status": "complete" | "blocked" | "failed",
  "branch_name": "the consolidated branch",
  "notes": "merge summary",
  "issues_for_next_group": ["..."],
  "verification": {"overall_success": true, "details": "tests green"}
}"#,
    ));
    Ok(prompt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Complexity;

    fn sample_task() -> PlannedTask {
        PlannedTask {
            id: "t1".to_string(),
            title: "Add config".to_string(),
            description: "Wire up the config loader".to_string(),
            files: vec!["src/config.rs".to_string()],
            depends_on: Vec::new(),
            priority: 1,
            complexity: Some(Complexity::Low),
        }
    }

    #[test]
    fn test_planning_prompt_names_sentinel() {
        let prompt = build_planning_prompt(&PlanningContext {
            session_id: "sid",
            objective: "ship the feature",
            strategy: None,
        })
        .unwrap();
        assert!(prompt.contains(PLAN_FILE));
        assert!(prompt.contains("Completion Protocol"));
        assert!(prompt.contains("ROOT of this worktree"));
    }

    #[test]
    fn test_planning_strategy_embedded() {
        let prompt = build_planning_prompt(&PlanningContext {
            session_id: "sid",
            objective: "obj",
            strategy: Some("maximize-parallelism"),
        })
        .unwrap();
        assert!(prompt.contains("maximize-parallelism"));
    }

    #[test]
    fn test_missing_objective_is_field_named() {
        let err = build_planning_prompt(&PlanningContext {
            session_id: "sid",
            objective: "  ",
            strategy: None,
        })
        .unwrap_err();
        assert_eq!(
            err,
            PromptError::MissingField {
                phase: "planning",
                field: "objective"
            }
        );
    }

    #[test]
    fn test_task_prompt_threads_previous_group() {
        let prev = GroupConsolidation {
            group: 0,
            branch: "claudio/ultraplan-x-group-0".to_string(),
            instance_id: "i".to_string(),
            notes: "auth module landed".to_string(),
            verification_passed: true,
            issues_for_next_group: vec!["rename pending".to_string()],
        };
        let task = sample_task();
        let prompt = build_task_prompt(&TaskContext {
            session_id: "sid",
            objective: "obj",
            task: &task,
            plan_summary: "summary",
            group_index: 1,
            previous_group: Some(&prev),
        })
        .unwrap();
        assert!(prompt.contains("auth module landed"));
        assert!(prompt.contains("rename pending"));
        assert!(prompt.contains(TASK_SENTINEL));
    }

    #[test]
    fn test_task_prompt_requires_description() {
        let mut task = sample_task();
        task.description = String::new();
        let err = build_task_prompt(&TaskContext {
            session_id: "sid",
            objective: "obj",
            task: &task,
            plan_summary: "",
            group_index: 0,
            previous_group: None,
        })
        .unwrap_err();
        assert!(matches!(
            err,
            PromptError::MissingField {
                field: "task.description",
                ..
            }
        ));
    }

    #[test]
    fn test_selection_prompt_lists_candidates() {
        let candidates = vec![
            CandidatePlan {
                strategy: "maximize-parallelism".to_string(),
                plan: Plan {
                    tasks: vec![sample_task()],
                    ..Default::default()
                },
            },
            CandidatePlan {
                strategy: "balanced-approach".to_string(),
                plan: Plan {
                    tasks: vec![sample_task()],
                    ..Default::default()
                },
            },
        ];
        let prompt = build_plan_selection_prompt(&SelectionContext {
            session_id: "sid",
            objective: "obj",
            candidates: &candidates,
        })
        .unwrap();
        assert!(prompt.contains("Candidate 0"));
        assert!(prompt.contains("balanced-approach"));
        assert!(prompt.contains("selected_index"));
    }

    #[test]
    fn test_revision_round_is_one_based() {
        let task = sample_task();
        let issues = vec![SynthesisIssue {
            task_id: "t1".to_string(),
            description: "missing tests".to_string(),
            severity: None,
        }];
        let err = build_revision_prompt(&RevisionContext {
            session_id: "sid",
            task: &task,
            issues: &issues,
            round: 0,
        })
        .unwrap_err();
        assert!(matches!(err, PromptError::MissingField { field: "round", .. }));

        let prompt = build_revision_prompt(&RevisionContext {
            session_id: "sid",
            task: &task,
            issues: &issues,
            round: 1,
        })
        .unwrap();
        assert!(prompt.contains("round 1"));
        assert!(prompt.contains(REVISION_SENTINEL));
    }

    #[test]
    fn test_consolidation_modes() {
        let branches = vec!["claudio/ultraplan-x-group-0".to_string()];
        let stacked = build_consolidation_prompt(&ConsolidationContext {
            session_id: "sid",
            objective: "obj",
            group_branches: &branches,
            mode: ConsolidationMode::Stacked,
            main_branch: "main",
        })
        .unwrap();
        assert!(stacked.contains("one PR per group"));

        let single = build_consolidation_prompt(&ConsolidationContext {
            session_id: "sid",
            objective: "obj",
            group_branches: &branches,
            mode: ConsolidationMode::Single,
            main_branch: "main",
        })
        .unwrap();
        assert!(single.contains("single PR"));
    }

    #[test]
    fn test_group_consolidation_prompt() {
        let branches = vec!["claudio/t1".to_string(), "claudio/t2".to_string()];
        let prompt = build_group_consolidation_prompt(&GroupConsolidationContext {
            session_id: "sid",
            objective: "obj",
            group_index: 1,
            task_branches: &branches,
            base_branch: "claudio/ultraplan-x-group-0",
            target_branch: "claudio/ultraplan-x-group-1",
        })
        .unwrap();
        assert!(prompt.contains("issues_for_next_group"));
        assert!(prompt.contains(GROUP_CONSOLIDATION_SENTINEL));
        assert!(prompt.contains("claudio/ultraplan-x-group-0"));
    }
}

//! Ultra-plan phase coordinator
//!
//! Drives a session through planning, plan selection, group-wise
//! execution, synthesis with revision loops, and final consolidation.
//! The coordinator is the single writer of the session record; supervisor
//! events are mirrored into it through one subscription task, and the
//! record is persisted after every transition so a halted run can resume
//! from the recorded phase.

pub mod phase;

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::agent::{multiplexer_session_name, AgentRunner};
use crate::budget::BudgetManager;
use crate::config::ClaudioConfig;
use crate::coordination::{Event, EventBus, Topic};
use crate::git::{branch_name, group_branch_name, GitBackend};
use crate::instance::sentinel::{self, SynthesisIssue};
use crate::instance::{
    Completion, InstanceSupervisor, SentinelKind, SupervisionOutcome, SupervisorOptions,
};
use crate::plan::{derive_execution_order, validate, Plan, PlannedTask};
use crate::prompts::{self, PLANNING_STRATEGIES};
use crate::scheduler::{GroupScheduler, TaskLauncher};
use crate::session::{
    CandidatePlan, GroupConsolidation, Instance, InstanceId, InstanceStatus, Session,
    SessionStore, UltraPlanSession,
};
use crate::utils::error::{ClaudioError, Result};

pub use phase::Phase;

/// Coordinates one ultra-plan session. Cheap to clone; clones share all
/// state.
#[derive(Clone)]
pub struct UltraPlanCoordinator {
    session: Arc<Mutex<Session>>,
    store: Arc<SessionStore>,
    git: Arc<dyn GitBackend>,
    runner: Arc<AgentRunner>,
    bus: Arc<EventBus>,
    budget: Arc<BudgetManager>,
    config: ClaudioConfig,
    main_branch: String,
    cancel: CancellationToken,
}

impl UltraPlanCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: Session,
        store: Arc<SessionStore>,
        git: Arc<dyn GitBackend>,
        runner: Arc<AgentRunner>,
        bus: Arc<EventBus>,
        budget: Arc<BudgetManager>,
        config: ClaudioConfig,
        main_branch: String,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session: Arc::new(Mutex::new(session)),
            store,
            git,
            runner,
            bus,
            budget,
            config,
            main_branch,
            cancel,
        }
    }

    /// Run until `Done`, a phase failure, or cancellation. Re-enters the
    /// phase recorded in the session.
    pub async fn run(&self) -> Result<()> {
        let mirror = self.spawn_event_mirror();
        let result = self.drive().await;
        mirror.abort();

        if let Err(e) = &result {
            let mut session = self.session.lock().await;
            if let Some(ultra) = session.ultra_plan.as_mut() {
                ultra.error = Some(e.to_string());
            }
            let _ = self.store.save_session(&session);
        }
        result
    }

    async fn drive(&self) -> Result<()> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(ClaudioError::Cancelled);
            }
            let phase = self.current_phase().await?;
            tracing::info!("ultra-plan phase: {}", phase);
            match phase {
                Phase::Planning => self.run_planning().await?,
                Phase::PlanSelection => self.run_plan_selection().await?,
                Phase::Refresh => self.run_refresh().await?,
                Phase::Execution { group } => self.run_execution(group).await?,
                Phase::Synthesis => self.run_synthesis().await?,
                Phase::Revision { round } => self.run_revision(round).await?,
                Phase::Consolidation => self.run_consolidation().await?,
                Phase::Done => return Ok(()),
            }
        }
    }

    // ----- phase handlers -------------------------------------------------

    async fn run_planning(&self) -> Result<()> {
        let ultra = self.ultra().await?;

        // A preloaded plan (`--plan file`) skips spawning entirely; it is
        // validated here and the run proceeds straight to Refresh.
        if let Some(plan) = &ultra.plan {
            self.validate_or_fail(plan, "planning")?;
            self.set_phase(Phase::Refresh).await?;
            return Ok(());
        }

        if ultra.config.multi_pass {
            let mut handles = Vec::new();
            for strategy in PLANNING_STRATEGIES {
                let this = self.clone();
                let objective = ultra.objective.clone();
                handles.push(tokio::spawn(async move {
                    this.spawn_planner(&objective, Some(strategy)).await
                }));
            }
            let mut candidates = Vec::new();
            for (handle, strategy) in handles.into_iter().zip(PLANNING_STRATEGIES) {
                let (instance_id, plan) = handle
                    .await
                    .map_err(|e| ClaudioError::PhaseFailure {
                        phase: "planning".to_string(),
                        reason: format!("planner task panicked: {}", e),
                    })??;
                candidates.push((strategy.to_string(), instance_id, plan));
            }
            {
                let mut session = self.session.lock().await;
                let ultra = require_ultra(&mut session)?;
                for (strategy, instance_id, plan) in candidates {
                    ultra.planner_instances.push(instance_id);
                    ultra.candidate_plans.push(CandidatePlan { strategy, plan });
                }
                self.store.save_session(&session)?;
            }
            self.set_phase(Phase::PlanSelection).await?;
        } else {
            let (instance_id, plan) = self.spawn_planner(&ultra.objective, None).await?;
            self.validate_or_fail(&plan, "planning")?;
            {
                let mut session = self.session.lock().await;
                let ultra = require_ultra(&mut session)?;
                ultra.planner_instances.push(instance_id);
                ultra.plan = Some(plan);
                self.store.save_session(&session)?;
            }
            self.set_phase(Phase::Refresh).await?;
        }
        Ok(())
    }

    /// Spawn one planner and return its emitted plan.
    async fn spawn_planner(
        &self,
        objective: &str,
        strategy: Option<&str>,
    ) -> Result<(InstanceId, Plan)> {
        let session_id = self.session_id().await;
        let prompt = prompts::build_planning_prompt(&prompts::PlanningContext {
            session_id: &session_id,
            objective,
            strategy,
        })
        .map_err(|e| ClaudioError::PhaseFailure {
            phase: "planning".to_string(),
            reason: e.to_string(),
        })?;

        let title = match strategy {
            Some(s) => format!("plan ({})", s),
            None => "plan".to_string(),
        };
        let (instance_id, outcome) = self
            .spawn_instance(&title, &self.main_branch, SentinelKind::Plan, prompt)
            .await?;

        match outcome.completion {
            Some(Completion::Plan(plan)) => Ok((instance_id, *plan)),
            _ => Err(ClaudioError::PhaseFailure {
                phase: "planning".to_string(),
                reason: outcome
                    .error
                    .unwrap_or_else(|| format!("planner ended {}", outcome.status)),
            }),
        }
    }

    async fn run_plan_selection(&self) -> Result<()> {
        let ultra = self.ultra().await?;
        let session_id = self.session_id().await;
        let prompt = prompts::build_plan_selection_prompt(&prompts::SelectionContext {
            session_id: &session_id,
            objective: &ultra.objective,
            candidates: &ultra.candidate_plans,
        })
        .map_err(|e| ClaudioError::PhaseFailure {
            phase: "plan_selection".to_string(),
            reason: e.to_string(),
        })?;

        let (instance_id, outcome) = self
            .spawn_instance("select plan", &self.main_branch, SentinelKind::Task, prompt)
            .await?;

        let completion = match outcome.completion {
            Some(Completion::Task(c)) if outcome.status == InstanceStatus::Completed => c,
            _ => {
                return Err(ClaudioError::PhaseFailure {
                    phase: "plan_selection".to_string(),
                    reason: outcome
                        .error
                        .unwrap_or_else(|| format!("manager ended {}", outcome.status)),
                })
            }
        };

        let (plan, selected) = match completion.action.as_deref() {
            Some("select") => {
                let index = completion.selected_index.unwrap_or(-1);
                let index = usize::try_from(index).map_err(|_| ClaudioError::PhaseFailure {
                    phase: "plan_selection".to_string(),
                    reason: format!("invalid selected_index {}", index),
                })?;
                let candidate = ultra.candidate_plans.get(index).ok_or_else(|| {
                    ClaudioError::PhaseFailure {
                        phase: "plan_selection".to_string(),
                        reason: format!("selected_index {} out of range", index),
                    }
                })?;
                (candidate.plan.clone(), Some(index))
            }
            Some("merge") => {
                // The manager wrote a merged plan next to its sentinel.
                let worktree = self.instance_worktree(&instance_id).await?;
                match sentinel::poll_sentinel(&worktree, SentinelKind::Plan)? {
                    Some(Completion::Plan(plan)) => (*plan, None),
                    _ => {
                        return Err(ClaudioError::PhaseFailure {
                            phase: "plan_selection".to_string(),
                            reason: "action=merge but no merged plan file".to_string(),
                        })
                    }
                }
            }
            other => {
                return Err(ClaudioError::PhaseFailure {
                    phase: "plan_selection".to_string(),
                    reason: format!("unknown selection action {:?}", other),
                })
            }
        };

        self.validate_or_fail(&plan, "plan_selection")?;
        {
            let mut session = self.session.lock().await;
            let ultra = require_ultra(&mut session)?;
            ultra.manager_instance = Some(instance_id);
            ultra.selected_candidate = selected;
            ultra.plan = Some(plan);
            self.store.save_session(&session)?;
        }
        self.set_phase(Phase::Refresh).await?;
        Ok(())
    }

    async fn run_refresh(&self) -> Result<()> {
        let ultra = self.ultra().await?;
        let plan = ultra.plan.as_ref().ok_or_else(|| ClaudioError::PhaseFailure {
            phase: "refresh".to_string(),
            reason: "no plan selected".to_string(),
        })?;
        let order = derive_execution_order(plan)?;
        tracing::info!(
            "plan ready: {} tasks in {} groups",
            plan.tasks.len(),
            order.len()
        );

        if ultra.config.dry_run {
            for (index, group) in order.iter().enumerate() {
                tracing::info!("group {}: {}", index, group.join(", "));
            }
            self.set_phase(Phase::Done).await?;
            return Ok(());
        }
        self.set_phase(Phase::Execution { group: 0 }).await?;
        Ok(())
    }

    async fn run_execution(&self, start_group: usize) -> Result<()> {
        let ultra = self.ultra().await?;
        let plan = ultra.plan.clone().ok_or_else(|| ClaudioError::PhaseFailure {
            phase: "execution".to_string(),
            reason: "no plan selected".to_string(),
        })?;
        let order = derive_execution_order(&plan)?;
        let auto_revise =
            !ultra.config.skip_synthesis && ultra.config.max_revision_rounds > 0;

        for group_index in start_group..order.len() {
            if self.budget.limit_reached() {
                return Err(ClaudioError::PhaseFailure {
                    phase: "execution".to_string(),
                    reason: "budget limit reached; resume instances to continue".to_string(),
                });
            }
            self.set_phase(Phase::Execution { group: group_index }).await?;

            let previous = if group_index == 0 {
                None
            } else {
                self.ultra()
                    .await?
                    .group_consolidations
                    .iter()
                    .find(|g| g.group == group_index - 1)
                    .cloned()
            };

            let launcher: Arc<dyn TaskLauncher> = Arc::new(ExecutionLauncher {
                coordinator: self.clone(),
                plan: plan.clone(),
                group_index,
                previous,
            });
            let scheduler =
                GroupScheduler::new(ultra.config.max_parallel, self.cancel.clone())
                    .continue_on_failure(auto_revise);
            let outcome = scheduler.run_group(&order[group_index], launcher).await?;

            if !outcome.failed.is_empty() {
                if auto_revise {
                    self.auto_revise_failures(&plan, &outcome.failed).await?;
                } else {
                    return Err(ClaudioError::PhaseFailure {
                        phase: "execution".to_string(),
                        reason: format!(
                            "tasks failed in group {}: {}",
                            group_index,
                            outcome.failed.join(", ")
                        ),
                    });
                }
            }
            if !outcome.not_started.is_empty() {
                return Err(ClaudioError::PhaseFailure {
                    phase: "execution".to_string(),
                    reason: format!(
                        "group {} halted before starting: {}",
                        group_index,
                        outcome.not_started.join(", ")
                    ),
                });
            }

            self.consolidate_group(group_index, &order[group_index]).await?;
        }

        let next = if ultra.config.skip_synthesis {
            Phase::Consolidation
        } else {
            Phase::Synthesis
        };
        self.set_phase(next).await?;
        Ok(())
    }

    /// One retry pass over failed tasks, re-entering their worktrees with
    /// a revision prompt built from the recorded failure.
    async fn auto_revise_failures(&self, plan: &Plan, failed: &[String]) -> Result<()> {
        let max_retries = self.ultra().await?.config.max_revision_rounds;
        for task_id in failed {
            let task = plan.task(task_id).ok_or_else(|| ClaudioError::PhaseFailure {
                phase: "execution".to_string(),
                reason: format!("failed task '{}' not in plan", task_id),
            })?;
            let mut recovered = false;
            for attempt in 1..=max_retries {
                let reason = self
                    .task_instance(&task.id)
                    .await
                    .and_then(|i| i.last_error)
                    .unwrap_or_else(|| "task ended in a failure state".to_string());
                let issues = vec![SynthesisIssue {
                    task_id: task.id.clone(),
                    description: reason,
                    severity: Some("high".to_string()),
                }];
                let outcome = self.spawn_task_revision(task, &issues, attempt).await?;
                if outcome.status == InstanceStatus::Completed {
                    recovered = true;
                    break;
                }
            }
            if !recovered {
                return Err(ClaudioError::PhaseFailure {
                    phase: "execution".to_string(),
                    reason: format!(
                        "task '{}' still failing after {} retries",
                        task_id, max_retries
                    ),
                });
            }
        }
        Ok(())
    }

    async fn consolidate_group(&self, group_index: usize, group: &[String]) -> Result<()> {
        let session_id = self.session_id().await;
        let ultra = self.ultra().await?;
        let base_branch = ultra.base_branch_for_group(group_index, &self.main_branch);
        let target_branch =
            group_branch_name(&self.config.branch.prefix, &session_id, group_index);

        let mut task_branches = Vec::new();
        for task_id in group {
            if let Some(instance) = self.task_instance(task_id).await {
                task_branches.push(instance.branch);
            }
        }

        let prompt =
            prompts::build_group_consolidation_prompt(&prompts::GroupConsolidationContext {
                session_id: &session_id,
                objective: &ultra.objective,
                group_index,
                task_branches: &task_branches,
                base_branch: &base_branch,
                target_branch: &target_branch,
            })
            .map_err(|e| ClaudioError::PhaseFailure {
                phase: "execution".to_string(),
                reason: e.to_string(),
            })?;

        let (instance_id, outcome) = self
            .spawn_named_branch_instance(
                &format!("consolidate group {}", group_index),
                target_branch.clone(),
                &base_branch,
                SentinelKind::GroupConsolidation,
                prompt,
            )
            .await?;

        let completion = match outcome.completion {
            Some(Completion::GroupConsolidation(c))
                if outcome.status == InstanceStatus::Completed =>
            {
                c
            }
            _ => {
                return Err(ClaudioError::PhaseFailure {
                    phase: "execution".to_string(),
                    reason: outcome.error.unwrap_or_else(|| {
                        format!("group {} consolidator ended {}", group_index, outcome.status)
                    }),
                })
            }
        };

        let verification_passed = completion
            .verification
            .as_ref()
            .map(|v| v.overall_success)
            .unwrap_or(true);
        if !verification_passed {
            // Soft failure: record it and keep going.
            tracing::warn!(
                "group {} verification failed: {}",
                group_index,
                completion
                    .verification
                    .as_ref()
                    .map(|v| v.details.as_str())
                    .unwrap_or("no details")
            );
        }

        let record = GroupConsolidation {
            group: group_index,
            branch: if completion.branch_name.is_empty() {
                target_branch
            } else {
                completion.branch_name.clone()
            },
            instance_id,
            notes: completion.notes.clone(),
            verification_passed,
            issues_for_next_group: completion.issues_for_next_group.clone(),
        };
        {
            let mut session = self.session.lock().await;
            let ultra = require_ultra(&mut session)?;
            ultra.group_consolidations.retain(|g| g.group != group_index);
            ultra.group_consolidations.push(record);
            self.store.save_session(&session)?;
        }
        Ok(())
    }

    async fn run_synthesis(&self) -> Result<()> {
        let ultra = self.ultra().await?;
        let session_id = self.session_id().await;
        let plan = ultra.plan.clone().ok_or_else(|| ClaudioError::PhaseFailure {
            phase: "synthesis".to_string(),
            reason: "no plan selected".to_string(),
        })?;

        let mut task_results = Vec::new();
        for task in &plan.tasks {
            if let Some(instance) = self.task_instance(&task.id).await {
                task_results.push((
                    task.id.clone(),
                    format!(
                        "{} ({} files changed)",
                        instance.status,
                        instance.modified_files.len()
                    ),
                ));
            }
        }

        let prompt = prompts::build_synthesis_prompt(&prompts::SynthesisContext {
            session_id: &session_id,
            objective: &ultra.objective,
            plan: &plan,
            task_results: &task_results,
        })
        .map_err(|e| ClaudioError::PhaseFailure {
            phase: "synthesis".to_string(),
            reason: e.to_string(),
        })?;

        let base = ultra.base_branch_for_group(
            ultra.group_consolidations.len(),
            &self.main_branch,
        );
        let (instance_id, outcome) = self
            .spawn_instance("synthesis review", &base, SentinelKind::Synthesis, prompt)
            .await?;

        let completion = match outcome.completion {
            Some(Completion::Synthesis(c)) if outcome.status == InstanceStatus::Completed => c,
            _ => {
                return Err(ClaudioError::PhaseFailure {
                    phase: "synthesis".to_string(),
                    reason: outcome
                        .error
                        .unwrap_or_else(|| format!("synthesis ended {}", outcome.status)),
                })
            }
        };

        let needs_revision = completion.status == sentinel::CompletionStatus::NeedsRevision
            && !completion.issues_found.is_empty();
        {
            let mut session = self.session.lock().await;
            let ultra = require_ultra(&mut session)?;
            ultra.synthesis_instance = Some(instance_id);
            ultra.pending_issues = if needs_revision {
                completion.issues_found.clone()
            } else {
                Vec::new()
            };
            self.store.save_session(&session)?;
        }

        if needs_revision {
            let round = ultra.revision_rounds + 1;
            if round > ultra.config.max_revision_rounds {
                return Err(ClaudioError::PhaseFailure {
                    phase: "synthesis".to_string(),
                    reason: format!(
                        "revision cap of {} rounds reached with issues outstanding",
                        ultra.config.max_revision_rounds
                    ),
                });
            }
            self.set_phase(Phase::Revision { round }).await?;
        } else {
            self.set_phase(Phase::Consolidation).await?;
        }
        Ok(())
    }

    async fn run_revision(&self, round: u32) -> Result<()> {
        let ultra = self.ultra().await?;
        let plan = ultra.plan.clone().ok_or_else(|| ClaudioError::PhaseFailure {
            phase: "revision".to_string(),
            reason: "no plan selected".to_string(),
        })?;

        // Group pending issues by task; each affected task gets one
        // revision agent in its existing worktree.
        let mut by_task: HashMap<String, Vec<SynthesisIssue>> = HashMap::new();
        for issue in &ultra.pending_issues {
            by_task
                .entry(issue.task_id.clone())
                .or_default()
                .push(issue.clone());
        }
        let mut task_ids: Vec<String> = by_task.keys().cloned().collect();
        task_ids.sort();

        let launcher: Arc<dyn TaskLauncher> = Arc::new(RevisionLauncher {
            coordinator: self.clone(),
            plan,
            issues: by_task,
            round,
        });
        let scheduler = GroupScheduler::new(ultra.config.max_parallel, self.cancel.clone());
        let outcome = scheduler.run_group(&task_ids, launcher).await?;
        if !outcome.all_completed() {
            return Err(ClaudioError::PhaseFailure {
                phase: "revision".to_string(),
                reason: format!("revision failed for: {}", outcome.failed.join(", ")),
            });
        }

        {
            let mut session = self.session.lock().await;
            let ultra = require_ultra(&mut session)?;
            ultra.revision_rounds = round;
            ultra.pending_issues.clear();
            self.store.save_session(&session)?;
        }
        self.set_phase(Phase::Synthesis).await?;
        Ok(())
    }

    async fn spawn_task_revision(
        &self,
        task: &PlannedTask,
        issues: &[SynthesisIssue],
        round: u32,
    ) -> Result<SupervisionOutcome> {
        let session_id = self.session_id().await;
        let prompt = prompts::build_revision_prompt(&prompts::RevisionContext {
            session_id: &session_id,
            task,
            issues,
            round,
        })
        .map_err(|e| ClaudioError::PhaseFailure {
            phase: "revision".to_string(),
            reason: e.to_string(),
        })?;

        let original = self.task_instance(&task.id).await.ok_or_else(|| {
            ClaudioError::PhaseFailure {
                phase: "revision".to_string(),
                reason: format!("no instance recorded for task '{}'", task.id),
            }
        })?;

        let (_, outcome) = self
            .spawn_in_existing_worktree(
                &format!("revise {} (round {})", task.id, round),
                original.branch.clone(),
                original.worktree_path.clone(),
                SentinelKind::Revision,
                prompt,
            )
            .await?;
        Ok(outcome)
    }

    async fn run_consolidation(&self) -> Result<()> {
        let ultra = self.ultra().await?;
        let session_id = self.session_id().await;
        let mut records = ultra.group_consolidations.clone();
        records.sort_by_key(|g| g.group);
        let group_branches: Vec<String> = records.iter().map(|g| g.branch.clone()).collect();

        let prompt = prompts::build_consolidation_prompt(&prompts::ConsolidationContext {
            session_id: &session_id,
            objective: &ultra.objective,
            group_branches: &group_branches,
            mode: ultra.config.consolidation_mode,
            main_branch: &self.main_branch,
        })
        .map_err(|e| ClaudioError::PhaseFailure {
            phase: "consolidation".to_string(),
            reason: e.to_string(),
        })?;

        let base = group_branches
            .last()
            .cloned()
            .unwrap_or_else(|| self.main_branch.clone());
        let (instance_id, outcome) = self
            .spawn_instance("final consolidation", &base, SentinelKind::Consolidation, prompt)
            .await?;

        match outcome.completion {
            Some(Completion::Consolidation(c))
                if outcome.status == InstanceStatus::Completed =>
            {
                for url in &c.pr_urls {
                    self.bus.publish(Event::PrCompleted {
                        session_id: session_id.clone(),
                        instance_id: instance_id.clone(),
                        url: url.clone(),
                    });
                }
            }
            _ => {
                return Err(ClaudioError::PhaseFailure {
                    phase: "consolidation".to_string(),
                    reason: outcome
                        .error
                        .unwrap_or_else(|| format!("consolidation ended {}", outcome.status)),
                })
            }
        }

        {
            let mut session = self.session.lock().await;
            let ultra = require_ultra(&mut session)?;
            ultra.consolidation_instance = Some(instance_id);
            self.store.save_session(&session)?;
        }
        self.set_phase(Phase::Done).await?;
        Ok(())
    }

    // ----- instance plumbing ----------------------------------------------

    /// Create a worktree on a generated branch and supervise an agent in
    /// it until terminal.
    async fn spawn_instance(
        &self,
        title: &str,
        base_branch: &str,
        kind: SentinelKind,
        prompt: String,
    ) -> Result<(InstanceId, SupervisionOutcome)> {
        let mut instance = Instance::new(title.to_string(), String::new(), PathBuf::new());
        let branch = branch_name(&self.config.branch, &instance.id, title);
        instance.branch = branch.clone();
        self.spawn_prepared(instance, &branch, base_branch, kind, prompt, true)
            .await
    }

    /// Same as [`Self::spawn_instance`] but with a caller-fixed branch
    /// name (group consolidators).
    async fn spawn_named_branch_instance(
        &self,
        title: &str,
        branch: String,
        base_branch: &str,
        kind: SentinelKind,
        prompt: String,
    ) -> Result<(InstanceId, SupervisionOutcome)> {
        let instance = Instance::new(title.to_string(), branch.clone(), PathBuf::new());
        self.spawn_prepared(instance, &branch, base_branch, kind, prompt, true)
            .await
    }

    /// Re-enter an existing worktree (revisions) without git setup.
    async fn spawn_in_existing_worktree(
        &self,
        title: &str,
        branch: String,
        worktree: PathBuf,
        kind: SentinelKind,
        prompt: String,
    ) -> Result<(InstanceId, SupervisionOutcome)> {
        let mut instance = Instance::new(title.to_string(), branch.clone(), worktree);
        instance.branch = branch;
        self.spawn_prepared(instance, "", "", kind, prompt, false).await
    }

    async fn spawn_prepared(
        &self,
        mut instance: Instance,
        branch: &str,
        base_branch: &str,
        kind: SentinelKind,
        prompt: String,
        create_worktree: bool,
    ) -> Result<(InstanceId, SupervisionOutcome)> {
        let session_id = self.session_id().await;
        let instance_id = instance.id.clone();

        if create_worktree {
            let worktree = self.store.worktree_path(&session_id, &instance_id);
            self.git
                .create_worktree(&worktree, branch, base_branch)
                .await?;
            instance.worktree_path = worktree;
        }
        let worktree = instance.worktree_path.clone();

        // A stale sentinel from an earlier round would complete the new
        // agent instantly.
        let stale = worktree.join(kind.filename());
        if stale.exists() {
            std::fs::remove_file(&stale)?;
        }

        {
            let mut session = self.session.lock().await;
            session.add_instance(instance);
            self.store.save_session(&session)?;
        }

        let supervisor = InstanceSupervisor::new(
            session_id.clone(),
            instance_id.clone(),
            multiplexer_session_name(&session_id, &instance_id),
            worktree,
            kind,
            self.runner.clone(),
            self.bus.clone(),
            self.budget.clone(),
            SupervisorOptions::from_config(&self.config.instance),
            self.cancel.child_token(),
        );
        let handle = supervisor.handle();
        let result = supervisor.run(&prompt).await;

        // Final write-back; intermediate transitions arrive through the
        // event mirror.
        let mut session = self.session.lock().await;
        if let Some(record) = session.instance_mut(&instance_id) {
            record.status = handle.status();
            record.metrics = handle.metrics();
            match &result {
                Ok(outcome) => {
                    record.last_error = outcome.error.clone();
                    if let Some(Completion::Task(c)) = &outcome.completion {
                        record.modified_files = c.files_modified.clone();
                    }
                    if let Some(Completion::Revision(c)) = &outcome.completion {
                        record.modified_files = c.files_modified.clone();
                    }
                }
                Err(e) => record.last_error = Some(e.to_string()),
            }
        }
        self.store.save_session(&session)?;
        drop(session);

        result.map(|outcome| (instance_id, outcome))
    }

    // ----- shared state helpers -------------------------------------------

    /// Mirror supervisor events into the session record so every status
    /// and metrics transition is persisted as it happens.
    fn spawn_event_mirror(&self) -> tokio::task::JoinHandle<()> {
        let subscription = self.bus.subscribe_topics(vec![
            Topic::InstanceStatusChanged,
            Topic::InstanceMetricsUpdated,
        ]);
        let session = self.session.clone();
        let store = self.store.clone();
        tokio::spawn(async move {
            loop {
                let event = subscription.recv().await;
                let mut session = session.lock().await;
                match event {
                    Event::InstanceStatusChanged { instance_id, to, .. } => {
                        if let Some(instance) = session.instance_mut(&instance_id) {
                            instance.status = to;
                        }
                    }
                    Event::InstanceMetricsUpdated {
                        instance_id,
                        metrics,
                        ..
                    } => {
                        if let Some(instance) = session.instance_mut(&instance_id) {
                            instance.metrics = metrics;
                        }
                    }
                    _ => continue,
                }
                if let Err(e) = store.save_session(&session) {
                    tracing::warn!("failed to persist session after event: {}", e);
                }
            }
        })
    }

    async fn session_id(&self) -> String {
        self.session.lock().await.id.clone()
    }

    async fn current_phase(&self) -> Result<Phase> {
        Ok(self.ultra().await?.phase)
    }

    async fn ultra(&self) -> Result<UltraPlanSession> {
        let session = self.session.lock().await;
        session
            .ultra_plan
            .clone()
            .ok_or_else(|| ClaudioError::PhaseFailure {
                phase: "startup".to_string(),
                reason: "session has no ultra-plan record".to_string(),
            })
    }

    async fn set_phase(&self, phase: Phase) -> Result<()> {
        let session_id;
        {
            let mut session = self.session.lock().await;
            session_id = session.id.clone();
            let ultra = require_ultra(&mut session)?;
            if ultra.phase == phase {
                return Ok(());
            }
            ultra.phase = phase.clone();
            self.store.save_session(&session)?;
        }
        self.bus.publish(Event::PhaseAdvanced {
            session_id,
            phase,
        });
        Ok(())
    }

    async fn task_instance(&self, task_id: &str) -> Option<Instance> {
        let session = self.session.lock().await;
        let instance_id = session
            .ultra_plan
            .as_ref()?
            .task_instances
            .get(task_id)?
            .clone();
        session.instance(&instance_id).cloned()
    }

    async fn instance_worktree(&self, instance_id: &str) -> Result<PathBuf> {
        let session = self.session.lock().await;
        session
            .instance(instance_id)
            .map(|i| i.worktree_path.clone())
            .ok_or_else(|| ClaudioError::InstanceNotFound(instance_id.to_string()))
    }

    fn validate_or_fail(&self, plan: &Plan, phase: &str) -> Result<()> {
        let result = validate(plan);
        for message in &result.messages {
            tracing::debug!("plan validation: {:?}", message);
        }
        if !result.is_valid() {
            return Err(ClaudioError::PlanInvalid(format!(
                "{}: {}",
                phase,
                result.summary()
            )));
        }
        Ok(())
    }
}

fn require_ultra(session: &mut Session) -> Result<&mut UltraPlanSession> {
    session
        .ultra_plan
        .as_mut()
        .ok_or_else(|| ClaudioError::PhaseFailure {
            phase: "startup".to_string(),
            reason: "session has no ultra-plan record".to_string(),
        })
}

/// Launches one planned task as a supervised instance.
struct ExecutionLauncher {
    coordinator: UltraPlanCoordinator,
    plan: Plan,
    group_index: usize,
    previous: Option<GroupConsolidation>,
}

#[async_trait]
impl TaskLauncher for ExecutionLauncher {
    async fn launch(&self, task_id: &str) -> Result<InstanceStatus> {
        let task = self
            .plan
            .task(task_id)
            .ok_or_else(|| ClaudioError::PhaseFailure {
                phase: "execution".to_string(),
                reason: format!("task '{}' not in plan", task_id),
            })?;
        let coordinator = &self.coordinator;
        let session_id = coordinator.session_id().await;
        let ultra = coordinator.ultra().await?;

        let prompt = prompts::build_task_prompt(&prompts::TaskContext {
            session_id: &session_id,
            objective: &ultra.objective,
            task,
            plan_summary: &self.plan.executive_summary,
            group_index: self.group_index,
            previous_group: self.previous.as_ref(),
        })
        .map_err(|e| ClaudioError::PhaseFailure {
            phase: "execution".to_string(),
            reason: e.to_string(),
        })?;

        let base = ultra.base_branch_for_group(self.group_index, &coordinator.main_branch);
        let (instance_id, outcome) = coordinator
            .spawn_instance(
                &format!("{}: {}", task.id, task.title),
                &base,
                SentinelKind::Task,
                prompt,
            )
            .await?;

        {
            let mut session = coordinator.session.lock().await;
            let ultra = require_ultra(&mut session)?;
            ultra
                .task_instances
                .insert(task_id.to_string(), instance_id);
            coordinator.store.save_session(&session)?;
        }
        Ok(outcome.status)
    }
}

/// Launches revision agents for tasks flagged by synthesis.
struct RevisionLauncher {
    coordinator: UltraPlanCoordinator,
    plan: Plan,
    issues: HashMap<String, Vec<SynthesisIssue>>,
    round: u32,
}

#[async_trait]
impl TaskLauncher for RevisionLauncher {
    async fn launch(&self, task_id: &str) -> Result<InstanceStatus> {
        let task = self
            .plan
            .task(task_id)
            .ok_or_else(|| ClaudioError::PhaseFailure {
                phase: "revision".to_string(),
                reason: format!("task '{}' not in plan", task_id),
            })?;
        let issues = self.issues.get(task_id).cloned().unwrap_or_default();
        let outcome = self
            .coordinator
            .spawn_task_revision(task, &issues, self.round)
            .await?;
        Ok(outcome.status)
    }
}

//! Command-line interface

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::agent::{multiplexer_session_name, AgentRunner};
use crate::budget::BudgetManager;
use crate::cleanup::{CleanupEngine, CleanupScope};
use crate::config::ClaudioConfig;
use crate::coordination::EventBus;
use crate::git::{branch_name, detect_main_branch, GitBackend, ShellGitBackend};
use crate::instance::{InstanceSupervisor, SentinelKind, SupervisorOptions};
use crate::logging::{self, LogFilter, SessionLogger};
use crate::orchestrator::{Phase, UltraPlanCoordinator};
use crate::plan::{Complexity, Plan, PlannedTask};
use crate::pr::{GhPrBackend, PrWorkflow};
use crate::prompts;
use crate::scheduler::{GroupScheduler, TaskLauncher};
use crate::session::{
    short_id, Instance, InstanceStatus, Session, SessionStore, UltraPlanRunConfig,
    UltraPlanSession,
};
use crate::tmux::{Multiplexer, TmuxClient};
use crate::utils::command::CommandExecutor;
use crate::utils::error::{ClaudioError, Result};

mod output;
use output::{create_formatter, OutputFormatter};

/// claudio - git-worktree multi-agent orchestrator
#[derive(Parser)]
#[command(name = "claudio")]
#[command(about = "Run concurrent AI coding agents in isolated git worktrees")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Repository path
    #[arg(short, long, default_value = ".")]
    pub repo: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// JSON output format
    #[arg(long)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize the .claudio directory and a default config
    Init,

    /// Run the pending instances of a session (newest by default)
    Start {
        /// Session name or id; created when it does not exist
        name: Option<String>,

        /// Maximum concurrently running instances (0 = unbounded)
        #[arg(long)]
        max_parallel: Option<usize>,
    },

    /// Add a task as a pending instance
    Add {
        /// Task description
        task: String,

        /// Instance ids (or unique prefixes) this task depends on
        #[arg(long, value_delimiter = ',')]
        depends_on: Vec<String>,
    },

    /// Show the newest session and its instances
    Status,

    /// Session management
    Sessions {
        #[command(subcommand)]
        command: SessionCommands,
    },

    /// Aggregated usage statistics
    Stats,

    /// Remove stale worktrees, branches, tmux sessions, and records
    Cleanup {
        #[arg(long)]
        dry_run: bool,

        /// Also remove dirty worktrees
        #[arg(long)]
        force: bool,

        #[arg(long)]
        worktrees: bool,

        #[arg(long)]
        branches: bool,

        #[arg(long)]
        tmux: bool,

        #[arg(long)]
        sessions: bool,

        /// Tear down every session's resources, not only orphans
        #[arg(long)]
        all_sessions: bool,

        /// Everything, forced
        #[arg(long)]
        deep_clean: bool,
    },

    /// Plan an objective and execute it with parallel agents
    Ultraplan {
        /// The objective to decompose
        objective: Option<String>,

        /// Use a pre-written plan file instead of a planning agent
        #[arg(long)]
        plan: Option<PathBuf>,

        #[arg(long)]
        max_parallel: Option<usize>,

        /// Validate and show the execution order, then stop
        #[arg(long)]
        dry_run: bool,

        /// Skip the synthesis review phase
        #[arg(long)]
        no_synthesis: bool,

        /// Do not ask for plan approval
        #[arg(long)]
        auto_approve: bool,

        /// Show the plan and ask before executing
        #[arg(long)]
        review: bool,

        /// Three competing planners plus a selection manager
        #[arg(long)]
        multi_pass: bool,
    },

    /// Ultraplan with three competing planners (alias for --multi-pass)
    Tripleshot {
        objective: String,

        #[arg(long)]
        max_parallel: Option<usize>,
    },

    /// Create PRs for completed instances
    Pr,

    /// Configuration management
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Read session debug logs
    Logs {
        /// Session name or id (newest by default)
        #[arg(short = 's', long)]
        session: Option<String>,

        /// Show the last N entries
        #[arg(short = 'n', long, default_value = "50")]
        lines: usize,

        /// Follow the log
        #[arg(short = 'f', long)]
        follow: bool,

        /// Minimum level (error, warn, info, debug)
        #[arg(long)]
        level: Option<String>,

        /// Only entries newer than this (e.g. 30m, 2h, 1d, or RFC3339)
        #[arg(long)]
        since: Option<String>,

        /// Only entries whose message matches this regex
        #[arg(long)]
        grep: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum SessionCommands {
    /// List persisted sessions
    List,
    /// Attach to a session's tmux pane
    Attach { session: String },
    /// Resume an interrupted ultra-plan session
    Recover { session: String },
    /// Remove finished sessions and their resources
    Clean {
        #[arg(long)]
        all: bool,

        #[arg(long)]
        session: Option<String>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Set one key in the config file
    Set { key: String, value: String },
    /// Write a default config file
    Init,
    /// Print the config file path
    Path,
}

/// Everything a command handler needs.
struct AppEnv {
    config: ClaudioConfig,
    store: Arc<SessionStore>,
    git: Arc<dyn GitBackend>,
    main_branch: String,
    formatter: OutputFormatter,
}

impl AppEnv {
    async fn build(cli: &Cli) -> Result<Self> {
        let config = ClaudioConfig::load(cli.config.as_deref())?;
        let repo_root = find_repo_root(&cli.repo).await?;
        let main_branch = detect_main_branch(&repo_root).await;
        let store = Arc::new(SessionStore::open(&repo_root)?);
        let git: Arc<dyn GitBackend> =
            Arc::new(ShellGitBackend::new(repo_root, main_branch.clone()));
        Ok(Self {
            config,
            store,
            git,
            main_branch,
            formatter: create_formatter(cli.json),
        })
    }

    /// Newest session, or an error naming the fix.
    fn latest_session(&self) -> Result<Session> {
        let infos = self.store.list_sessions()?;
        let info = infos.first().ok_or_else(|| {
            ClaudioError::SessionNotFound("no sessions; run 'claudio start <name>'".to_string())
        })?;
        self.store.load_session(&info.id)
    }

    fn resolve_or_latest(&self, needle: Option<&str>) -> Result<Session> {
        match needle {
            Some(n) => self.store.resolve_session(n),
            None => self.latest_session(),
        }
    }

    async fn mux(&self) -> Result<Arc<dyn Multiplexer>> {
        Ok(Arc::new(TmuxClient::new().await?))
    }
}

async fn find_repo_root(cwd: &Path) -> Result<PathBuf> {
    let out = CommandExecutor::run("git", &["rev-parse", "--show-toplevel"], Some(cwd)).await?;
    Ok(PathBuf::from(out.trim()))
}

/// Entry point used by `main`.
pub async fn run(cli: Cli) -> Result<()> {
    let env = AppEnv::build(&cli).await?;
    match cli.command {
        Commands::Init => cmd_init(&env).await,
        Commands::Start { name, max_parallel } => cmd_start(&env, name, max_parallel).await,
        Commands::Add { task, depends_on } => cmd_add(&env, task, depends_on).await,
        Commands::Status => cmd_status(&env),
        Commands::Sessions { command } => cmd_sessions(&env, command).await,
        Commands::Stats => cmd_stats(&env),
        Commands::Cleanup {
            dry_run,
            force,
            worktrees,
            branches,
            tmux,
            sessions,
            all_sessions,
            deep_clean,
        } => {
            cmd_cleanup(
                &env,
                dry_run,
                force || deep_clean,
                CleanupFlags {
                    worktrees,
                    branches,
                    tmux,
                    sessions,
                    all_sessions: all_sessions || deep_clean,
                },
            )
            .await
        }
        Commands::Ultraplan {
            objective,
            plan,
            max_parallel,
            dry_run,
            no_synthesis,
            auto_approve,
            review,
            multi_pass,
        } => {
            cmd_ultraplan(
                &env,
                UltraplanArgs {
                    objective,
                    plan_file: plan,
                    max_parallel,
                    dry_run,
                    no_synthesis,
                    auto_approve,
                    review,
                    multi_pass,
                },
            )
            .await
        }
        Commands::Tripleshot {
            objective,
            max_parallel,
        } => {
            cmd_ultraplan(
                &env,
                UltraplanArgs {
                    objective: Some(objective),
                    plan_file: None,
                    max_parallel,
                    dry_run: false,
                    no_synthesis: false,
                    auto_approve: false,
                    review: false,
                    multi_pass: true,
                },
            )
            .await
        }
        Commands::Pr => cmd_pr(&env).await,
        Commands::Config { ref command } => cmd_config(&env, &cli, command.clone()),
        Commands::Logs {
            session,
            lines,
            follow,
            level,
            since,
            grep,
        } => cmd_logs(&env, session, lines, follow, level, since, grep).await,
    }
}

// ----- init / add / start ------------------------------------------------

async fn cmd_init(env: &AppEnv) -> Result<()> {
    let config_path = PathBuf::from("config.yaml");
    if !config_path.exists() {
        std::fs::write(&config_path, ClaudioConfig::default().to_yaml()?)?;
    }
    println!(
        "{}",
        env.formatter.format_success(
            &format!("initialized {} and config.yaml", env.store.root().display()),
            None,
        )
    );
    Ok(())
}

async fn cmd_add(env: &AppEnv, task: String, depends_on: Vec<String>) -> Result<()> {
    let mut session = match env.latest_session() {
        Ok(session) => session,
        Err(_) => env.store.create_session("default")?,
    };
    let _lock = env.store.acquire_lock(&session.id)?;

    // Resolve dependency prefixes against existing instances.
    let mut deps = Vec::new();
    for needle in depends_on.iter().filter(|d| !d.is_empty()) {
        let matched: Vec<_> = session
            .instances
            .iter()
            .filter(|i| i.id.starts_with(needle.as_str()))
            .map(|i| i.id.clone())
            .collect();
        match matched.as_slice() {
            [one] => deps.push(one.clone()),
            [] => return Err(ClaudioError::InstanceNotFound(needle.clone())),
            _ => {
                return Err(ClaudioError::Configuration(format!(
                    "dependency prefix '{}' is ambiguous",
                    needle
                )))
            }
        }
    }

    let mut instance =
        Instance::new(task.clone(), String::new(), PathBuf::new()).with_dependencies(deps);
    instance.branch = branch_name(&env.config.branch, &instance.id, &task);
    instance.worktree_path = env.store.worktree_path(&session.id, &instance.id);
    let id = session.add_instance(instance);
    env.store.save_session(&session)?;

    println!(
        "{}",
        env.formatter.format_success(
            &format!("added instance {} to session {}", short_id(&id), session.name),
            None,
        )
    );
    Ok(())
}

async fn cmd_start(env: &AppEnv, name: Option<String>, max_parallel: Option<usize>) -> Result<()> {
    let session = match &name {
        Some(n) => match env.store.resolve_session(n) {
            Ok(session) => session,
            Err(_) => env.store.create_session(n)?,
        },
        None => env.latest_session()?,
    };
    let lock = env.store.acquire_lock(&session.id)?;

    let pending: Vec<Instance> = session
        .instances
        .iter()
        .filter(|i| i.status == InstanceStatus::Pending)
        .cloned()
        .collect();
    if pending.is_empty() {
        println!(
            "{}",
            env.formatter
                .format_success("no pending instances; add tasks with 'claudio add'", None)
        );
        return Ok(());
    }

    // Dependency grouping reuses the plan machinery: one synthetic task
    // per pending instance. Dependencies on instances that already ran
    // are considered satisfied.
    let pending_ids: std::collections::HashSet<&str> =
        pending.iter().map(|i| i.id.as_str()).collect();
    let plan = Plan {
        tasks: pending
            .iter()
            .map(|i| PlannedTask {
                id: i.id.clone(),
                title: i.task.lines().next().unwrap_or_default().to_string(),
                description: i.task.clone(),
                files: Vec::new(),
                depends_on: i
                    .depends_on
                    .iter()
                    .filter(|d| pending_ids.contains(d.as_str()))
                    .cloned()
                    .collect(),
                priority: 0,
                complexity: Some(Complexity::Medium),
            })
            .collect(),
        ..Default::default()
    };
    let order = crate::plan::derive_execution_order(&plan)?;

    let cancel = CancellationToken::new();
    spawn_ctrl_c(cancel.clone());
    let bus = Arc::new(EventBus::new());
    let budget = Arc::new(BudgetManager::new(
        session.id.clone(),
        env.config.resources.clone(),
        bus.clone(),
    ));
    let mux = env.mux().await?;
    let runner = Arc::new(AgentRunner::new(
        mux,
        env.config.agent.clone(),
        &env.config.instance,
    ));

    let launcher: Arc<dyn TaskLauncher> = Arc::new(ManualLauncher {
        session: Arc::new(Mutex::new(session)),
        objective: name.unwrap_or_else(|| "manual tasks".to_string()),
        plan: plan.clone(),
        store: env.store.clone(),
        git: env.git.clone(),
        runner,
        bus,
        budget,
        config: env.config.clone(),
        main_branch: env.main_branch.clone(),
        cancel: cancel.clone(),
    });
    let cap = max_parallel.unwrap_or(env.config.ultraplan.max_parallel);
    let scheduler = GroupScheduler::new(cap, cancel);
    let outcomes = scheduler.run_all(&order, launcher).await?;

    let failed: Vec<String> = outcomes.iter().flat_map(|o| o.failed.clone()).collect();
    if failed.is_empty() {
        println!("{}", env.formatter.format_success("all instances completed", None));
        drop(lock);
        Ok(())
    } else {
        Err(ClaudioError::PhaseFailure {
            phase: "start".to_string(),
            reason: format!("instances failed: {}", failed.join(", ")),
        })
    }
}

/// Runs one pending instance end to end for `claudio start`.
struct ManualLauncher {
    session: Arc<Mutex<Session>>,
    objective: String,
    plan: Plan,
    store: Arc<SessionStore>,
    git: Arc<dyn GitBackend>,
    runner: Arc<AgentRunner>,
    bus: Arc<EventBus>,
    budget: Arc<BudgetManager>,
    config: ClaudioConfig,
    main_branch: String,
    cancel: CancellationToken,
}

#[async_trait]
impl TaskLauncher for ManualLauncher {
    async fn launch(&self, task_id: &str) -> Result<InstanceStatus> {
        let task = self
            .plan
            .task(task_id)
            .ok_or_else(|| ClaudioError::InstanceNotFound(task_id.to_string()))?;
        let (session_id, branch, worktree) = {
            let session = self.session.lock().await;
            let instance = session
                .instance(task_id)
                .ok_or_else(|| ClaudioError::InstanceNotFound(task_id.to_string()))?;
            (
                session.id.clone(),
                instance.branch.clone(),
                instance.worktree_path.clone(),
            )
        };

        let prompt = prompts::build_task_prompt(&prompts::TaskContext {
            session_id: &session_id,
            objective: &self.objective,
            task,
            plan_summary: "",
            group_index: 0,
            previous_group: None,
        })
        .map_err(|e| ClaudioError::Configuration(e.to_string()))?;

        self.git
            .create_worktree(&worktree, &branch, &self.main_branch)
            .await?;

        let supervisor = InstanceSupervisor::new(
            session_id.clone(),
            task_id.to_string(),
            multiplexer_session_name(&session_id, task_id),
            worktree,
            SentinelKind::Task,
            self.runner.clone(),
            self.bus.clone(),
            self.budget.clone(),
            SupervisorOptions::from_config(&self.config.instance),
            self.cancel.child_token(),
        );
        let handle = supervisor.handle();
        let result = supervisor.run(&prompt).await;

        let mut session = self.session.lock().await;
        if let Some(record) = session.instance_mut(task_id) {
            record.status = handle.status();
            record.metrics = handle.metrics();
            if let Err(e) = &result {
                record.last_error = Some(e.to_string());
            }
        }
        self.store.save_session(&session)?;
        drop(session);

        result.map(|outcome| outcome.status)
    }
}

// ----- status / sessions / stats ----------------------------------------

#[derive(Serialize)]
struct InstanceRow {
    id: String,
    status: String,
    branch: String,
    task: String,
    cost_usd: f64,
}

fn cmd_status(env: &AppEnv) -> Result<()> {
    let session = env.latest_session()?;
    let rows: Vec<InstanceRow> = session
        .instances
        .iter()
        .map(|i| InstanceRow {
            id: short_id(&i.id).to_string(),
            status: i.status.to_string(),
            branch: i.branch.clone(),
            task: i.task.lines().next().unwrap_or_default().to_string(),
            cost_usd: i.metrics.cost_usd,
        })
        .collect();
    let title = match &session.ultra_plan {
        Some(ultra) => format!(
            "session {} ({}) - phase {}",
            session.name,
            short_id(&session.id),
            ultra.phase
        ),
        None => format!("session {} ({})", session.name, short_id(&session.id)),
    };
    println!("{}", env.formatter.format_list(&rows, &title));
    Ok(())
}

async fn cmd_sessions(env: &AppEnv, command: SessionCommands) -> Result<()> {
    match command {
        SessionCommands::List => {
            let infos = env.store.list_sessions()?;
            println!("{}", env.formatter.format_list(&infos, "sessions"));
            Ok(())
        }
        SessionCommands::Attach { session } => {
            let session = env.store.resolve_session(&session)?;
            let instance = session
                .active_instances()
                .next()
                .or_else(|| session.instances.first())
                .ok_or_else(|| ClaudioError::SessionNotFound("session has no instances".into()))?;
            let mux_name = multiplexer_session_name(&session.id, &instance.id);
            let status = std::process::Command::new("tmux")
                .args(["attach-session", "-t", &mux_name])
                .status()?;
            if !status.success() {
                return Err(ClaudioError::ExternalTool {
                    tool: "tmux attach-session".to_string(),
                    stderr: format!("no live pane for {}", mux_name),
                });
            }
            Ok(())
        }
        SessionCommands::Recover { session } => {
            let session = env.store.resolve_session(&session)?;
            if session.ultra_plan.is_none() {
                return Err(ClaudioError::PhaseFailure {
                    phase: "recover".to_string(),
                    reason: "session has no ultra-plan record".to_string(),
                });
            }
            run_coordinator(env, session).await
        }
        SessionCommands::Clean { all, session } => {
            env.store.cleanup_stale_locks()?;
            let targets: Vec<Session> = if let Some(needle) = session {
                vec![env.store.resolve_session(&needle)?]
            } else {
                let mut targets = Vec::new();
                for info in env.store.list_sessions()? {
                    let session = env.store.load_session(&info.id)?;
                    let finished = session.active_instances().count() == 0;
                    if all || finished {
                        targets.push(session);
                    }
                }
                targets
            };

            let mux = env.mux().await?;
            let mut removed = 0;
            for session in targets {
                for instance in &session.instances {
                    let name = multiplexer_session_name(&session.id, &instance.id);
                    let _ = mux.kill_session(&name).await;
                    if instance.worktree_path.exists() {
                        let _ = env.git.remove_worktree(&instance.worktree_path).await;
                    }
                }
                env.store.remove_session(&session.id)?;
                removed += 1;
            }
            println!(
                "{}",
                env.formatter
                    .format_success(&format!("removed {} sessions", removed), None)
            );
            Ok(())
        }
    }
}

#[derive(Serialize)]
struct SessionStats {
    id: String,
    name: String,
    instances: usize,
    cost_usd: f64,
    total_tokens: u64,
    api_calls: u64,
}

fn cmd_stats(env: &AppEnv) -> Result<()> {
    let mut rows = Vec::new();
    for info in env.store.list_sessions()? {
        let session = env.store.load_session(&info.id)?;
        let mut tokens = 0u64;
        let mut api_calls = 0u64;
        for instance in &session.instances {
            tokens += instance.metrics.total_tokens();
            api_calls += instance.metrics.api_calls;
        }
        rows.push(SessionStats {
            id: short_id(&session.id).to_string(),
            name: session.name.clone(),
            instances: session.instances.len(),
            cost_usd: session.total_cost_usd(),
            total_tokens: tokens,
            api_calls,
        });
    }
    println!("{}", env.formatter.format_list(&rows, "usage"));
    Ok(())
}

// ----- cleanup ------------------------------------------------------------

struct CleanupFlags {
    worktrees: bool,
    branches: bool,
    tmux: bool,
    sessions: bool,
    all_sessions: bool,
}

async fn cmd_cleanup(env: &AppEnv, dry_run: bool, force: bool, flags: CleanupFlags) -> Result<()> {
    let scope = if flags.worktrees || flags.branches || flags.tmux || flags.sessions {
        CleanupScope {
            worktrees: flags.worktrees,
            branches: flags.branches,
            tmux: flags.tmux,
            sessions: flags.sessions,
        }
    } else {
        CleanupScope::all()
    };

    if flags.all_sessions && !dry_run {
        // Tear down every session's resources first; orphan discovery
        // below sweeps whatever is left.
        let mux = env.mux().await?;
        for info in env.store.list_sessions()? {
            let session = env.store.load_session(&info.id)?;
            for instance in &session.instances {
                let name = multiplexer_session_name(&session.id, &instance.id);
                let _ = mux.kill_session(&name).await;
                if instance.worktree_path.exists() {
                    let _ = env.git.remove_worktree(&instance.worktree_path).await;
                }
                if !env
                    .git
                    .branch_exists_on_remote(&instance.branch)
                    .await
                    .unwrap_or(false)
                {
                    let _ = env.git.delete_branch(&instance.branch).await;
                }
            }
            env.store.remove_session(&session.id)?;
        }
    }

    let mux = env.mux().await?;
    let engine = CleanupEngine::new(
        env.store.clone(),
        env.git.clone(),
        mux,
        env.config.branch.prefix.clone(),
    );
    let plan = engine.discover(scope, force).await?;

    if dry_run {
        println!(
            "{}",
            env.formatter
                .format_success(&format!("would remove:\n{}", plan.summary()), None)
        );
        return Ok(());
    }

    let report = engine.execute(&plan, false).await?;
    println!(
        "{}",
        env.formatter.format_success(
            &format!(
                "removed {} worktrees, {} branches, {} tmux sessions, {} session records",
                report.worktrees_removed,
                report.branches_removed,
                report.mux_sessions_removed,
                report.sessions_removed
            ),
            None,
        )
    );
    Ok(())
}

// ----- ultraplan ----------------------------------------------------------

struct UltraplanArgs {
    objective: Option<String>,
    plan_file: Option<PathBuf>,
    max_parallel: Option<usize>,
    dry_run: bool,
    no_synthesis: bool,
    auto_approve: bool,
    review: bool,
    multi_pass: bool,
}

async fn cmd_ultraplan(env: &AppEnv, args: UltraplanArgs) -> Result<()> {
    let preloaded: Option<Plan> = match &args.plan_file {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            Some(serde_json::from_str(&raw)?)
        }
        None => None,
    };
    let objective = match (&args.objective, &preloaded) {
        (Some(objective), _) => objective.clone(),
        (None, Some(plan)) if !plan.executive_summary.is_empty() => {
            plan.executive_summary.clone()
        }
        _ => {
            return Err(ClaudioError::Configuration(
                "an objective or --plan file is required".to_string(),
            ))
        }
    };

    if args.review && !args.auto_approve {
        if let Some(plan) = &preloaded {
            println!("{}", serde_json::to_string_pretty(plan)?);
            if !confirm("execute this plan?")? {
                return Ok(());
            }
        }
    }

    let run_config = UltraPlanRunConfig {
        max_parallel: args.max_parallel.unwrap_or(env.config.ultraplan.max_parallel),
        dry_run: args.dry_run,
        skip_synthesis: args.no_synthesis,
        auto_approve: args.auto_approve,
        review: args.review,
        multi_pass: args.multi_pass || env.config.ultraplan.multi_pass,
        consolidation_mode: env.config.ultraplan.consolidation_mode,
        max_revision_rounds: env.config.ultraplan.max_task_retries,
    };

    let mut session = env.store.create_session(&objective_name(&objective))?;
    let mut ultra = UltraPlanSession::new(objective, run_config);
    ultra.plan = preloaded;
    session.ultra_plan = Some(ultra);
    env.store.save_session(&session)?;

    run_coordinator(env, session).await
}

/// Shared tail of `ultraplan` and `sessions recover`.
async fn run_coordinator(env: &AppEnv, session: Session) -> Result<()> {
    let lock = env.store.acquire_lock(&session.id)?;
    let session_id = session.id.clone();
    let logger = Arc::new(SessionLogger::new(
        &env.store.session_dir(&session_id),
        env.config.logging.max_size_mb,
        env.config.logging.max_backups,
    ));

    let cancel = CancellationToken::new();
    spawn_ctrl_c(cancel.clone());
    let bus = Arc::new(EventBus::new());
    let budget = Arc::new(BudgetManager::new(
        session_id.clone(),
        env.config.resources.clone(),
        bus.clone(),
    ));
    let mux = env.mux().await?;
    let runner = Arc::new(AgentRunner::new(
        mux,
        env.config.agent.clone(),
        &env.config.instance,
    ));

    // Narrate lifecycle events into the console and the session log.
    let narrator = {
        let subscription = bus.subscribe();
        let logger = logger.clone();
        tokio::spawn(async move {
            loop {
                match subscription.recv().await {
                    crate::coordination::Event::InstanceStatusChanged {
                        instance_id,
                        from,
                        to,
                        ..
                    } => {
                        tracing::info!("instance {}: {} -> {}", short_id(&instance_id), from, to);
                        logger.log(
                            "info",
                            "instance",
                            &format!("{} {} -> {}", instance_id, from, to),
                        );
                    }
                    crate::coordination::Event::PhaseAdvanced { phase, .. } => {
                        tracing::info!("phase -> {}", phase);
                        logger.log("info", "orchestrator", &format!("phase -> {}", phase));
                    }
                    crate::coordination::Event::BudgetWarning { cost_usd, .. } => {
                        tracing::warn!("session cost ${:.2} crossed warning threshold", cost_usd);
                        logger.log("warn", "budget", &format!("cost ${:.2}", cost_usd));
                    }
                    crate::coordination::Event::BudgetLimit { cost_usd, .. } => {
                        tracing::warn!("session cost ${:.2} hit the limit; paused", cost_usd);
                        logger.log("warn", "budget", &format!("limit at ${:.2}", cost_usd));
                    }
                    crate::coordination::Event::PrCompleted { url, .. } => {
                        tracing::info!("PR created: {}", url);
                        logger.log("info", "pr", &url);
                    }
                    _ => {}
                }
            }
        })
    };

    let coordinator = UltraPlanCoordinator::new(
        session,
        env.store.clone(),
        env.git.clone(),
        runner,
        bus,
        budget,
        env.config.clone(),
        env.main_branch.clone(),
        cancel,
    );
    let result = coordinator.run().await;
    narrator.abort();
    drop(lock);

    match result {
        Ok(()) => {
            let session = env.store.load_session(&session_id)?;
            let phase = session
                .ultra_plan
                .as_ref()
                .map(|u| u.phase.clone())
                .unwrap_or(Phase::Done);
            println!(
                "{}",
                env.formatter
                    .format_success(&format!("session {} reached {}", short_id(&session_id), phase), None)
            );
            Ok(())
        }
        Err(e) => {
            logger.log("error", "orchestrator", &e.to_string());
            Err(e)
        }
    }
}

fn objective_name(objective: &str) -> String {
    let slug = crate::git::slugify(objective);
    if slug.is_empty() {
        "ultraplan".to_string()
    } else {
        slug
    }
}

fn confirm(question: &str) -> Result<bool> {
    use std::io::Write;
    print!("{} [y/N] ", question);
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

fn spawn_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; winding down");
            cancel.cancel();
        }
    });
}

// ----- pr / config / logs -------------------------------------------------

async fn cmd_pr(env: &AppEnv) -> Result<()> {
    let session = env.latest_session()?;
    let mux = env.mux().await?;
    let bus = Arc::new(EventBus::new());
    let workflow = PrWorkflow::new(
        env.git.clone(),
        mux,
        Arc::new(GhPrBackend),
        bus,
        env.config.pr.clone(),
        env.config.agent.command.clone(),
        env.main_branch.clone(),
    );
    let outcomes = workflow.run_all(&session).await;

    let mut failures = 0;
    for outcome in &outcomes {
        match &outcome.result {
            Ok(url) => println!(
                "{}",
                env.formatter
                    .format_success(&format!("{}: {}", short_id(&outcome.instance_id), url), None)
            ),
            Err(e) => {
                failures += 1;
                println!(
                    "{}",
                    env.formatter
                        .format_error(&format!("{}: {}", short_id(&outcome.instance_id), e))
                );
            }
        }
    }
    if failures > 0 {
        return Err(ClaudioError::PhaseFailure {
            phase: "pr".to_string(),
            reason: format!("{} of {} instances failed", failures, outcomes.len()),
        });
    }
    Ok(())
}

fn cmd_config(env: &AppEnv, cli: &Cli, command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            println!("{}", env.config.to_yaml()?);
            Ok(())
        }
        ConfigCommands::Path => {
            match ClaudioConfig::discover_path(cli.config.as_deref()) {
                Some(path) => println!("{}", path.display()),
                None => println!("(no config file; defaults in effect)"),
            }
            Ok(())
        }
        ConfigCommands::Init => {
            let path = PathBuf::from("config.yaml");
            if path.exists() {
                return Err(ClaudioError::Configuration(
                    "config.yaml already exists".to_string(),
                ));
            }
            std::fs::write(&path, ClaudioConfig::default().to_yaml()?)?;
            println!(
                "{}",
                env.formatter
                    .format_success(&format!("wrote {}", path.display()), None)
            );
            Ok(())
        }
        ConfigCommands::Set { key, value } => {
            let path = ClaudioConfig::discover_path(cli.config.as_deref())
                .unwrap_or_else(|| PathBuf::from("config.yaml"));
            let mut config = if path.exists() {
                ClaudioConfig::from_file(&path)?
            } else {
                ClaudioConfig::default()
            };
            config.set_key(&key, &value)?;
            config.validate()?;
            std::fs::write(&path, config.to_yaml()?)?;
            println!(
                "{}",
                env.formatter
                    .format_success(&format!("{} = {} ({})", key, value, path.display()), None)
            );
            Ok(())
        }
    }
}

async fn cmd_logs(
    env: &AppEnv,
    session: Option<String>,
    lines: usize,
    follow: bool,
    level: Option<String>,
    since: Option<String>,
    grep: Option<String>,
) -> Result<()> {
    let session = env.resolve_or_latest(session.as_deref())?;
    let path = env.store.session_dir(&session.id).join("debug.log");

    let filter = LogFilter {
        level,
        since: since.map(|s| parse_since(&s)).transpose()?,
        grep: grep
            .map(|g| regex::Regex::new(&g))
            .transpose()
            .map_err(|e| ClaudioError::Configuration(format!("invalid --grep: {}", e)))?,
        tail: Some(lines),
    };

    let mut printed = print_entries(&logging::read_log(&path, &filter)?, 0);
    if follow {
        loop {
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            let all = logging::read_log(
                &path,
                &LogFilter {
                    tail: None,
                    ..filter.clone()
                },
            )?;
            printed = print_entries(&all, printed);
        }
    }
    Ok(())
}

fn print_entries(entries: &[logging::LogEntry], skip: usize) -> usize {
    for entry in entries.iter().skip(skip) {
        println!(
            "{} [{}] {} {}",
            entry.ts.format("%H:%M:%S%.3f"),
            entry.level,
            entry.target,
            entry.message
        );
    }
    entries.len()
}

/// `30m` / `2h` / `1d`, or a full RFC3339 timestamp.
fn parse_since(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    let (number, unit) = raw.split_at(raw.len().saturating_sub(1));
    let value: i64 = number
        .parse()
        .map_err(|_| ClaudioError::Configuration(format!("invalid --since: {}", raw)))?;
    let delta = match unit {
        "m" => ChronoDuration::minutes(value),
        "h" => ChronoDuration::hours(value),
        "d" => ChronoDuration::days(value),
        _ => {
            return Err(ClaudioError::Configuration(format!(
                "invalid --since unit: {}",
                raw
            )))
        }
    };
    Ok(Utc::now() - delta)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_since_relative() {
        let thirty_minutes = parse_since("30m").unwrap();
        assert!(Utc::now() - thirty_minutes >= ChronoDuration::minutes(29));

        assert!(parse_since("2h").is_ok());
        assert!(parse_since("1d").is_ok());
        assert!(parse_since("nope").is_err());
    }

    #[test]
    fn test_parse_since_rfc3339() {
        let parsed = parse_since("2026-01-05T10:00:00Z").unwrap();
        assert_eq!(parsed.format("%Y-%m-%d").to_string(), "2026-01-05");
    }

    #[test]
    fn test_objective_name() {
        assert_eq!(objective_name("Ship the auth flow!"), "ship-the-auth-flow");
        assert_eq!(objective_name("!!!"), "ultraplan");
    }

    #[test]
    fn test_cli_parses_ultraplan() {
        let cli = Cli::parse_from([
            "claudio",
            "ultraplan",
            "refactor the config loader",
            "--max-parallel",
            "3",
            "--multi-pass",
        ]);
        match cli.command {
            Commands::Ultraplan {
                objective,
                max_parallel,
                multi_pass,
                ..
            } => {
                assert_eq!(objective.as_deref(), Some("refactor the config loader"));
                assert_eq!(max_parallel, Some(3));
                assert!(multi_pass);
            }
            _ => panic!("wrong command"),
        }
    }

    #[test]
    fn test_cli_parses_cleanup_flags() {
        let cli = Cli::parse_from(["claudio", "cleanup", "--dry-run", "--branches"]);
        match cli.command {
            Commands::Cleanup {
                dry_run, branches, ..
            } => {
                assert!(dry_run);
                assert!(branches);
            }
            _ => panic!("wrong command"),
        }
    }
}

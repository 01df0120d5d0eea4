//! Configuration loading and validation
//!
//! Configuration is discovered in order: an explicit `--config` path, then
//! `$XDG_CONFIG_HOME/claudio/config.yaml` (falling back to
//! `$HOME/.config/claudio/config.yaml`), then `./config.yaml`. The first
//! file found is loaded; environment variables named `CLAUDIO_<SECTION>_<KEY>`
//! override individual keys afterwards. Invalid values fail fast at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::utils::error::{ClaudioError, Result};

pub const BRANCH_PREFIX_MAX_LEN: usize = 50;

/// Branch naming options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BranchConfig {
    /// Branch name prefix; must match `^[A-Za-z][A-Za-z0-9_-]*$`.
    pub prefix: String,
    /// Include the instance id (first 8 chars) in branch names.
    pub include_id: bool,
}

impl Default for BranchConfig {
    fn default() -> Self {
        Self {
            prefix: "claudio".to_string(),
            include_id: true,
        }
    }
}

/// Per-instance supervision options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    /// Ring buffer size in bytes (1 KiB - 100 MiB).
    pub output_buffer_size: usize,
    /// Pane capture period in milliseconds (10 - 5000).
    pub capture_interval_ms: u64,
    /// tmux window width.
    pub tmux_width: u32,
    /// tmux window height.
    pub tmux_height: u32,
    /// Stall threshold in minutes; 0 disables.
    pub activity_timeout_minutes: u64,
    /// Absolute runtime cap in minutes; 0 disables.
    pub completion_timeout_minutes: u64,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            output_buffer_size: 100 * 1024,
            capture_interval_ms: 100,
            tmux_width: 220,
            tmux_height: 50,
            activity_timeout_minutes: 30,
            completion_timeout_minutes: 120,
        }
    }
}

/// Session-wide resource budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// USD threshold for the advisory warning.
    pub cost_warning_threshold: f64,
    /// USD cap; 0 disables.
    pub cost_limit: f64,
    /// Per-instance token cap; 0 disables.
    pub token_limit_per_instance: u64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            cost_warning_threshold: 10.0,
            cost_limit: 0.0,
            token_limit_per_instance: 0,
        }
    }
}

/// How consolidation turns group branches into PRs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsolidationMode {
    /// One PR per group, each stacked onto the previous.
    Stacked,
    /// A single PR containing everything.
    Single,
}

/// Ultra-plan orchestration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UltraPlanConfig {
    /// Scheduler parallelism cap (1 - 20).
    pub max_parallel: usize,
    /// Spawn three competing planners and a selection manager.
    pub multi_pass: bool,
    pub consolidation_mode: ConsolidationMode,
    /// Revision cap per task.
    pub max_task_retries: u32,
}

impl Default for UltraPlanConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            multi_pass: false,
            consolidation_mode: ConsolidationMode::Stacked,
            max_task_retries: 2,
        }
    }
}

/// PR creation defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrConfig {
    pub draft: bool,
    pub auto_rebase: bool,
    pub use_ai: bool,
    /// Body template; `{task}`, `{branch}`, `{files}` are substituted.
    pub template: String,
    pub reviewers: Vec<String>,
    pub labels: Vec<String>,
}

impl Default for PrConfig {
    fn default() -> Self {
        Self {
            draft: false,
            auto_rebase: true,
            use_ai: false,
            template: "## Task\n\n{task}\n\n## Changed files\n\n{files}\n".to_string(),
            reviewers: Vec::new(),
            labels: Vec::new(),
        }
    }
}

/// Session debug-log rotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub max_size_mb: u64,
    pub max_backups: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            max_size_mb: 10,
            max_backups: 3,
        }
    }
}

/// Agent binary invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Command launched inside the worktree; the prompt file path is
    /// appended as shell stdin redirection.
    pub command: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
        }
    }
}

/// Complete claudio configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaudioConfig {
    pub branch: BranchConfig,
    pub instance: InstanceConfig,
    pub resources: ResourceConfig,
    pub ultraplan: UltraPlanConfig,
    pub pr: PrConfig,
    pub logging: LoggingConfig,
    pub agent: AgentConfig,
}

impl ClaudioConfig {
    /// Load configuration, honoring the search order and env overrides.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut cfg = match Self::discover_path(explicit) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        cfg.apply_env_overrides(|name| std::env::var(name).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// First existing config file per the search order.
    pub fn discover_path(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        let mut candidates = Vec::new();
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            candidates.push(PathBuf::from(xdg).join("claudio").join("config.yaml"));
        } else if let Ok(home) = std::env::var("HOME") {
            candidates.push(
                PathBuf::from(home)
                    .join(".config")
                    .join("claudio")
                    .join("config.yaml"),
            );
        }
        candidates.push(PathBuf::from("config.yaml"));
        candidates.into_iter().find(|p| p.exists())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let built = config::Config::builder()
            .add_source(config::File::from(path.to_path_buf()))
            .build()
            .map_err(|e| ClaudioError::Configuration(format!("{}: {}", path.display(), e)))?;
        built
            .try_deserialize()
            .map_err(|e| ClaudioError::Configuration(format!("{}: {}", path.display(), e)))
    }

    pub fn to_yaml(&self) -> Result<String> {
        // Keys are emitted section by section so the file round-trips
        // through the same loader.
        let value = serde_json::to_value(self)?;
        let mut out = String::new();
        if let serde_json::Value::Object(sections) = value {
            for (section, body) in sections {
                out.push_str(&format!("{}:\n", section));
                if let serde_json::Value::Object(keys) = body {
                    for (key, v) in keys {
                        out.push_str(&format!("  {}: {}\n", key, yaml_scalar(&v)));
                    }
                }
            }
        }
        Ok(out)
    }

    /// Apply `CLAUDIO_<SECTION>_<KEY>` overrides. The lookup function is
    /// injected so tests can run without touching the process environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        for &(var, key) in ENV_KEYS {
            if let Some(raw) = lookup(var) {
                self.set_key(key, &raw)?;
            }
        }
        Ok(())
    }

    /// Set a single `section.key` from its string form.
    pub fn set_key(&mut self, key: &str, raw: &str) -> Result<()> {
        let invalid =
            |what: &str| ClaudioError::Configuration(format!("invalid value for {}: {}", what, raw));
        match key {
            "branch.prefix" => self.branch.prefix = raw.to_string(),
            "branch.include_id" => {
                self.branch.include_id = raw.parse().map_err(|_| invalid(key))?
            }
            "instance.output_buffer_size" => {
                self.instance.output_buffer_size = raw.parse().map_err(|_| invalid(key))?
            }
            "instance.capture_interval_ms" => {
                self.instance.capture_interval_ms = raw.parse().map_err(|_| invalid(key))?
            }
            "instance.tmux_width" => {
                self.instance.tmux_width = raw.parse().map_err(|_| invalid(key))?
            }
            "instance.tmux_height" => {
                self.instance.tmux_height = raw.parse().map_err(|_| invalid(key))?
            }
            "instance.activity_timeout_minutes" => {
                self.instance.activity_timeout_minutes = raw.parse().map_err(|_| invalid(key))?
            }
            "instance.completion_timeout_minutes" => {
                self.instance.completion_timeout_minutes = raw.parse().map_err(|_| invalid(key))?
            }
            "resources.cost_warning_threshold" => {
                self.resources.cost_warning_threshold = raw.parse().map_err(|_| invalid(key))?
            }
            "resources.cost_limit" => {
                self.resources.cost_limit = raw.parse().map_err(|_| invalid(key))?
            }
            "resources.token_limit_per_instance" => {
                self.resources.token_limit_per_instance =
                    raw.parse().map_err(|_| invalid(key))?
            }
            "ultraplan.max_parallel" => {
                self.ultraplan.max_parallel = raw.parse().map_err(|_| invalid(key))?
            }
            "ultraplan.multi_pass" => {
                self.ultraplan.multi_pass = raw.parse().map_err(|_| invalid(key))?
            }
            "ultraplan.consolidation_mode" => {
                self.ultraplan.consolidation_mode = match raw {
                    "stacked" => ConsolidationMode::Stacked,
                    "single" => ConsolidationMode::Single,
                    _ => return Err(invalid(key)),
                }
            }
            "ultraplan.max_task_retries" => {
                self.ultraplan.max_task_retries = raw.parse().map_err(|_| invalid(key))?
            }
            "pr.draft" => self.pr.draft = raw.parse().map_err(|_| invalid(key))?,
            "pr.auto_rebase" => self.pr.auto_rebase = raw.parse().map_err(|_| invalid(key))?,
            "pr.use_ai" => self.pr.use_ai = raw.parse().map_err(|_| invalid(key))?,
            "pr.template" => self.pr.template = raw.to_string(),
            "pr.reviewers" => {
                self.pr.reviewers = raw.split(',').map(|s| s.trim().to_string()).collect()
            }
            "pr.labels" => {
                self.pr.labels = raw.split(',').map(|s| s.trim().to_string()).collect()
            }
            "logging.level" => self.logging.level = raw.to_string(),
            "logging.max_size_mb" => {
                self.logging.max_size_mb = raw.parse().map_err(|_| invalid(key))?
            }
            "logging.max_backups" => {
                self.logging.max_backups = raw.parse().map_err(|_| invalid(key))?
            }
            "agent.command" => self.agent.command = raw.to_string(),
            _ => {
                return Err(ClaudioError::Configuration(format!(
                    "unknown config key: {}",
                    key
                )))
            }
        }
        Ok(())
    }

    /// Range and format checks. Called on every load.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(ClaudioError::Configuration(msg));

        let prefix_re = regex::Regex::new(r"^[A-Za-z][A-Za-z0-9_-]*$").expect("static regex");
        if !prefix_re.is_match(&self.branch.prefix) {
            return fail(format!(
                "branch.prefix '{}' must match ^[A-Za-z][A-Za-z0-9_-]*$",
                self.branch.prefix
            ));
        }
        if self.branch.prefix.len() > BRANCH_PREFIX_MAX_LEN {
            return fail(format!(
                "branch.prefix length {} exceeds {}",
                self.branch.prefix.len(),
                BRANCH_PREFIX_MAX_LEN
            ));
        }
        if !(1024..=100 * 1024 * 1024).contains(&self.instance.output_buffer_size) {
            return fail(format!(
                "instance.output_buffer_size {} outside 1KiB-100MiB",
                self.instance.output_buffer_size
            ));
        }
        if !(10..=5000).contains(&self.instance.capture_interval_ms) {
            return fail(format!(
                "instance.capture_interval_ms {} outside 10-5000",
                self.instance.capture_interval_ms
            ));
        }
        if !(1..=20).contains(&self.ultraplan.max_parallel) {
            return fail(format!(
                "ultraplan.max_parallel {} outside 1-20",
                self.ultraplan.max_parallel
            ));
        }
        if self.resources.cost_limit < 0.0 || self.resources.cost_warning_threshold < 0.0 {
            return fail("resource thresholds must be non-negative".to_string());
        }
        Ok(())
    }
}

fn yaml_scalar(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => format!("{:?}", s),
        serde_json::Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(yaml_scalar).collect();
            format!("[{}]", inner.join(", "))
        }
        other => other.to_string(),
    }
}

/// Environment variable to dotted key, one row per configurable option.
const ENV_KEYS: &[(&str, &str)] = &[
    ("CLAUDIO_BRANCH_PREFIX", "branch.prefix"),
    ("CLAUDIO_BRANCH_INCLUDE_ID", "branch.include_id"),
    (
        "CLAUDIO_INSTANCE_OUTPUT_BUFFER_SIZE",
        "instance.output_buffer_size",
    ),
    (
        "CLAUDIO_INSTANCE_CAPTURE_INTERVAL_MS",
        "instance.capture_interval_ms",
    ),
    ("CLAUDIO_INSTANCE_TMUX_WIDTH", "instance.tmux_width"),
    ("CLAUDIO_INSTANCE_TMUX_HEIGHT", "instance.tmux_height"),
    (
        "CLAUDIO_INSTANCE_ACTIVITY_TIMEOUT_MINUTES",
        "instance.activity_timeout_minutes",
    ),
    (
        "CLAUDIO_INSTANCE_COMPLETION_TIMEOUT_MINUTES",
        "instance.completion_timeout_minutes",
    ),
    (
        "CLAUDIO_RESOURCES_COST_WARNING_THRESHOLD",
        "resources.cost_warning_threshold",
    ),
    ("CLAUDIO_RESOURCES_COST_LIMIT", "resources.cost_limit"),
    (
        "CLAUDIO_RESOURCES_TOKEN_LIMIT_PER_INSTANCE",
        "resources.token_limit_per_instance",
    ),
    ("CLAUDIO_ULTRAPLAN_MAX_PARALLEL", "ultraplan.max_parallel"),
    ("CLAUDIO_ULTRAPLAN_MULTI_PASS", "ultraplan.multi_pass"),
    (
        "CLAUDIO_ULTRAPLAN_CONSOLIDATION_MODE",
        "ultraplan.consolidation_mode",
    ),
    (
        "CLAUDIO_ULTRAPLAN_MAX_TASK_RETRIES",
        "ultraplan.max_task_retries",
    ),
    ("CLAUDIO_PR_DRAFT", "pr.draft"),
    ("CLAUDIO_PR_AUTO_REBASE", "pr.auto_rebase"),
    ("CLAUDIO_PR_USE_AI", "pr.use_ai"),
    ("CLAUDIO_PR_TEMPLATE", "pr.template"),
    ("CLAUDIO_PR_REVIEWERS", "pr.reviewers"),
    ("CLAUDIO_PR_LABELS", "pr.labels"),
    ("CLAUDIO_LOGGING_LEVEL", "logging.level"),
    ("CLAUDIO_LOGGING_MAX_SIZE_MB", "logging.max_size_mb"),
    ("CLAUDIO_LOGGING_MAX_BACKUPS", "logging.max_backups"),
    ("CLAUDIO_AGENT_COMMAND", "agent.command"),
];

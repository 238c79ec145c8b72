//! Run configuration.
//!
//! One explicit record for every recognized option. The whole tree is
//! `deny_unknown_fields`, so a misspelled key fails at load time instead of
//! silently falling back to a default.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// What to do when a task attempt fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskFailurePolicy {
    /// Reset the task to pending and try again.
    #[default]
    Retry,
    /// Surface the failure and end the run.
    FailFast,
}

impl TaskFailurePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::FailFast => "fail_fast",
        }
    }
}

/// Manifest compliance enforcement level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementMode {
    Off,
    #[default]
    Warn,
    Block,
}

impl EnforcementMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Warn => "warn",
            Self::Block => "block",
        }
    }
}

/// Budget breach handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetMode {
    #[default]
    Warn,
    Block,
}

impl BudgetMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Warn => "warn",
            Self::Block => "block",
        }
    }
}

/// How effective write locks are computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// Use the manifest's declared locks verbatim.
    #[default]
    Declared,
    /// Expand declared file globs to owning component locks.
    Derived,
}

impl LockMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Declared => "declared",
            Self::Derived => "derived",
        }
    }
}

/// Cleanup policy for workspaces and containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupPolicy {
    #[default]
    Never,
    OnSuccess,
}

impl CleanupPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Never => "never",
            Self::OnSuccess => "on_success",
        }
    }
}

/// A named resource mapping symbolic lock names to path globs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceDecl {
    pub name: String,
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CleanupConfig {
    pub workspaces: CleanupPolicy,
    pub containers: CleanupPolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BudgetConfig {
    pub max_tokens_per_task: Option<u64>,
    pub max_cost_per_run: Option<f64>,
    pub mode: BudgetMode,
}

/// Glob patterns that mark a changed file as a surface change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SurfacePatterns {
    pub contract: Vec<String>,
    pub config: Vec<String>,
    pub migration: Vec<String>,
    pub public_entrypoint: Vec<String>,
}

impl Default for SurfacePatterns {
    fn default() -> Self {
        Self {
            contract: vec![
                "**/openapi*.{json,yaml,yml}".into(),
                "**/*.proto".into(),
                "**/*.graphql".into(),
                "**/schema/**".into(),
            ],
            config: vec![
                "**/.env*".into(),
                "**/config/**".into(),
                "**/k8s/**".into(),
                "**/helm/**".into(),
            ],
            migration: vec!["**/migrations/**".into(), "**/migrate/**".into()],
            public_entrypoint: vec![
                "**/index.{ts,js}".into(),
                "**/main.{ts,js,rs,py,go}".into(),
                "**/package.json".into(),
            ],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SurfaceLocksConfig {
    pub enabled: bool,
}

/// Code-graph subsystem configuration, as it feeds lock derivation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControlPlaneConfig {
    pub enabled: bool,
    pub lock_mode: LockMode,
    pub scope_mode: Option<String>,
    /// Resource used when file ownership cannot be resolved.
    pub fallback_resource: String,
    pub resources_mode: Option<String>,
    pub surface_patterns: SurfacePatterns,
    pub surface_locks: SurfaceLocksConfig,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            lock_mode: LockMode::Declared,
            scope_mode: None,
            fallback_resource: "repo-root".to_string(),
            resources_mode: None,
            surface_patterns: SurfacePatterns::default(),
            surface_locks: SurfaceLocksConfig::default(),
        }
    }
}

/// Worker model and behavior knobs passed through to attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    pub model: String,
    pub checkpoint_commits: bool,
    pub reasoning_effort: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            model: "sonnet".to_string(),
            checkpoint_commits: true,
            reasoning_effort: None,
        }
    }
}

/// Container engine settings for the container-backed worker runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DockerConfig {
    pub image: String,
    pub dockerfile: Option<String>,
    pub build_context: Option<String>,
    pub user: Option<String>,
    pub network_mode: Option<String>,
    pub memory_mb: Option<u64>,
    pub cpu_quota: Option<u64>,
    pub pids_limit: Option<u64>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            image: "mycelium-worker:latest".to_string(),
            dockerfile: None,
            build_context: None,
            user: None,
            network_mode: None,
            memory_mb: None,
            cpu_quota: None,
            pids_limit: None,
        }
    }
}

/// The full run configuration record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    pub repo_path: PathBuf,
    pub main_branch: String,
    /// Tasks directory, relative to `repo_path` unless absolute.
    pub tasks_dir: PathBuf,
    pub planning_dir: Option<PathBuf>,
    pub max_parallel: usize,
    /// Worker attempts per task before the failure policy gives up.
    /// `0` means unlimited attempts (a deliberate sentinel, not "no retries").
    pub max_retries: u32,
    pub task_failure_policy: TaskFailurePolicy,
    pub manifest_enforcement: EnforcementMode,
    /// Integration doctor command, run on `main_branch` after each merge.
    pub doctor: Option<String>,
    /// Seconds before a doctor invocation is killed (0 = no timeout).
    pub doctor_timeout: u64,
    pub lint: Option<String>,
    pub lint_timeout: u64,
    /// Commands workers run before the attempt body.
    pub bootstrap: Vec<String>,
    pub resources: Vec<ResourceDecl>,
    pub cleanup: CleanupConfig,
    pub budgets: BudgetConfig,
    pub control_plane: ControlPlaneConfig,
    pub worker: WorkerConfig,
    pub docker: DockerConfig,
    /// Stop and remove this run's containers on graceful stop. When false
    /// containers keep running so a resume can reattach.
    pub stop_containers_on_exit: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            repo_path: PathBuf::from("."),
            main_branch: "main".to_string(),
            tasks_dir: PathBuf::from(".mycelium/tasks"),
            planning_dir: None,
            max_parallel: 4,
            max_retries: 3,
            task_failure_policy: TaskFailurePolicy::Retry,
            manifest_enforcement: EnforcementMode::Warn,
            doctor: None,
            doctor_timeout: 1800,
            lint: None,
            lint_timeout: 600,
            bootstrap: Vec::new(),
            resources: Vec::new(),
            cleanup: CleanupConfig::default(),
            budgets: BudgetConfig::default(),
            control_plane: ControlPlaneConfig::default(),
            worker: WorkerConfig::default(),
            docker: DockerConfig::default(),
            stop_containers_on_exit: false,
        }
    }
}

impl RunConfig {
    /// Load a config file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse a TOML document, merging with defaults.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.max_parallel == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_parallel".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.main_branch.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "main_branch".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        for resource in &self.resources {
            if resource.name.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: "resources".to_string(),
                    message: "resource name must not be empty".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Absolute tasks directory.
    pub fn tasks_root(&self) -> PathBuf {
        if self.tasks_dir.is_absolute() {
            self.tasks_dir.clone()
        } else {
            self.repo_path.join(&self.tasks_dir)
        }
    }

    /// Names of all declared resources.
    pub fn resource_names(&self) -> std::collections::BTreeSet<String> {
        self.resources.iter().map(|r| r.name.clone()).collect()
    }

    /// Whether `max_retries` means unlimited attempts.
    pub fn unlimited_retries(&self) -> bool {
        self.max_retries == 0
    }
}

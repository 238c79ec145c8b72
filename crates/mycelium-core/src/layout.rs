//! Filesystem layout.
//!
//! Two roots: the mycelium home (state, logs, workspaces, ledger) and the
//! target repository (task specs, control-plane models). Everything that
//! builds a persisted path goes through here so the layout stays in one
//! place.

use std::path::{Path, PathBuf};

/// Default home directory name under `$HOME`.
pub const DEFAULT_HOME_DIR: &str = ".mycelium";

/// The mycelium home: `<home>/{state,logs,workspaces}/...`.
#[derive(Debug, Clone)]
pub struct MyceliumHome {
    root: PathBuf,
}

impl MyceliumHome {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve from an explicit path or `$MYCELIUM_HOME`, else `~/.mycelium`.
    pub fn resolve(explicit: Option<&Path>) -> Self {
        if let Some(path) = explicit {
            return Self::new(path);
        }
        if let Some(env) = std::env::var_os("MYCELIUM_HOME") {
            return Self::new(PathBuf::from(env));
        }
        let home = std::env::var_os("HOME").map_or_else(|| PathBuf::from("."), PathBuf::from);
        Self::new(home.join(DEFAULT_HOME_DIR))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_dir(&self, project: &str) -> PathBuf {
        self.root.join("state").join(project)
    }

    pub fn run_state_path(&self, project: &str, run_id: &str) -> PathBuf {
        self.state_dir(project).join(format!("run-{run_id}.json"))
    }

    pub fn history_path(&self, project: &str) -> PathBuf {
        self.state_dir(project).join("history.json")
    }

    pub fn ledger_path(&self, project: &str) -> PathBuf {
        self.state_dir(project).join("ledger.json")
    }

    pub fn run_logs_dir(&self, project: &str, run_id: &str) -> PathBuf {
        self.root
            .join("logs")
            .join(project)
            .join(format!("run-{run_id}"))
    }

    pub fn orchestrator_log_path(&self, project: &str, run_id: &str) -> PathBuf {
        self.run_logs_dir(project, run_id).join("orchestrator.jsonl")
    }

    pub fn task_log_dir(&self, project: &str, run_id: &str, task_id: &str, slug: &str) -> PathBuf {
        self.run_logs_dir(project, run_id)
            .join("tasks")
            .join(format!("{task_id}-{slug}"))
    }

    pub fn task_log_path(&self, project: &str, run_id: &str, task_id: &str, slug: &str) -> PathBuf {
        self.task_log_dir(project, run_id, task_id, slug)
            .join("events.jsonl")
    }

    pub fn validator_dir(&self, project: &str, run_id: &str) -> PathBuf {
        self.run_logs_dir(project, run_id).join("validators")
    }

    pub fn validator_log_path(&self, project: &str, run_id: &str, name: &str) -> PathBuf {
        self.validator_dir(project, run_id)
            .join(format!("{name}.jsonl"))
    }

    pub fn validator_report_path(
        &self,
        project: &str,
        run_id: &str,
        name: &str,
        label: &str,
    ) -> PathBuf {
        self.validator_dir(project, run_id)
            .join(name)
            .join(format!("{label}.json"))
    }

    pub fn workspace_dir(&self, project: &str, run_id: &str, task_id: &str) -> PathBuf {
        self.root
            .join("workspaces")
            .join(project)
            .join(run_id)
            .join(task_id)
    }
}

/// Task spec layout inside the target repository.
#[derive(Debug, Clone)]
pub struct TasksLayout {
    root: PathBuf,
}

impl TasksLayout {
    pub fn new(tasks_root: impl Into<PathBuf>) -> Self {
        Self {
            root: tasks_root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn backlog_dir(&self) -> PathBuf {
        self.root.join("backlog")
    }

    pub fn active_dir(&self) -> PathBuf {
        self.root.join("active")
    }

    pub fn archive_root(&self) -> PathBuf {
        self.root.join("archive")
    }

    pub fn archive_dir(&self, run_id: &str) -> PathBuf {
        self.archive_root().join(run_id)
    }

    /// Whether this tasks directory uses the staged layout.
    pub fn is_staged(&self) -> bool {
        self.backlog_dir().is_dir() || self.active_dir().is_dir() || self.archive_root().is_dir()
    }

    pub fn task_dir_name(task_id: &str, slug: &str) -> String {
        format!("{task_id}-{slug}")
    }
}

/// Control-plane model directory for a baseline commit:
/// `<repo>/.mycelium/control-plane/models/<base_sha>/`.
pub fn control_plane_model_dir(repo_path: &Path, base_sha: &str) -> PathBuf {
    repo_path
        .join(".mycelium/control-plane/models")
        .join(base_sha)
}

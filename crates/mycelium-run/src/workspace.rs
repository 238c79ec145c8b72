//! Per-task workspace management.
//!
//! Each live task owns a linked git working tree under
//! `<home>/workspaces/<project>/<run_id>/<task_id>/`, rooted at the task
//! branch off the integration branch. An existing workspace is recovered
//! with `reset --hard` + `clean -fdx` when the failure policy allows
//! retries; removal is best-effort.

use crate::vcs;
use mycelium_core::config::TaskFailurePolicy;
use mycelium_core::MyceliumHome;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("git error: {0}")]
    Vcs(#[from] vcs::VcsError),
}

pub type Result<T> = std::result::Result<T, WorkspaceError>;

/// Result of preparing a task workspace.
#[derive(Debug, Clone)]
pub struct WorkspacePrep {
    pub workspace_path: PathBuf,
    /// True when the working tree was created by this call.
    pub created: bool,
    /// True when an existing tree was reset back to a clean state.
    pub recovered: bool,
}

/// Creates, recovers, and removes per-task working trees.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    home: MyceliumHome,
    project: String,
}

impl WorkspaceManager {
    pub fn new(home: MyceliumHome, project: impl Into<String>) -> Self {
        Self {
            home,
            project: project.into(),
        }
    }

    pub fn workspace_dir(&self, run_id: &str, task_id: &str) -> PathBuf {
        self.home.workspace_dir(&self.project, run_id, task_id)
    }

    /// Ensure a working tree exists for the task branch.
    ///
    /// A pre-existing workspace is recovered (reset + clean) under the
    /// `retry` failure policy; under `fail_fast` it is left untouched so the
    /// failure site stays inspectable.
    pub fn prepare_task_workspace(
        &self,
        repo: &Path,
        run_id: &str,
        task_id: &str,
        task_branch: &str,
        main_branch: &str,
        failure_policy: TaskFailurePolicy,
    ) -> Result<WorkspacePrep> {
        let dir = self.workspace_dir(run_id, task_id);

        if is_worktree(&dir) {
            if failure_policy == TaskFailurePolicy::Retry {
                // Reset the task branch onto the current integration head so
                // the fresh attempt starts from what actually merged, not
                // from the previous attempt's commits.
                info!(task_id, workspace = %dir.display(), "recovering existing workspace");
                vcs::reset_and_clean(&dir, main_branch)?;
                return Ok(WorkspacePrep {
                    workspace_path: dir,
                    created: false,
                    recovered: true,
                });
            }
            debug!(task_id, workspace = %dir.display(), "reusing existing workspace as-is");
            return Ok(WorkspacePrep {
                workspace_path: dir,
                created: false,
                recovered: false,
            });
        }

        if dir.exists() {
            // A directory that is not a worktree is leftover junk; replace it.
            warn!(workspace = %dir.display(), "removing non-worktree debris");
            std::fs::remove_dir_all(&dir)?;
        }

        vcs::create_worktree(repo, &dir, task_branch, main_branch)?;
        Ok(WorkspacePrep {
            workspace_path: dir,
            created: true,
            recovered: false,
        })
    }

    /// Best-effort removal of a task workspace.
    pub fn remove_task_workspace(&self, repo: &Path, run_id: &str, task_id: &str) {
        let dir = self.workspace_dir(run_id, task_id);
        if !dir.exists() {
            return;
        }
        if let Err(err) = vcs::remove_worktree(repo, &dir) {
            warn!(workspace = %dir.display(), error = %err, "worktree removal failed; deleting directory");
            if let Err(err) = std::fs::remove_dir_all(&dir) {
                warn!(workspace = %dir.display(), error = %err, "workspace cleanup failed");
            }
        }
    }
}

/// A linked working tree carries a `.git` file (not a directory).
fn is_worktree(dir: &Path) -> bool {
    dir.join(".git").exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    fn run_git(dir: &Path, args: &[&str]) {
        let output = Command::new("git").args(args).current_dir(dir).output().unwrap();
        assert!(
            output.status.success(),
            "git {:?}: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    fn setup() -> (TempDir, PathBuf, WorkspaceManager) {
        let dir = TempDir::new().unwrap();
        let repo = dir.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        run_git(&repo, &["init", "-b", "main"]);
        run_git(&repo, &["config", "user.email", "test@test.com"]);
        run_git(&repo, &["config", "user.name", "Test"]);
        std::fs::write(repo.join("README.md"), "# Test\n").unwrap();
        run_git(&repo, &["add", "."]);
        run_git(&repo, &["commit", "-m", "Initial commit"]);

        let home = MyceliumHome::new(dir.path().join("home"));
        let manager = WorkspaceManager::new(home, "demo");
        (dir, repo, manager)
    }

    #[test]
    fn prepare_creates_worktree_on_task_branch() {
        let (_dir, repo, manager) = setup();
        let prep = manager
            .prepare_task_workspace(
                &repo,
                "r1",
                "001",
                "agent/001-alpha",
                "main",
                TaskFailurePolicy::Retry,
            )
            .unwrap();

        assert!(prep.created);
        assert!(!prep.recovered);
        assert!(prep.workspace_path.join("README.md").is_file());
        assert_eq!(
            vcs::current_branch(&prep.workspace_path).unwrap(),
            "agent/001-alpha"
        );
    }

    #[test]
    fn prepare_recovers_dirty_workspace_under_retry() {
        let (_dir, repo, manager) = setup();
        let prep = manager
            .prepare_task_workspace(
                &repo,
                "r1",
                "001",
                "agent/001-alpha",
                "main",
                TaskFailurePolicy::Retry,
            )
            .unwrap();

        std::fs::write(prep.workspace_path.join("junk.txt"), "junk").unwrap();
        std::fs::write(prep.workspace_path.join("README.md"), "scribble").unwrap();

        let again = manager
            .prepare_task_workspace(
                &repo,
                "r1",
                "001",
                "agent/001-alpha",
                "main",
                TaskFailurePolicy::Retry,
            )
            .unwrap();
        assert!(!again.created);
        assert!(again.recovered);
        assert!(!again.workspace_path.join("junk.txt").exists());
        assert_eq!(
            std::fs::read_to_string(again.workspace_path.join("README.md")).unwrap(),
            "# Test\n"
        );
    }

    #[test]
    fn prepare_leaves_workspace_alone_under_fail_fast() {
        let (_dir, repo, manager) = setup();
        let prep = manager
            .prepare_task_workspace(
                &repo,
                "r1",
                "001",
                "agent/001-alpha",
                "main",
                TaskFailurePolicy::FailFast,
            )
            .unwrap();
        std::fs::write(prep.workspace_path.join("evidence.txt"), "keep me").unwrap();

        let again = manager
            .prepare_task_workspace(
                &repo,
                "r1",
                "001",
                "agent/001-alpha",
                "main",
                TaskFailurePolicy::FailFast,
            )
            .unwrap();
        assert!(!again.created);
        assert!(!again.recovered);
        assert!(again.workspace_path.join("evidence.txt").is_file());
    }

    #[test]
    fn remove_is_best_effort_and_idempotent() {
        let (_dir, repo, manager) = setup();
        let prep = manager
            .prepare_task_workspace(
                &repo,
                "r1",
                "001",
                "agent/001-alpha",
                "main",
                TaskFailurePolicy::Retry,
            )
            .unwrap();

        manager.remove_task_workspace(&repo, "r1", "001");
        assert!(!prep.workspace_path.exists());

        // Removing a workspace that is already gone does nothing.
        manager.remove_task_workspace(&repo, "r1", "001");
    }
}

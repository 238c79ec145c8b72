//! Git operations for the run engine.
//!
//! Branch naming, diff enumeration, worktree lifecycle, the temp-merge probe,
//! and the final integration merge. All operations shell out to the `git`
//! CLI and run against the integration repository or a task workspace.

use mycelium_core::slugify;
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::{debug, warn};

/// Branch prefix for task branches.
pub const TASK_BRANCH_PREFIX: &str = "agent/";

/// Upper bound on generated branch names.
const MAX_BRANCH_LENGTH: usize = 80;

#[derive(Debug, Error)]
pub enum VcsError {
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("failed to execute git: {0}")]
    Execution(#[from] std::io::Error),
    #[error("invalid utf-8 in git output")]
    InvalidUtf8,
    #[error("ref not found: {0}")]
    RefNotFound(String),
}

pub type Result<T> = std::result::Result<T, VcsError>;

/// A per-branch merge conflict from the temp-merge probe.
#[derive(Debug, Clone)]
pub struct MergeConflict {
    pub branch: String,
    pub message: String,
}

/// Outcome of probing a group of candidate branches.
#[derive(Debug)]
pub struct TempMergeOutcome {
    pub merged: bool,
    pub conflicts: Vec<MergeConflict>,
    /// HEAD of the probe branch when every candidate merged cleanly.
    pub merge_commit: Option<String>,
}

/// Deterministic task branch name: `agent/<task_id>-<slug>`, sanitized and
/// length-bounded.
pub fn task_branch_name(task_id: &str, slug: &str) -> String {
    let mut name = format!("{TASK_BRANCH_PREFIX}{}-{}", slugify(task_id), slugify(slug));
    if name.len() > MAX_BRANCH_LENGTH {
        name.truncate(MAX_BRANCH_LENGTH);
        // Never end on a separator after truncation.
        while name.ends_with('-') || name.ends_with('/') {
            name.pop();
        }
    }
    name
}

fn git(repo: &Path, args: &[&str]) -> Result<std::process::Output> {
    debug!(repo = %repo.display(), ?args, "git");
    Ok(Command::new("git").args(args).current_dir(repo).output()?)
}

fn git_ok(repo: &Path, args: &[&str]) -> Result<String> {
    let output = git(repo, args)?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(VcsError::CommandFailed(format!(
            "git {}: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    String::from_utf8(output.stdout)
        .map(|s| s.trim().to_string())
        .map_err(|_| VcsError::InvalidUtf8)
}

/// Resolve a ref to a commit sha.
pub fn rev_parse(repo: &Path, reference: &str) -> Result<String> {
    let output = git(repo, &["rev-parse", "--verify", reference])?;
    if !output.status.success() {
        return Err(VcsError::RefNotFound(reference.to_string()));
    }
    String::from_utf8(output.stdout)
        .map(|s| s.trim().to_string())
        .map_err(|_| VcsError::InvalidUtf8)
}

/// The integration baseline: sha of `main_branch` at this moment.
pub fn base_sha(repo: &Path, main_branch: &str) -> Result<String> {
    rev_parse(repo, main_branch)
}

pub fn branch_exists(repo: &Path, branch: &str) -> Result<bool> {
    let output = git(repo, &["rev-parse", "--verify", &format!("refs/heads/{branch}")])?;
    Ok(output.status.success())
}

/// Create a branch from base without checking it out.
pub fn create_branch(repo: &Path, branch: &str, base: &str) -> Result<()> {
    git_ok(repo, &["branch", branch, base]).map(|_| ())
}

pub fn delete_branch(repo: &Path, branch: &str) -> Result<()> {
    git_ok(repo, &["branch", "-D", branch]).map(|_| ())
}

pub fn checkout(repo: &Path, branch: &str) -> Result<()> {
    git_ok(repo, &["checkout", branch]).map(|_| ())
}

pub fn current_branch(repo: &Path) -> Result<String> {
    git_ok(repo, &["branch", "--show-current"])
}

/// Files changed between two refs (`from..to`), repo-relative paths.
pub fn changed_files(repo: &Path, from_ref: &str, to_ref: &str) -> Result<Vec<String>> {
    let range = format!("{from_ref}..{to_ref}");
    let output = git_ok(repo, &["diff", "--name-only", &range])?;
    Ok(output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}

/// Files changed on a workspace's branch since it diverged from a base ref
/// (merge-base semantics, so integration commits merged after the branch
/// point are not misattributed to the task).
pub fn changed_files_from_base(workspace: &Path, base_ref: &str) -> Result<Vec<String>> {
    let range = format!("{base_ref}...HEAD");
    let output = git_ok(workspace, &["diff", "--name-only", &range])?;
    Ok(output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}

/// Create a linked working tree for a branch, creating the branch off
/// `base_branch` when missing.
pub fn create_worktree(repo: &Path, worktree_path: &Path, branch: &str, base_branch: &str) -> Result<()> {
    if let Some(parent) = worktree_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if !branch_exists(repo, branch)? {
        create_branch(repo, branch, base_branch)?;
    }
    git_ok(
        repo,
        &[
            "worktree",
            "add",
            worktree_path.to_string_lossy().as_ref(),
            branch,
        ],
    )
    .map(|_| ())
}

pub fn remove_worktree(repo: &Path, worktree_path: &Path) -> Result<()> {
    git_ok(
        repo,
        &[
            "worktree",
            "remove",
            "--force",
            worktree_path.to_string_lossy().as_ref(),
        ],
    )
    .map(|_| ())
}

/// Discard all local changes in a working tree: `reset --hard` + `clean -fdx`.
pub fn reset_and_clean(worktree: &Path, reference: &str) -> Result<()> {
    git_ok(worktree, &["reset", "--hard", reference])?;
    git_ok(worktree, &["clean", "-fdx"])?;
    Ok(())
}

fn is_conflict(stdout: &str, stderr: &str) -> bool {
    stdout.contains("CONFLICT")
        || stderr.contains("CONFLICT")
        || stdout.contains("Automatic merge failed")
        || stderr.contains("Automatic merge failed")
}

/// Trial-merge a group of task branches without publishing the result.
///
/// A throwaway probe branch is created off `main_branch` and each candidate
/// merged in turn. A conflicting candidate is reported per-branch (the merge
/// is aborted and probing continues with the remaining candidates) so the
/// scheduler can reschedule exactly the conflicting tasks. The probe branch
/// is always deleted before returning.
pub fn temp_merge_probe(
    repo: &Path,
    main_branch: &str,
    branches: &[String],
) -> Result<TempMergeOutcome> {
    let probe_branch = format!("mycelium/probe-{}", uuid::Uuid::now_v7());
    let previous = current_branch(repo)?;

    create_branch(repo, &probe_branch, main_branch)?;
    checkout(repo, &probe_branch)?;

    let mut conflicts = Vec::new();
    let mut merge_error = None;
    for branch in branches {
        let output = git(repo, &["merge", "--no-ff", "--no-edit", branch])?;
        if output.status.success() {
            continue;
        }
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if is_conflict(&stdout, &stderr) {
            let _ = git(repo, &["merge", "--abort"]);
            let message = if stdout.trim().is_empty() { stderr } else { stdout };
            warn!(branch = %branch, "temp-merge probe conflict");
            conflicts.push(MergeConflict {
                branch: branch.clone(),
                message: message.trim().to_string(),
            });
        } else {
            let _ = git(repo, &["merge", "--abort"]);
            merge_error = Some(VcsError::CommandFailed(format!(
                "git merge {branch}: {}",
                stderr.trim()
            )));
            break;
        }
    }

    let merge_commit = if conflicts.is_empty() && merge_error.is_none() {
        Some(rev_parse(repo, "HEAD")?)
    } else {
        None
    };

    // Restore the original checkout and drop the probe branch.
    let restore = if previous.is_empty() {
        main_branch
    } else {
        previous.as_str()
    };
    checkout(repo, restore)?;
    delete_branch(repo, &probe_branch)?;

    if let Some(err) = merge_error {
        return Err(err);
    }

    Ok(TempMergeOutcome {
        merged: conflicts.is_empty(),
        conflicts,
        merge_commit,
    })
}

/// Publish a clean batch: merge every branch into `main_branch` and return
/// the resulting HEAD sha. Callers must have probed the group first; an
/// unexpected conflict here aborts the merge and surfaces as an error.
pub fn final_merge(repo: &Path, main_branch: &str, branches: &[String]) -> Result<String> {
    let previous = current_branch(repo)?;
    checkout(repo, main_branch)?;

    for branch in branches {
        let output = git(repo, &["merge", "--no-ff", "--no-edit", branch])?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            let _ = git(repo, &["merge", "--abort"]);
            if !previous.is_empty() && previous != main_branch {
                let _ = checkout(repo, &previous);
            }
            return Err(VcsError::CommandFailed(format!(
                "final merge of {branch}: {}",
                stderr.trim()
            )));
        }
    }

    rev_parse(repo, "HEAD")
}

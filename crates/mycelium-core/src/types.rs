//! Core data model for the run engine.
//!
//! Run, task, and batch state documents, plus the cross-run ledger records.
//! Everything here is plain serde data; persistence lives in the engine crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Generate a new run id.
///
/// UUIDv7 so run ids sort by creation time in directory listings.
pub fn new_run_id() -> String {
    Uuid::now_v7().to_string()
}

/// Order task ids numerically when both parse as integers, else
/// lexicographically. Catalog ordering and batch formation both use this.
pub fn compare_task_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(na), Ok(nb)) => na.cmp(&nb).then_with(|| a.cmp(b)),
        _ => a.cmp(b),
    }
}

// --- Enumerations ---

/// Run lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Paused,
    Complete,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    /// Terminal states cannot transition further.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    /// Worker attempt succeeded; not yet merged.
    Validated,
    Complete,
    Failed,
    /// Satisfied from the ledger without executing.
    Skipped,
    /// Compliance asked for a scope expansion before the task may run.
    NeedsRescope,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Validated => "validated",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::NeedsRescope => "needs_rescope",
        }
    }
}

/// Batch lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Running,
    Complete,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

/// Directory bucket a task spec lives in.
///
/// `backlog` moves to `active` on first dispatch and to `archive/<run_id>`
/// once the task's batch integrates. `legacy` marks specs found in a flat
/// (unstaged) tasks directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStage {
    Backlog,
    Active,
    Archive,
    Legacy,
}

impl TaskStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backlog => "backlog",
            Self::Active => "active",
            Self::Archive => "archive",
            Self::Legacy => "legacy",
        }
    }
}

/// Outcome recorded for a task in the cross-run ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    Complete,
    Skipped,
    Blocked,
    Failed,
}

impl LedgerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Skipped => "skipped",
            Self::Blocked => "blocked",
            Self::Failed => "failed",
        }
    }
}

/// Where a ledger entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerSource {
    #[serde(rename = "executor")]
    Executor,
    #[serde(rename = "import-run")]
    ImportRun,
}

impl LedgerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Executor => "executor",
            Self::ImportRun => "import-run",
        }
    }
}

/// TDD enforcement mode declared by a task manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TddMode {
    #[default]
    Off,
    Strict,
}

impl TddMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Strict => "strict",
        }
    }
}

// --- State documents ---

/// A checkpoint commit recorded by the worker for one attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointCommit {
    /// Attempt number (1-indexed, strictly increasing across the list).
    pub attempt: u32,
    pub sha: String,
    pub created_at: DateTime<Utc>,
}

/// Token/cost usage aggregated for one attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AttemptUsage {
    pub input_tokens: u64,
    pub cached_input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub estimated_cost: f64,
}

impl AttemptUsage {
    pub fn add(&mut self, other: &AttemptUsage) {
        self.input_tokens += other.input_tokens;
        self.cached_input_tokens += other.cached_input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
        self.estimated_cost += other.estimated_cost;
    }
}

/// Per-task state slot inside a run state document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskState {
    pub status: TaskStatus,
    pub attempts: u32,
    /// Task branch name, set once the task is admitted to a batch.
    pub branch: Option<String>,
    /// Absolute workspace path, set while the task is live.
    pub workspace: Option<String>,
    /// Absolute path to the task's event-log directory.
    pub logs_dir: Option<String>,
    /// Container id, recorded before the container runs so resume can find it.
    pub container_id: Option<String>,
    /// Worker continuation handle for resumable attempts.
    pub thread_id: Option<String>,
    /// Strictly monotonic in `attempt`.
    pub checkpoint_commits: Vec<CheckpointCommit>,
    pub usage_by_attempt: BTreeMap<u32, AttemptUsage>,
    pub tokens_used: u64,
    pub estimated_cost: f64,
    /// Batch the task last ran in.
    pub batch_id: Option<u64>,
}

/// One scheduled batch of lock-disjoint tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchState {
    pub batch_id: u64,
    pub status: BatchStatus,
    /// Admission order within the batch.
    pub task_ids: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub merge_commit: Option<String>,
    pub integration_doctor_passed: Option<bool>,
}

/// Code-graph baseline recorded for a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneState {
    /// Integration HEAD at run start. Frozen on stop so a resumed run sees
    /// the same baseline even if `main_branch` moved meanwhile.
    pub base_sha: Option<String>,
}

/// Durable per-run state document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub project: String,
    pub repo_path: String,
    pub main_branch: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: RunStatus,
    pub tasks: BTreeMap<String, TaskState>,
    pub batches: Vec<BatchState>,
    pub tokens_used: u64,
    pub estimated_cost: f64,
    #[serde(default)]
    pub control_plane: ControlPlaneState,
    /// Why a terminal/paused status was reached (e.g. `budget_block`, `signal`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
}

impl RunState {
    pub fn new(run_id: String, project: String, repo_path: String, main_branch: String) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            project,
            repo_path,
            main_branch,
            started_at: now,
            updated_at: now,
            status: RunStatus::Running,
            tasks: BTreeMap::new(),
            batches: Vec::new(),
            tokens_used: 0,
            estimated_cost: 0.0,
            control_plane: ControlPlaneState::default(),
            stop_reason: None,
        }
    }

    /// Next batch id (monotonic, 1-indexed).
    pub fn next_batch_id(&self) -> u64 {
        self.batches.last().map_or(1, |b| b.batch_id + 1)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

// --- Ledger ---

/// One completed-task record in the cross-run ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub task_id: String,
    pub status: LedgerStatus,
    /// Content address of the task: canonical manifest + normalized spec.
    pub fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integration_doctor_passed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub source: LedgerSource,
}

/// Per-project ledger document. One JSON file, written atomically.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Ledger {
    pub entries: BTreeMap<String, LedgerEntry>,
}

impl Ledger {
    /// Entry for a task only if it completed with a matching fingerprint.
    pub fn satisfied_entry(&self, task_id: &str, fingerprint: &str) -> Option<&LedgerEntry> {
        self.entries.get(task_id).filter(|e| {
            e.status == LedgerStatus::Complete && e.fingerprint == fingerprint
        })
    }
}

/// Summary row in the per-project run history index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunHistoryEntry {
    pub run_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub task_count: usize,
    pub tokens_used: u64,
    pub estimated_cost: f64,
}

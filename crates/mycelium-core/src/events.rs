//! Event model for the JSONL logs.
//!
//! Every event line carries `ts` (RFC3339), `type` (dotted), `run_id`, and
//! optionally `task_id`, `batch_id`, and a free-form `payload`. Events are
//! append-only, one JSON document per line, UTF-8, LF-terminated. Readers
//! must rely on order of appearance in the file, not on timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Well-known event type names.
///
/// The wire format is an open set (worker-forwarded events arrive with their
/// own types), so these are constants rather than a closed enum.
pub mod event_types {
    pub const RUN_START: &str = "run.start";
    pub const RUN_STOP: &str = "run.stop";
    pub const RUN_RESUME: &str = "run.resume";
    pub const RUN_BLOCKED: &str = "run.blocked";
    pub const RUN_COMPLETE: &str = "run.complete";
    pub const RUN_FAILED: &str = "run.failed";

    pub const BATCH_START: &str = "batch.start";
    pub const BATCH_COMPLETE: &str = "batch.complete";
    pub const BATCH_FAILED: &str = "batch.failed";

    pub const TASK_START: &str = "task.start";
    pub const TASK_RESET: &str = "task.reset";
    pub const TASK_COMPLETE: &str = "task.complete";
    pub const TASK_FAILED: &str = "task.failed";
    pub const TASK_STAGE_MOVE: &str = "task.stage.move";

    pub const WORKSPACE_PREPARE_START: &str = "workspace.prepare.start";
    pub const WORKSPACE_PREPARE_COMPLETE: &str = "workspace.prepare.complete";
    pub const WORKSPACE_PREPARE_RECOVERED: &str = "workspace.prepare.recovered";

    pub const CONTAINER_CREATE: &str = "container.create";
    pub const CONTAINER_START: &str = "container.start";
    pub const CONTAINER_EXIT: &str = "container.exit";
    pub const CONTAINER_REATTACH: &str = "container.reattach";
    pub const CONTAINER_EXITED_ON_RESUME: &str = "container.exited-on-resume";
    pub const CONTAINER_STOP: &str = "container.stop";
    pub const CONTAINER_STOP_FAILED: &str = "container.stop_failed";
    pub const CONTAINER_MISSING: &str = "container.missing";
    pub const CONTAINER_CLEANUP: &str = "container.cleanup";

    pub const WORKER_LOCAL_START: &str = "worker.local.start";
    pub const WORKER_LOCAL_COMPLETE: &str = "worker.local.complete";
    pub const WORKER_LOCAL_ERROR: &str = "worker.local.error";

    pub const DOCTOR_PASS: &str = "doctor.pass";
    pub const DOCTOR_FAIL: &str = "doctor.fail";

    pub const VALIDATOR_START: &str = "validator.start";
    pub const VALIDATOR_PASS: &str = "validator.pass";
    pub const VALIDATOR_FAIL: &str = "validator.fail";
    pub const VALIDATOR_SKIP: &str = "validator.skip";
    pub const VALIDATOR_ERROR: &str = "validator.error";

    pub const BUDGET_WARN: &str = "budget.warn";
    pub const BUDGET_BLOCK: &str = "budget.block";

    pub const DEPS_EXTERNAL_SATISFIED: &str = "deps.external_satisfied";
    pub const LEDGER_IMPORT: &str = "ledger.import";
    pub const LEDGER_REUSE: &str = "ledger.reuse";
}

/// One event line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub ts: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl EventRecord {
    pub fn new(event_type: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            ts: Utc::now(),
            event_type: event_type.into(),
            run_id: run_id.into(),
            task_id: None,
            batch_id: None,
            payload: None,
        }
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_batch(mut self, batch_id: u64) -> Self {
        self.batch_id = Some(batch_id);
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Serialize to one log line (no trailing newline).
    pub fn to_json_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

// --- Typed payloads for structured events ---

/// A blocked task and the dependencies it is missing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedTask {
    pub task_id: String,
    pub missing_deps: Vec<String>,
}

/// Payload for `run.blocked`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunBlockedPayload {
    pub reason: String,
    pub blocked_tasks: Vec<BlockedTask>,
}

/// Payload for `run.stop`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStopPayload {
    pub reason: String,
    /// `left_running` or `stopped`.
    pub containers: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub containers_stopped: Option<usize>,
}

/// Payload for `run.resume`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResumePayload {
    pub status: String,
    pub reason: String,
    pub reset_tasks: Vec<String>,
    pub running_tasks: Vec<String>,
}

/// Payload for `batch.start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchStartPayload {
    pub batch_id: u64,
    pub tasks: Vec<String>,
    /// Union of effective write locks held by the batch.
    pub locks: Vec<String>,
}

/// One satisfied external dependency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SatisfiedDep {
    pub dep_id: String,
    pub fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

/// Payload for `deps.external_satisfied`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepsExternalSatisfiedPayload {
    pub task_id: String,
    pub deps: Vec<SatisfiedDep>,
}

/// Payload for `task.reset`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResetPayload {
    pub task_id: String,
    pub reason: String,
    pub attempt: u32,
}

/// Payload for `budget.warn` / `budget.block`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetBreachPayload {
    /// `task_tokens` or `run_cost`.
    pub limit: String,
    pub used: f64,
    pub max: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

/// Payload for `task.stage.move`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageMovePayload {
    pub task_id: String,
    pub from: String,
    pub to: String,
}

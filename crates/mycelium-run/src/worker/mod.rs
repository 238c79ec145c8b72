//! Worker runner interface.
//!
//! The engine talks to workers through one capability set with two
//! implementations: an in-process (subprocess) runner and a container-backed
//! runner. Tests swap in a scripted fake; nothing else in the engine knows
//! which variant is running.

pub mod container;
pub mod local;

use crate::state::EventLog;
use async_trait::async_trait;
use mycelium_core::EventRecord;
use serde_json::{json, Value};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("event log error: {0}")]
    Log(#[from] crate::state::StateError),
    #[error("container engine error: {0}")]
    Container(String),
    #[error("worker command failed to spawn: {0}")]
    Spawn(String),
    #[error("bootstrap command error: {0}")]
    Bootstrap(String),
}

pub type Result<T> = std::result::Result<T, WorkerError>;

/// Environment variables forwarded into workers when present.
pub const PASSTHROUGH_ENV: &[&str] = &[
    "ANTHROPIC_API_KEY",
    "OPENAI_API_KEY",
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "NO_PROXY",
];

/// Everything a runner needs to execute one task attempt.
#[derive(Debug, Clone)]
pub struct AttemptRequest {
    pub task_id: String,
    pub slug: String,
    pub task_branch: String,
    pub workspace_path: PathBuf,
    pub manifest_path: PathBuf,
    pub spec_path: PathBuf,
    pub doctor_cmd: String,
    pub doctor_timeout: u64,
    pub lint_cmd: Option<String>,
    pub lint_timeout: u64,
    pub fast_cmd: Option<String>,
    /// `0` means unlimited attempts.
    pub max_retries: u32,
    pub bootstrap_cmds: Vec<String>,
    pub checkpoint_commits: bool,
    pub default_test_paths: Vec<String>,
    pub logs_dir: PathBuf,
    pub model: String,
    pub reasoning_effort: Option<String>,
}

/// Inputs for reattaching to a live attempt.
#[derive(Debug, Clone)]
pub struct ResumeRequest {
    pub task_id: String,
    pub slug: String,
    pub task_branch: String,
    pub workspace_path: PathBuf,
    /// Container id recorded in state before the attempt started.
    pub container_id_hint: Option<String>,
}

/// Outcome of an attempt (fresh or resumed).
#[derive(Debug, Clone, Default)]
pub struct AttemptOutcome {
    pub success: bool,
    pub error_message: Option<String>,
    /// The attempt could not run or reattach; the task should go back to
    /// `pending` and be rescheduled.
    pub reset_to_pending: bool,
    pub container_id: Option<String>,
}

/// Result of stopping a run's workers.
#[derive(Debug, Clone, Default)]
pub struct StopOutcome {
    pub stopped: usize,
    pub errors: Vec<String>,
}

/// Fired as soon as a container id is known, before the container runs, so
/// the coordinator can persist it durably first.
pub type ContainerReadyFn = dyn Fn(&str) + Send + Sync;

/// One capability set, two implementations.
#[async_trait]
pub trait WorkerRunner: Send + Sync {
    /// One-time preparation (image builds, binary checks). Idempotent.
    async fn prepare(&self) -> Result<()>;

    async fn run_attempt(
        &self,
        request: &AttemptRequest,
        log: &EventLog,
        on_container_ready: Option<&ContainerReadyFn>,
    ) -> Result<AttemptOutcome>;

    /// Reattach to an attempt left running by a previous process.
    async fn resume_attempt(&self, request: &ResumeRequest, log: &EventLog)
        -> Result<AttemptOutcome>;

    /// Stop all of this run's live workers.
    async fn stop(&self, log: &EventLog) -> Result<StopOutcome>;

    /// Release per-task worker resources.
    async fn cleanup_task(&self, task_id: &str, container_id: Option<&str>, log: &EventLog)
        -> Result<()>;
}

/// Build the worker environment for an attempt. Shared by both runners so
/// the contract stays identical regardless of isolation.
pub fn build_worker_env(request: &AttemptRequest) -> Vec<(String, String)> {
    let mut env = vec![
        ("TASK_ID".to_string(), request.task_id.clone()),
        ("TASK_SLUG".to_string(), request.slug.clone()),
        (
            "TASK_MANIFEST_PATH".to_string(),
            request.manifest_path.to_string_lossy().to_string(),
        ),
        (
            "TASK_SPEC_PATH".to_string(),
            request.spec_path.to_string_lossy().to_string(),
        ),
        ("TASK_BRANCH".to_string(), request.task_branch.clone()),
        ("DOCTOR_CMD".to_string(), request.doctor_cmd.clone()),
        (
            "DOCTOR_TIMEOUT".to_string(),
            request.doctor_timeout.to_string(),
        ),
        ("MAX_RETRIES".to_string(), request.max_retries.to_string()),
        (
            "CHECKPOINT_COMMITS".to_string(),
            request.checkpoint_commits.to_string(),
        ),
        (
            "DEFAULT_TEST_PATHS".to_string(),
            serde_json::to_string(&request.default_test_paths).unwrap_or_else(|_| "[]".into()),
        ),
        (
            "RUN_LOGS_DIR".to_string(),
            request.logs_dir.to_string_lossy().to_string(),
        ),
        ("WORKER_MODEL".to_string(), request.model.clone()),
    ];
    if let Some(effort) = &request.reasoning_effort {
        env.push(("REASONING_EFFORT".to_string(), effort.clone()));
    }
    if let Some(lint) = &request.lint_cmd {
        env.push(("LINT_CMD".to_string(), lint.clone()));
        env.push(("LINT_TIMEOUT".to_string(), request.lint_timeout.to_string()));
    }
    if let Some(fast) = &request.fast_cmd {
        env.push(("FAST_CMD".to_string(), fast.clone()));
    }
    if !request.bootstrap_cmds.is_empty() {
        env.push((
            "BOOTSTRAP_CMDS".to_string(),
            serde_json::to_string(&request.bootstrap_cmds).unwrap_or_else(|_| "[]".into()),
        ));
    }
    for key in PASSTHROUGH_ENV {
        if let Ok(value) = std::env::var(key) {
            env.push(((*key).to_string(), value));
        }
    }
    env
}

/// Turn one line of worker stdout/stderr into an event.
///
/// Workers emit JSONL; a line that parses as an object with a `type` field
/// is forwarded as that event, anything else is wrapped into a fallback
/// `worker.output` event so no output is ever lost.
pub fn worker_line_event(line: &str, run_id: &str, task_id: &str) -> EventRecord {
    if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(line) {
        if let Some(event_type) = obj.get("type").and_then(Value::as_str) {
            return EventRecord::new(event_type, run_id)
                .with_task(task_id)
                .with_payload(Value::Object(obj.clone()));
        }
    }
    EventRecord::new("worker.output", run_id)
        .with_task(task_id)
        .with_payload(json!({ "line": line }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> AttemptRequest {
        AttemptRequest {
            task_id: "001".into(),
            slug: "alpha".into(),
            task_branch: "agent/001-alpha".into(),
            workspace_path: PathBuf::from("/ws"),
            manifest_path: PathBuf::from("/tasks/001-alpha/manifest.json"),
            spec_path: PathBuf::from("/tasks/001-alpha/spec.md"),
            doctor_cmd: "cargo test".into(),
            doctor_timeout: 1800,
            lint_cmd: Some("cargo clippy".into()),
            lint_timeout: 600,
            fast_cmd: None,
            max_retries: 3,
            bootstrap_cmds: vec!["npm ci".into()],
            checkpoint_commits: true,
            default_test_paths: vec!["tests/".into()],
            logs_dir: PathBuf::from("/logs/run-1/tasks/001-alpha"),
            model: "opus".into(),
            reasoning_effort: Some("high".into()),
        }
    }

    #[test]
    fn env_carries_all_task_parameters() {
        let env = build_worker_env(&sample_request());
        let get = |key: &str| {
            env.iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        };

        assert_eq!(get("TASK_ID"), Some("001"));
        assert_eq!(get("TASK_SLUG"), Some("alpha"));
        assert_eq!(get("TASK_BRANCH"), Some("agent/001-alpha"));
        assert_eq!(get("DOCTOR_CMD"), Some("cargo test"));
        assert_eq!(get("DOCTOR_TIMEOUT"), Some("1800"));
        assert_eq!(get("LINT_CMD"), Some("cargo clippy"));
        assert_eq!(get("LINT_TIMEOUT"), Some("600"));
        assert_eq!(get("MAX_RETRIES"), Some("3"));
        assert_eq!(get("CHECKPOINT_COMMITS"), Some("true"));
        assert_eq!(get("DEFAULT_TEST_PATHS"), Some(r#"["tests/"]"#));
        assert_eq!(get("BOOTSTRAP_CMDS"), Some(r#"["npm ci"]"#));
        assert_eq!(get("RUN_LOGS_DIR"), Some("/logs/run-1/tasks/001-alpha"));
        assert_eq!(get("WORKER_MODEL"), Some("opus"));
        assert_eq!(get("REASONING_EFFORT"), Some("high"));
    }

    #[test]
    fn env_omits_absent_optional_commands() {
        let mut request = sample_request();
        request.lint_cmd = None;
        request.bootstrap_cmds.clear();
        let env = build_worker_env(&request);
        assert!(!env.iter().any(|(k, _)| k == "LINT_CMD"));
        assert!(!env.iter().any(|(k, _)| k == "BOOTSTRAP_CMDS"));
    }

    #[test]
    fn worker_jsonl_lines_are_forwarded_with_their_type() {
        let line = r#"{"type":"turn.completed","usage":{"input_tokens":10}}"#;
        let event = worker_line_event(line, "run-1", "001");
        assert_eq!(event.event_type, "turn.completed");
        assert_eq!(event.task_id.as_deref(), Some("001"));
        assert_eq!(event.payload.unwrap()["usage"]["input_tokens"], 10);
    }

    #[test]
    fn unparseable_lines_are_wrapped_into_fallback_events() {
        let event = worker_line_event("plain text progress", "run-1", "001");
        assert_eq!(event.event_type, "worker.output");
        assert_eq!(event.payload.unwrap()["line"], "plain text progress");

        // JSON without a type field also falls back.
        let event = worker_line_event(r#"{"usage":1}"#, "run-1", "001");
        assert_eq!(event.event_type, "worker.output");
    }
}

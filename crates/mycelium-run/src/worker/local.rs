//! In-process worker runner.
//!
//! Runs the worker loop as a direct child process with the same environment
//! contract as the container runner. Local workers cannot be reattached
//! across orchestrator restarts, so `resume_attempt` always resets the task
//! back to pending.

use super::{
    build_worker_env, worker_line_event, AttemptOutcome, AttemptRequest, ContainerReadyFn,
    ResumeRequest, StopOutcome, WorkerError, WorkerRunner,
};
use crate::state::EventLog;
use async_trait::async_trait;
use mycelium_core::events::event_types;
use mycelium_core::EventRecord;
use serde_json::json;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

/// Worker runner that spawns the worker loop as a subprocess.
#[derive(Debug)]
pub struct LocalWorkerRunner {
    run_id: String,
    /// Command executed through `sh -c` for every attempt.
    worker_cmd: String,
}

impl LocalWorkerRunner {
    pub fn new(run_id: impl Into<String>, worker_cmd: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            worker_cmd: worker_cmd.into(),
        }
    }
}

#[async_trait]
impl WorkerRunner for LocalWorkerRunner {
    async fn prepare(&self) -> super::Result<()> {
        Ok(())
    }

    async fn run_attempt(
        &self,
        request: &AttemptRequest,
        log: &EventLog,
        _on_container_ready: Option<&ContainerReadyFn>,
    ) -> super::Result<AttemptOutcome> {
        log.append(
            &EventRecord::new(event_types::WORKER_LOCAL_START, &self.run_id)
                .with_task(&request.task_id)
                .with_payload(json!({ "cmd": self.worker_cmd })),
        )?;

        // Bootstrap commands run before the attempt body; a failure is a
        // normal attempt failure.
        for cmd in &request.bootstrap_cmds {
            let result = crate::doctor::run_command(cmd, &request.workspace_path, 0)
                .await
                .map_err(|err| WorkerError::Bootstrap(err.to_string()))?;
            if !result.passed {
                warn!(task_id = %request.task_id, cmd, exit_code = result.exit_code, "bootstrap command failed");
                log.append(
                    &EventRecord::new(event_types::WORKER_LOCAL_ERROR, &self.run_id)
                        .with_task(&request.task_id)
                        .with_payload(json!({
                            "bootstrap": cmd,
                            "exit_code": result.exit_code,
                        })),
                )?;
                return Ok(AttemptOutcome {
                    success: false,
                    error_message: Some(format!("bootstrap command failed: {cmd}")),
                    ..AttemptOutcome::default()
                });
            }
        }

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&self.worker_cmd)
            .current_dir(&request.workspace_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // A cancelled attempt future must soft-kill the worker.
            .kill_on_drop(true);
        for (key, value) in build_worker_env(request) {
            command.env(key, value);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                let message = format!("failed to spawn worker: {err}");
                log.append(
                    &EventRecord::new(event_types::WORKER_LOCAL_ERROR, &self.run_id)
                        .with_task(&request.task_id)
                        .with_payload(json!({ "error": message })),
                )?;
                return Err(WorkerError::Spawn(message));
            }
        };

        // Stream both pipes into the task event log as they arrive.
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut readers = Vec::new();
        if let Some(stdout) = stdout {
            readers.push(tokio::spawn(read_lines(stdout)));
        }
        if let Some(stderr) = stderr {
            readers.push(tokio::spawn(read_lines(stderr)));
        }

        let status = child.wait().await?;
        for reader in readers {
            if let Ok(lines) = reader.await {
                for line in lines {
                    log.append(&worker_line_event(&line, &self.run_id, &request.task_id))?;
                }
            }
        }

        let exit_code = status.code().unwrap_or(-1);
        if exit_code == 0 {
            info!(task_id = %request.task_id, "local worker attempt complete");
            log.append(
                &EventRecord::new(event_types::WORKER_LOCAL_COMPLETE, &self.run_id)
                    .with_task(&request.task_id)
                    .with_payload(json!({ "exit_code": exit_code })),
            )?;
            Ok(AttemptOutcome {
                success: true,
                ..AttemptOutcome::default()
            })
        } else {
            warn!(task_id = %request.task_id, exit_code, "local worker attempt failed");
            log.append(
                &EventRecord::new(event_types::WORKER_LOCAL_ERROR, &self.run_id)
                    .with_task(&request.task_id)
                    .with_payload(json!({ "exit_code": exit_code })),
            )?;
            Ok(AttemptOutcome {
                success: false,
                error_message: Some(format!("worker exited with code {exit_code}")),
                ..AttemptOutcome::default()
            })
        }
    }

    async fn resume_attempt(
        &self,
        request: &ResumeRequest,
        log: &EventLog,
    ) -> super::Result<AttemptOutcome> {
        // A local worker dies with the orchestrator process; there is
        // nothing to reattach to.
        log.append(
            &EventRecord::new(event_types::WORKER_LOCAL_ERROR, &self.run_id)
                .with_task(&request.task_id)
                .with_payload(json!({ "error": "local worker cannot be resumed" })),
        )?;
        Ok(AttemptOutcome {
            success: false,
            reset_to_pending: true,
            ..AttemptOutcome::default()
        })
    }

    async fn stop(&self, _log: &EventLog) -> super::Result<StopOutcome> {
        // Child processes are reaped when their attempt future is dropped.
        Ok(StopOutcome::default())
    }

    async fn cleanup_task(
        &self,
        _task_id: &str,
        _container_id: Option<&str>,
        _log: &EventLog,
    ) -> super::Result<()> {
        Ok(())
    }
}

async fn read_lines<R>(reader: R) -> Vec<String>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = Vec::new();
    let mut buf = BufReader::new(reader).lines();
    while let Ok(Some(line)) = buf.next_line().await {
        lines.push(line);
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::read_jsonl_from_cursor;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn request(workspace: PathBuf, logs_dir: PathBuf) -> AttemptRequest {
        AttemptRequest {
            task_id: "001".into(),
            slug: "alpha".into(),
            task_branch: "agent/001-alpha".into(),
            workspace_path: workspace,
            manifest_path: PathBuf::from("manifest.json"),
            spec_path: PathBuf::from("spec.md"),
            doctor_cmd: "true".into(),
            doctor_timeout: 60,
            lint_cmd: None,
            lint_timeout: 0,
            fast_cmd: None,
            max_retries: 1,
            bootstrap_cmds: Vec::new(),
            checkpoint_commits: false,
            default_test_paths: Vec::new(),
            logs_dir,
            model: "sonnet".into(),
            reasoning_effort: None,
        }
    }

    fn setup() -> (TempDir, EventLog) {
        let dir = TempDir::new().unwrap();
        let log = EventLog::new(dir.path().join("events.jsonl"));
        (dir, log)
    }

    #[tokio::test]
    async fn successful_attempt_emits_start_and_complete() {
        let (dir, log) = setup();
        let runner = LocalWorkerRunner::new("run-1", "echo '{\"type\":\"turn.completed\"}'");
        let outcome = runner
            .run_attempt(
                &request(dir.path().to_path_buf(), dir.path().to_path_buf()),
                &log,
                None,
            )
            .await
            .unwrap();

        assert!(outcome.success);
        assert!(!outcome.reset_to_pending);
        assert!(outcome.container_id.is_none());

        let page = read_jsonl_from_cursor(log.path(), 0, None, None).unwrap();
        let types: Vec<&str> = page.events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(
            types,
            vec!["worker.local.start", "turn.completed", "worker.local.complete"]
        );
    }

    #[tokio::test]
    async fn failing_attempt_reports_exit_code() {
        let (dir, log) = setup();
        let runner = LocalWorkerRunner::new("run-1", "exit 7");
        let outcome = runner
            .run_attempt(
                &request(dir.path().to_path_buf(), dir.path().to_path_buf()),
                &log,
                None,
            )
            .await
            .unwrap();

        assert!(!outcome.success);
        assert!(outcome
            .error_message
            .as_deref()
            .unwrap()
            .contains("code 7"));

        let page = read_jsonl_from_cursor(log.path(), 0, None, Some("worker.local.*")).unwrap();
        assert_eq!(page.events.last().unwrap().event_type, "worker.local.error");
    }

    #[tokio::test]
    async fn worker_env_reaches_the_subprocess() {
        let (dir, log) = setup();
        let runner = LocalWorkerRunner::new("run-1", "echo \"id=$TASK_ID branch=$TASK_BRANCH\"");
        runner
            .run_attempt(
                &request(dir.path().to_path_buf(), dir.path().to_path_buf()),
                &log,
                None,
            )
            .await
            .unwrap();

        let page = read_jsonl_from_cursor(log.path(), 0, None, Some("worker.output")).unwrap();
        let line = page.events[0].payload.as_ref().unwrap()["line"]
            .as_str()
            .unwrap()
            .to_string();
        assert_eq!(line, "id=001 branch=agent/001-alpha");
    }

    #[tokio::test]
    async fn bootstrap_failure_fails_the_attempt_before_the_worker_runs() {
        let (dir, log) = setup();
        let marker = dir.path().join("worker-ran");
        let runner = LocalWorkerRunner::new("run-1", format!("touch {}", marker.display()));
        let mut req = request(dir.path().to_path_buf(), dir.path().to_path_buf());
        req.bootstrap_cmds = vec!["true".into(), "exit 9".into()];

        let outcome = runner.run_attempt(&req, &log, None).await.unwrap();
        assert!(!outcome.success);
        assert!(outcome
            .error_message
            .as_deref()
            .unwrap()
            .contains("bootstrap"));
        // The worker body never ran.
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn bootstrap_commands_run_before_the_worker() {
        let (dir, log) = setup();
        let runner = LocalWorkerRunner::new("run-1", "cat seeded.txt");
        let mut req = request(dir.path().to_path_buf(), dir.path().to_path_buf());
        req.bootstrap_cmds = vec!["echo seeded > seeded.txt".into()];

        let outcome = runner.run_attempt(&req, &log, None).await.unwrap();
        assert!(outcome.success);
    }

    #[tokio::test]
    async fn resume_always_resets_to_pending() {
        let (dir, log) = setup();
        let runner = LocalWorkerRunner::new("run-1", "true");
        let outcome = runner
            .resume_attempt(
                &ResumeRequest {
                    task_id: "001".into(),
                    slug: "alpha".into(),
                    task_branch: "agent/001-alpha".into(),
                    workspace_path: dir.path().to_path_buf(),
                    container_id_hint: None,
                },
                &log,
            )
            .await
            .unwrap();

        assert!(!outcome.success);
        assert!(outcome.reset_to_pending);
    }
}

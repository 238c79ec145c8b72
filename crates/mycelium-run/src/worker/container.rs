//! Container-backed worker runner.
//!
//! The engine is referenced through the `ContainerEngine` trait; `DockerCli`
//! shells out to the `docker` binary, and tests substitute an in-memory
//! fake. Container stdout/stderr is streamed as JSONL into the task event
//! log; the container id is surfaced through a ready callback before the
//! container starts so state can record it durably first.

use super::{
    build_worker_env, worker_line_event, AttemptOutcome, AttemptRequest, ContainerReadyFn,
    ResumeRequest, StopOutcome, WorkerError, WorkerRunner,
};
use crate::state::EventLog;
use async_trait::async_trait;
use mycelium_core::config::DockerConfig;
use mycelium_core::events::event_types;
use mycelium_core::EventRecord;
use serde_json::json;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Label namespace applied to every container this engine creates.
pub const LABEL_PREFIX: &str = "io.mycelium";

/// Mount points inside the worker container.
pub const WORKSPACE_MOUNT: &str = "/workspace";
pub const LOGS_MOUNT: &str = "/var/log/mycelium";
pub const TASK_MOUNT: &str = "/task";

/// Docker restricts container names; we also keep them short enough to read.
const MAX_CONTAINER_NAME: usize = 63;

/// Everything needed to create one worker container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub labels: Vec<(String, String)>,
    pub env: Vec<(String, String)>,
    /// (host path, container path, writable)
    pub binds: Vec<(PathBuf, PathBuf, bool)>,
    pub workdir: Option<String>,
    pub user: Option<String>,
    pub network_mode: Option<String>,
    pub memory_mb: Option<u64>,
    pub cpu_quota: Option<u64>,
    pub pids_limit: Option<u64>,
}

/// Observed container state.
#[derive(Debug, Clone, Copy)]
pub struct ContainerStatus {
    pub running: bool,
    pub exit_code: Option<i64>,
}

/// Abstract container engine. One method set, shared by the docker CLI
/// implementation and the test fake.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn create(&self, spec: &ContainerSpec) -> super::Result<String>;
    async fn start(&self, id: &str) -> super::Result<()>;
    /// Follow logs until the container exits, feeding each line to `sink`.
    /// `include_history` replays output from the beginning. Returns the
    /// exit code.
    async fn follow(
        &self,
        id: &str,
        include_history: bool,
        sink: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> super::Result<i64>;
    /// Status by id or id prefix; `None` when no such container exists.
    async fn status(&self, id_or_prefix: &str) -> super::Result<Option<ContainerStatus>>;
    async fn find_by_labels(&self, labels: &[(String, String)]) -> super::Result<Vec<String>>;
    async fn find_by_name(&self, name: &str) -> super::Result<Option<String>>;
    async fn stop_and_remove(&self, id: &str) -> super::Result<()>;
    async fn remove(&self, id: &str) -> super::Result<()>;
}

/// Deterministic, sanitized, length-bounded container name.
pub fn container_name(project: &str, run_id: &str, task_id: &str, slug: &str) -> String {
    let run_short: String = run_id.chars().filter(|c| *c != '-').take(8).collect();
    let raw = format!("mycelium-{project}-{run_short}-{task_id}-{slug}");
    let mut name: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    while name.starts_with(|c: char| !c.is_ascii_alphanumeric()) {
        name.remove(0);
    }
    if name.len() > MAX_CONTAINER_NAME {
        name.truncate(MAX_CONTAINER_NAME);
    }
    while name.ends_with('-') || name.ends_with('.') {
        name.pop();
    }
    name
}

/// Container engine backed by the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    bin: String,
}

impl DockerCli {
    pub fn new() -> Self {
        Self {
            bin: "docker".to_string(),
        }
    }

    pub fn with_binary(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    async fn run(&self, args: &[String]) -> super::Result<String> {
        debug!(bin = %self.bin, ?args, "container engine");
        let output = Command::new(&self.bin)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;
        if !output.status.success() {
            return Err(WorkerError::Container(format!(
                "{} {}: {}",
                self.bin,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerEngine for DockerCli {
    async fn create(&self, spec: &ContainerSpec) -> super::Result<String> {
        let mut args = vec!["create".to_string(), "--name".to_string(), spec.name.clone()];
        for (key, value) in &spec.labels {
            args.push("--label".to_string());
            args.push(format!("{key}={value}"));
        }
        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        for (host, container, writable) in &spec.binds {
            let mode = if *writable { "rw" } else { "ro" };
            args.push("-v".to_string());
            args.push(format!(
                "{}:{}:{mode}",
                host.to_string_lossy(),
                container.to_string_lossy()
            ));
        }
        if let Some(workdir) = &spec.workdir {
            args.push("-w".to_string());
            args.push(workdir.clone());
        }
        if let Some(user) = &spec.user {
            args.push("--user".to_string());
            args.push(user.clone());
        }
        if let Some(network) = &spec.network_mode {
            args.push("--network".to_string());
            args.push(network.clone());
        }
        if let Some(memory_mb) = spec.memory_mb {
            args.push("--memory".to_string());
            args.push(format!("{memory_mb}m"));
        }
        if let Some(cpu_quota) = spec.cpu_quota {
            args.push("--cpu-quota".to_string());
            args.push(cpu_quota.to_string());
        }
        if let Some(pids) = spec.pids_limit {
            args.push("--pids-limit".to_string());
            args.push(pids.to_string());
        }
        args.push(spec.image.clone());
        self.run(&args).await
    }

    async fn start(&self, id: &str) -> super::Result<()> {
        self.run(&["start".to_string(), id.to_string()]).await?;
        Ok(())
    }

    async fn follow(
        &self,
        id: &str,
        include_history: bool,
        sink: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> super::Result<i64> {
        let mut args = vec!["logs".to_string(), "--follow".to_string()];
        if !include_history {
            args.push("--tail".to_string());
            args.push("0".to_string());
        }
        args.push(id.to_string());

        let mut child = Command::new(&self.bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                sink(&line);
            }
        }
        if let Some(stderr) = child.stderr.take() {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                sink(&line);
            }
        }
        let _ = child.wait().await;

        let code = self.run(&["wait".to_string(), id.to_string()]).await?;
        code.trim()
            .parse::<i64>()
            .map_err(|_| WorkerError::Container(format!("unparseable wait output: {code}")))
    }

    async fn status(&self, id_or_prefix: &str) -> super::Result<Option<ContainerStatus>> {
        let result = self
            .run(&[
                "inspect".to_string(),
                "-f".to_string(),
                "{{.State.Running}},{{.State.ExitCode}}".to_string(),
                id_or_prefix.to_string(),
            ])
            .await;
        match result {
            Ok(output) => {
                let (running, exit_code) = output.split_once(',').unwrap_or((&output, ""));
                Ok(Some(ContainerStatus {
                    running: running.trim() == "true",
                    exit_code: exit_code.trim().parse().ok(),
                }))
            }
            Err(_) => Ok(None),
        }
    }

    async fn find_by_labels(&self, labels: &[(String, String)]) -> super::Result<Vec<String>> {
        let mut args = vec!["ps".to_string(), "-aq".to_string()];
        for (key, value) in labels {
            args.push("--filter".to_string());
            args.push(format!("label={key}={value}"));
        }
        let output = self.run(&args).await?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    async fn find_by_name(&self, name: &str) -> super::Result<Option<String>> {
        let output = self
            .run(&[
                "ps".to_string(),
                "-a".to_string(),
                "--filter".to_string(),
                format!("name={name}"),
                "--format".to_string(),
                "{{.ID}} {{.Names}}".to_string(),
            ])
            .await?;
        for line in output.lines() {
            if let Some((id, candidate)) = line.trim().split_once(' ') {
                if candidate == name {
                    return Ok(Some(id.to_string()));
                }
            }
        }
        Ok(None)
    }

    async fn stop_and_remove(&self, id: &str) -> super::Result<()> {
        let _ = self.run(&["stop".to_string(), id.to_string()]).await;
        self.run(&["rm".to_string(), "-f".to_string(), id.to_string()])
            .await?;
        Ok(())
    }

    async fn remove(&self, id: &str) -> super::Result<()> {
        self.run(&["rm".to_string(), "-f".to_string(), id.to_string()])
            .await?;
        Ok(())
    }
}

/// Worker runner that executes each attempt inside a container.
pub struct ContainerWorkerRunner {
    engine: Arc<dyn ContainerEngine>,
    project: String,
    run_id: String,
    docker: DockerConfig,
}

impl ContainerWorkerRunner {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        project: impl Into<String>,
        run_id: impl Into<String>,
        docker: DockerConfig,
    ) -> Self {
        Self {
            engine,
            project: project.into(),
            run_id: run_id.into(),
            docker,
        }
    }

    fn run_labels(&self) -> Vec<(String, String)> {
        vec![
            (format!("{LABEL_PREFIX}.project"), self.project.clone()),
            (format!("{LABEL_PREFIX}.run_id"), self.run_id.clone()),
        ]
    }

    fn task_labels(&self, request: &AttemptRequest) -> Vec<(String, String)> {
        let mut labels = self.run_labels();
        labels.push((format!("{LABEL_PREFIX}.task_id"), request.task_id.clone()));
        labels.push((format!("{LABEL_PREFIX}.branch"), request.task_branch.clone()));
        labels.push((
            format!("{LABEL_PREFIX}.workspace_path"),
            request.workspace_path.to_string_lossy().to_string(),
        ));
        labels
    }

    /// Build the container spec for an attempt. Host paths in the worker
    /// environment are remapped to the container mount points.
    fn build_spec(&self, request: &AttemptRequest) -> ContainerSpec {
        let mut env = build_worker_env(request);
        let task_dir = request
            .manifest_path
            .parent()
            .map_or_else(|| PathBuf::from("."), PathBuf::from);
        let manifest_file = request
            .manifest_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "manifest.json".to_string());
        let spec_file = request
            .spec_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "spec.md".to_string());
        for (key, value) in &mut env {
            match key.as_str() {
                "TASK_MANIFEST_PATH" => *value = format!("{TASK_MOUNT}/{manifest_file}"),
                "TASK_SPEC_PATH" => *value = format!("{TASK_MOUNT}/{spec_file}"),
                "RUN_LOGS_DIR" => *value = LOGS_MOUNT.to_string(),
                _ => {}
            }
        }

        ContainerSpec {
            name: container_name(&self.project, &self.run_id, &request.task_id, &request.slug),
            image: self.docker.image.clone(),
            labels: self.task_labels(request),
            env,
            binds: vec![
                (
                    request.workspace_path.clone(),
                    PathBuf::from(WORKSPACE_MOUNT),
                    true,
                ),
                (request.logs_dir.clone(), PathBuf::from(LOGS_MOUNT), true),
                (task_dir, PathBuf::from(TASK_MOUNT), false),
            ],
            workdir: Some(WORKSPACE_MOUNT.to_string()),
            user: self.docker.user.clone(),
            network_mode: self.docker.network_mode.clone(),
            memory_mb: self.docker.memory_mb,
            cpu_quota: self.docker.cpu_quota,
            pids_limit: self.docker.pids_limit,
        }
    }

    /// Stream container output until exit, forwarding each line into the
    /// task event log as it arrives.
    async fn follow_to_log(
        &self,
        id: &str,
        include_history: bool,
        task_id: &str,
        log: &EventLog,
    ) -> super::Result<i64> {
        let mut append_error: Option<crate::state::StateError> = None;
        let exit_code = {
            let mut sink = |line: &str| {
                if append_error.is_some() {
                    return;
                }
                if let Err(err) = log.append(&worker_line_event(line, &self.run_id, task_id)) {
                    append_error = Some(err);
                }
            };
            self.engine.follow(id, include_history, &mut sink).await?
        };
        if let Some(err) = append_error {
            return Err(err.into());
        }
        Ok(exit_code)
    }
}

#[async_trait]
impl WorkerRunner for ContainerWorkerRunner {
    async fn prepare(&self) -> super::Result<()> {
        // Image builds are an operator concern; nothing to do per run.
        Ok(())
    }

    async fn run_attempt(
        &self,
        request: &AttemptRequest,
        log: &EventLog,
        on_container_ready: Option<&ContainerReadyFn>,
    ) -> super::Result<AttemptOutcome> {
        let spec = self.build_spec(request);

        // A stale container with the same deterministic name would shadow
        // this attempt; remove it first.
        if let Some(existing) = self.engine.find_by_name(&spec.name).await? {
            warn!(name = %spec.name, id = %existing, "removing pre-existing container");
            self.engine.remove(&existing).await?;
        }

        let id = self.engine.create(&spec).await?;
        log.append(
            &EventRecord::new(event_types::CONTAINER_CREATE, &self.run_id)
                .with_task(&request.task_id)
                .with_payload(json!({
                    "container_id": id,
                    "name": spec.name,
                    "image": spec.image,
                })),
        )?;
        if let Some(callback) = on_container_ready {
            callback(&id);
        }

        self.engine.start(&id).await?;
        log.append(
            &EventRecord::new(event_types::CONTAINER_START, &self.run_id)
                .with_task(&request.task_id)
                .with_payload(json!({ "container_id": id })),
        )?;

        let exit_code = self
            .follow_to_log(&id, false, &request.task_id, log)
            .await?;
        log.append(
            &EventRecord::new(event_types::CONTAINER_EXIT, &self.run_id)
                .with_task(&request.task_id)
                .with_payload(json!({ "container_id": id, "exit_code": exit_code })),
        )?;

        info!(task_id = %request.task_id, container_id = %id, exit_code, "container attempt finished");
        Ok(AttemptOutcome {
            success: exit_code == 0,
            error_message: (exit_code != 0)
                .then(|| format!("container exited with code {exit_code}")),
            reset_to_pending: false,
            container_id: Some(id),
        })
    }

    async fn resume_attempt(
        &self,
        request: &ResumeRequest,
        log: &EventLog,
    ) -> super::Result<AttemptOutcome> {
        // Label lookup first, then the recorded id (or prefix), then the
        // deterministic name.
        let mut labels = self.run_labels();
        labels.push((format!("{LABEL_PREFIX}.task_id"), request.task_id.clone()));
        let mut found = self.engine.find_by_labels(&labels).await?.into_iter().next();
        if found.is_none() {
            if let Some(hint) = &request.container_id_hint {
                if self.engine.status(hint).await?.is_some() {
                    found = Some(hint.clone());
                }
            }
        }
        if found.is_none() {
            let name =
                container_name(&self.project, &self.run_id, &request.task_id, &request.slug);
            found = self.engine.find_by_name(&name).await?;
        }

        let Some(id) = found else {
            log.append(
                &EventRecord::new(event_types::CONTAINER_MISSING, &self.run_id)
                    .with_task(&request.task_id)
                    .with_payload(json!({
                        "container_id_hint": request.container_id_hint,
                    })),
            )?;
            return Ok(AttemptOutcome {
                success: false,
                reset_to_pending: true,
                ..AttemptOutcome::default()
            });
        };

        let Some(status) = self.engine.status(&id).await? else {
            log.append(
                &EventRecord::new(event_types::CONTAINER_MISSING, &self.run_id)
                    .with_task(&request.task_id)
                    .with_payload(json!({ "container_id_hint": id })),
            )?;
            return Ok(AttemptOutcome {
                success: false,
                reset_to_pending: true,
                ..AttemptOutcome::default()
            });
        };

        if status.running {
            log.append(
                &EventRecord::new(event_types::CONTAINER_REATTACH, &self.run_id)
                    .with_task(&request.task_id)
                    .with_payload(json!({ "container_id": id })),
            )?;
            let exit_code = self
                .follow_to_log(&id, true, &request.task_id, log)
                .await?;
            log.append(
                &EventRecord::new(event_types::CONTAINER_EXIT, &self.run_id)
                    .with_task(&request.task_id)
                    .with_payload(json!({ "container_id": id, "exit_code": exit_code })),
            )?;
            return Ok(AttemptOutcome {
                success: exit_code == 0,
                error_message: (exit_code != 0)
                    .then(|| format!("container exited with code {exit_code}")),
                reset_to_pending: false,
                container_id: Some(id),
            });
        }

        let exit_code = status.exit_code.unwrap_or(-1);
        log.append(
            &EventRecord::new(event_types::CONTAINER_EXITED_ON_RESUME, &self.run_id)
                .with_task(&request.task_id)
                .with_payload(json!({ "container_id": id, "exit_code": exit_code })),
        )?;
        Ok(AttemptOutcome {
            success: exit_code == 0,
            error_message: (exit_code != 0)
                .then(|| format!("container exited with code {exit_code}")),
            reset_to_pending: false,
            container_id: Some(id),
        })
    }

    async fn stop(&self, log: &EventLog) -> super::Result<StopOutcome> {
        let ids = self.engine.find_by_labels(&self.run_labels()).await?;
        let mut outcome = StopOutcome::default();
        for id in ids {
            match self.engine.stop_and_remove(&id).await {
                Ok(()) => {
                    outcome.stopped += 1;
                    log.append(
                        &EventRecord::new(event_types::CONTAINER_STOP, &self.run_id)
                            .with_payload(json!({ "container_id": id })),
                    )?;
                }
                Err(err) => {
                    outcome.errors.push(format!("{id}: {err}"));
                    log.append(
                        &EventRecord::new(event_types::CONTAINER_STOP_FAILED, &self.run_id)
                            .with_payload(json!({ "container_id": id, "error": err.to_string() })),
                    )?;
                }
            }
        }
        Ok(outcome)
    }

    async fn cleanup_task(
        &self,
        task_id: &str,
        container_id: Option<&str>,
        log: &EventLog,
    ) -> super::Result<()> {
        let Some(id) = container_id else {
            return Ok(());
        };
        if let Err(err) = self.engine.stop_and_remove(id).await {
            warn!(task_id, container_id = %id, error = %err, "container cleanup failed");
            return Ok(());
        }
        log.append(
            &EventRecord::new(event_types::CONTAINER_CLEANUP, &self.run_id)
                .with_task(task_id)
                .with_payload(json!({ "container_id": id })),
        )?;
        Ok(())
    }
}

//! The run engine.
//!
//! Wires the catalog, scheduler, workspace manager, worker runner, policy,
//! budget tracker, and VCS adapter into one coordinator loop: form a batch,
//! run its tasks in parallel, probe and publish the merge, run the
//! integration doctor, record the ledger, repeat. The run state document is
//! owned by this coordinator; worker callbacks propose updates (container
//! ids, thread ids, checkpoints) which the coordinator applies and persists.

use crate::budget::{self, BudgetTracker};
use crate::catalog::{Catalog, CatalogError, TaskSpec};
use crate::doctor;
use crate::ledger::{LedgerError, LedgerStore};
use crate::policy::{self, ComponentModel, PolicyEngine, RescopeStatus};
use crate::scheduler::{self, Plan};
use crate::state::{atomic_write_json, EventLog, StateError, StateStore};
use crate::vcs::{self, VcsError};
use crate::workspace::{WorkspaceError, WorkspaceManager};
use crate::worker::{
    AttemptOutcome, AttemptRequest, ContainerReadyFn, ResumeRequest, WorkerError, WorkerRunner,
};
use chrono::Utc;
use mycelium_core::config::{CleanupPolicy, TaskFailurePolicy};
use mycelium_core::events::{
    event_types, BatchStartPayload, BlockedTask, BudgetBreachPayload,
    DepsExternalSatisfiedPayload, RunBlockedPayload, RunResumePayload, RunStopPayload,
    SatisfiedDep, StageMovePayload, TaskResetPayload,
};
use mycelium_core::layout::control_plane_model_dir;
use mycelium_core::types::{
    BatchState, BatchStatus, CheckpointCommit, Ledger, LedgerEntry, LedgerSource, LedgerStatus,
    RunState, RunStatus, TaskStage, TaskStatus,
};
use mycelium_core::{BudgetMode, EnforcementMode, EventRecord, MyceliumHome, RunConfig, UserError};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Runs older than this with no state updates are demoted to paused when
/// enumerating run history.
pub const STALE_RUN_THRESHOLD_MINUTES: i64 = 30;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("state error: {0}")]
    State(#[from] StateError),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("workspace error: {0}")]
    Workspace(#[from] WorkspaceError),
    #[error("vcs error: {0}")]
    Vcs(#[from] VcsError),
    #[error("worker error: {0}")]
    Worker(#[from] WorkerError),
    #[error("policy error: {0}")]
    Policy(#[from] policy::PolicyError),
    #[error("budget error: {0}")]
    Budget(#[from] budget::BudgetError),
    #[error("doctor error: {0}")]
    Doctor(#[from] doctor::DoctorError),
    #[error("no run found to resume")]
    NoRunToResume,
    #[error("task join failure: {0}")]
    Join(String),
}

impl EngineError {
    /// Boundary form for command output.
    pub fn to_user_error(&self) -> UserError {
        let (code, title) = match self {
            Self::Catalog(_) => ("task.invalid", "Task catalog error"),
            Self::State(_) => ("state.error", "State store error"),
            Self::Ledger(_) => ("ledger.error", "Ledger error"),
            Self::Workspace(_) => ("workspace.error", "Workspace error"),
            Self::Vcs(_) => ("vcs.error", "Git operation failed"),
            Self::Worker(_) => ("worker.error", "Worker error"),
            Self::Policy(_) => ("policy.error", "Policy error"),
            Self::Budget(_) => ("budget.error", "Budget error"),
            Self::Doctor(_) => ("integration.error", "Integration doctor error"),
            Self::NoRunToResume => ("run.not_found", "No run to resume"),
            Self::Join(_) => ("fatal.join", "Internal task failure"),
        };
        UserError::new(code, title, self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Final disposition of a run invocation.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: RunStatus,
    pub stop_reason: Option<String>,
}

impl RunOutcome {
    /// Process exit code: paused (graceful stop) and complete both exit 0.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Complete | RunStatus::Paused => 0,
            RunStatus::Running => 0,
            RunStatus::Failed => 1,
        }
    }
}

enum BatchDisposition {
    Continue,
    RunFailed(String),
    Stopped,
}

struct PreparedTask {
    task_id: String,
    request: AttemptRequest,
    log: EventLog,
}

/// The top-level orchestrator for one run.
pub struct RunEngine {
    config: RunConfig,
    home: MyceliumHome,
    project: String,
    run_id: String,
    store: StateStore,
    catalog: Catalog,
    ledger_store: LedgerStore,
    workspaces: WorkspaceManager,
    worker: Arc<dyn WorkerRunner>,
    budget: BudgetTracker,
    stop: CancellationToken,
}

impl RunEngine {
    pub fn new(
        config: RunConfig,
        home: MyceliumHome,
        project: impl Into<String>,
        run_id: impl Into<String>,
        worker: Arc<dyn WorkerRunner>,
    ) -> Self {
        let project = project.into();
        let store = StateStore::new(home.clone(), &project);
        let catalog = Catalog::new(config.tasks_root());
        let ledger_store = LedgerStore::new(home.ledger_path(&project));
        let workspaces = WorkspaceManager::new(home.clone(), &project);
        let budget = BudgetTracker::new(config.budgets.clone());
        Self {
            config,
            home,
            project,
            run_id: run_id.into(),
            store,
            catalog,
            ledger_store,
            workspaces,
            worker,
            budget,
            stop: CancellationToken::new(),
        }
    }

    /// Token an external caller cancels to request a graceful stop.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Start a fresh run.
    pub async fn run(&self) -> Result<RunOutcome> {
        let mut state = RunState::new(
            self.run_id.clone(),
            self.project.clone(),
            self.config.repo_path.to_string_lossy().to_string(),
            self.config.main_branch.clone(),
        );
        state.control_plane.base_sha =
            Some(vcs::base_sha(&self.config.repo_path, &self.config.main_branch)?);
        self.store.save(&mut state)?;

        let log = self.store.orchestrator_log(&self.run_id);
        log.append(
            &EventRecord::new(event_types::RUN_START, &self.run_id).with_payload(json!({
                "project": self.project,
                "repo_path": state.repo_path,
                "main_branch": state.main_branch,
                "base_sha": state.control_plane.base_sha,
            })),
        )?;
        info!(run_id = %self.run_id, "run started");

        self.worker.prepare().await?;
        self.execute(state).await
    }

    /// Resume a stopped run: reattach live workers, reset the rest, and
    /// re-enter the scheduling loop with the preserved baseline.
    pub async fn resume(&self) -> Result<RunOutcome> {
        let mut state = self.store.load(&self.run_id)?;
        if state.status.is_terminal() {
            return Ok(RunOutcome {
                run_id: state.run_id.clone(),
                status: state.status,
                stop_reason: state.stop_reason.clone(),
            });
        }

        let log = self.store.orchestrator_log(&self.run_id);
        let load = self.catalog.load(None, false)?;
        let slugs: BTreeMap<String, String> = load
            .tasks
            .iter()
            .map(|t| (t.task_id.clone(), t.slug.clone()))
            .collect();

        let running: Vec<String> = state
            .tasks
            .iter()
            .filter(|(_, t)| t.status == TaskStatus::Running)
            .map(|(id, _)| id.clone())
            .collect();
        let mut reset_tasks = Vec::new();
        let mut still_running = Vec::new();

        for task_id in &running {
            let slug = slugs.get(task_id).cloned().unwrap_or_else(|| task_id.clone());
            let task = &state.tasks[task_id];
            let request = ResumeRequest {
                task_id: task_id.clone(),
                slug: slug.clone(),
                task_branch: task
                    .branch
                    .clone()
                    .unwrap_or_else(|| vcs::task_branch_name(task_id, &slug)),
                workspace_path: task.workspace.clone().map_or_else(
                    || self.workspaces.workspace_dir(&self.run_id, task_id),
                    Into::into,
                ),
                container_id_hint: task.container_id.clone(),
            };
            let task_log = self.store.task_log(&self.run_id, task_id, &slug);

            let outcome = match self.worker.resume_attempt(&request, &task_log).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    // A reattach error is not fatal; treat like a vanished
                    // worker and reschedule.
                    warn!(task_id, error = %err, "resume reattach failed");
                    AttemptOutcome {
                        success: false,
                        error_message: Some(err.to_string()),
                        reset_to_pending: true,
                        container_id: None,
                    }
                }
            };

            if outcome.reset_to_pending {
                self.reset_task(&mut state, task_id, "resume_reset", &log)?;
                reset_tasks.push(task_id.clone());
            } else {
                self.absorb_attempt_outcome(&mut state, task_id, &slug, &outcome, &log)?;
                still_running.push(task_id.clone());
            }
            self.store.save(&mut state)?;
        }

        log.append(
            &EventRecord::new(event_types::RUN_RESUME, &self.run_id).with_payload(
                serde_json::to_value(RunResumePayload {
                    status: "running".to_string(),
                    reason: state.stop_reason.clone().unwrap_or_else(|| "resume".into()),
                    reset_tasks,
                    running_tasks: still_running,
                })
                .unwrap_or(Value::Null),
            ),
        )?;

        state.status = RunStatus::Running;
        state.stop_reason = None;
        self.store.save(&mut state)?;
        info!(run_id = %self.run_id, "run resumed");
        self.execute(state).await
    }

    /// The scheduling loop shared by fresh and resumed runs.
    async fn execute(&self, mut state: RunState) -> Result<RunOutcome> {
        let log = self.store.orchestrator_log(&self.run_id);

        let known = (!self.config.resources.is_empty()).then(|| self.config.resource_names());
        let load = self.catalog.load(known.as_ref(), false)?;
        for err in &load.errors {
            warn!(error = %err, "catalog: skipping invalid task");
        }
        // Catalog order is numeric-then-lexicographic; keep it explicitly,
        // the id-keyed map alone would re-sort unpadded numeric ids.
        let order: Vec<String> = load.tasks.iter().map(|t| t.task_id.clone()).collect();
        let mut tasks: BTreeMap<String, TaskSpec> = load
            .tasks
            .into_iter()
            .map(|t| (t.task_id.clone(), t))
            .collect();
        for task_id in tasks.keys() {
            state.tasks.entry(task_id.clone()).or_default();
        }

        let mut ledger = self.ledger_store.load()?;
        self.apply_ledger_reuse(&mut state, &tasks, &ledger, &log)?;

        let policy_engine = self.build_policy_engine(&state)?;
        let effective_locks = self.decide_policies(&tasks, &policy_engine)?;

        // A resumed run may carry a half-finished batch; settle it first.
        let open_batches: Vec<u64> = state
            .batches
            .iter()
            .filter(|b| b.status == BatchStatus::Running)
            .map(|b| b.batch_id)
            .collect();
        for batch_id in open_batches {
            match self
                .merge_pipeline(&mut state, batch_id, &mut tasks, &mut ledger, &log)
                .await?
            {
                BatchDisposition::Continue => {}
                BatchDisposition::RunFailed(reason) => {
                    return self.fail_run(state, reason, &log);
                }
                BatchDisposition::Stopped => return self.graceful_stop(state, &log).await,
            }
        }

        loop {
            if self.stop.is_cancelled() {
                return self.graceful_stop(state, &log).await;
            }

            let ordered: Vec<TaskSpec> = order
                .iter()
                .filter_map(|id| tasks.get(id).cloned())
                .collect();
            let plan = scheduler::plan(
                &ordered,
                &state,
                &ledger,
                &self.catalog,
                &effective_locks,
                self.config.max_parallel,
                true,
            );

            match plan {
                Plan::Done => return self.finish_run(state, &log),
                Plan::Blocked { blocked_tasks } => {
                    return self.block_run(state, blocked_tasks, &log);
                }
                Plan::Stalled { task_ids } => {
                    warn!(?task_ids, "pending tasks can never become ready");
                    return self.fail_run(state, "stalled_dependencies".to_string(), &log);
                }
                Plan::Batch {
                    task_ids,
                    locks,
                    satisfied,
                } => {
                    for (task_id, deps) in satisfied {
                        self.emit_external_satisfied(&log, task_id, deps)?;
                    }
                    match self
                        .run_batch(&mut state, task_ids, locks, &mut tasks, &policy_engine, &mut ledger, &log)
                        .await?
                    {
                        BatchDisposition::Continue => {}
                        BatchDisposition::RunFailed(reason) => {
                            return self.fail_run(state, reason, &log);
                        }
                        BatchDisposition::Stopped => {
                            return self.graceful_stop(state, &log).await;
                        }
                    }
                }
            }
        }
    }

    fn build_policy_engine(&self, state: &RunState) -> Result<PolicyEngine> {
        let model = if self.config.control_plane.enabled {
            state
                .control_plane
                .base_sha
                .as_ref()
                .map(|sha| control_plane_model_dir(&self.config.repo_path, sha).join("model.json"))
                .filter(|path| path.is_file())
                .map(|path| ComponentModel::load(&path))
                .transpose()?
        } else {
            None
        };
        Ok(PolicyEngine::new(
            self.config.control_plane.clone(),
            self.config.manifest_enforcement,
            model,
        )?)
    }

    /// Pre-attempt policy decisions; persisted as validator reports.
    fn decide_policies(
        &self,
        tasks: &BTreeMap<String, TaskSpec>,
        policy_engine: &PolicyEngine,
    ) -> Result<BTreeMap<String, Vec<String>>> {
        let mut locks = BTreeMap::new();
        for (task_id, task) in tasks {
            let decision = policy_engine.decide(
                task_id,
                &task.manifest.locks.writes,
                &task.manifest.files.writes,
                &[],
            );
            let report_path =
                self.home
                    .validator_report_path(&self.project, &self.run_id, "policy", task_id);
            atomic_write_json(&report_path, &decision)?;
            locks.insert(task_id.clone(), decision.effective_write_locks);
        }
        Ok(locks)
    }

    /// Mark pending tasks already satisfied by the ledger as skipped.
    fn apply_ledger_reuse(
        &self,
        state: &mut RunState,
        tasks: &BTreeMap<String, TaskSpec>,
        ledger: &Ledger,
        log: &EventLog,
    ) -> Result<()> {
        for (task_id, task) in tasks {
            let Some(slot) = state.tasks.get_mut(task_id) else {
                continue;
            };
            if slot.status == TaskStatus::Pending
                && ledger.satisfied_entry(task_id, &task.fingerprint).is_some()
            {
                info!(task_id, "satisfied from ledger; skipping");
                slot.status = TaskStatus::Skipped;
                log.append(
                    &EventRecord::new(event_types::LEDGER_REUSE, &self.run_id)
                        .with_task(task_id)
                        .with_payload(json!({ "fingerprint": task.fingerprint })),
                )?;
            }
        }
        self.store.save(state)?;
        Ok(())
    }

    fn emit_external_satisfied(
        &self,
        log: &EventLog,
        task_id: String,
        deps: Vec<SatisfiedDep>,
    ) -> Result<()> {
        log.append(
            &EventRecord::new(event_types::DEPS_EXTERNAL_SATISFIED, &self.run_id)
                .with_task(&task_id)
                .with_payload(
                    serde_json::to_value(DepsExternalSatisfiedPayload { task_id: task_id.clone(), deps })
                        .unwrap_or(Value::Null),
                ),
        )?;
        Ok(())
    }

    /// Run one batch: prepare workspaces serially, run attempts in parallel,
    /// absorb outcomes, then drive the merge pipeline.
    async fn run_batch(
        &self,
        state: &mut RunState,
        task_ids: Vec<String>,
        locks: Vec<String>,
        tasks: &mut BTreeMap<String, TaskSpec>,
        policy_engine: &PolicyEngine,
        ledger: &mut Ledger,
        log: &EventLog,
    ) -> Result<BatchDisposition> {
        let batch_id = state.next_batch_id();
        state.batches.push(BatchState {
            batch_id,
            status: BatchStatus::Running,
            task_ids: task_ids.clone(),
            started_at: Utc::now(),
            completed_at: None,
            merge_commit: None,
            integration_doctor_passed: None,
        });
        log.append(
            &EventRecord::new(event_types::BATCH_START, &self.run_id)
                .with_batch(batch_id)
                .with_payload(
                    serde_json::to_value(BatchStartPayload {
                        batch_id,
                        tasks: task_ids.clone(),
                        locks,
                    })
                    .unwrap_or(Value::Null),
                ),
        )?;
        self.store.save(state)?;

        // Workspace preparation and stage moves are serial: concurrent
        // `git worktree add` against one repository races on its lock file.
        let mut prepared = Vec::new();
        for task_id in &task_ids {
            let task = tasks.get_mut(task_id).expect("scheduled task exists");
            if task.stage == TaskStage::Backlog {
                let new_dir = self.catalog.move_stage(&task.dir, TaskStage::Active, None)?;
                log.append(
                    &EventRecord::new(event_types::TASK_STAGE_MOVE, &self.run_id)
                        .with_task(task_id)
                        .with_payload(
                            serde_json::to_value(StageMovePayload {
                                task_id: task_id.clone(),
                                from: TaskStage::Backlog.as_str().to_string(),
                                to: TaskStage::Active.as_str().to_string(),
                            })
                            .unwrap_or(Value::Null),
                        ),
                )?;
                task.dir = new_dir;
                task.stage = TaskStage::Active;
            }

            let branch = vcs::task_branch_name(task_id, &task.slug);
            let task_log = self.store.task_log(&self.run_id, task_id, &task.slug);
            task_log.append(
                &EventRecord::new(event_types::WORKSPACE_PREPARE_START, &self.run_id)
                    .with_task(task_id),
            )?;
            let prep = self.workspaces.prepare_task_workspace(
                &self.config.repo_path,
                &self.run_id,
                task_id,
                &branch,
                &self.config.main_branch,
                self.config.task_failure_policy,
            )?;
            task_log.append(
                &EventRecord::new(
                    if prep.recovered {
                        event_types::WORKSPACE_PREPARE_RECOVERED
                    } else {
                        event_types::WORKSPACE_PREPARE_COMPLETE
                    },
                    &self.run_id,
                )
                .with_task(task_id)
                .with_payload(json!({
                    "workspace": prep.workspace_path.to_string_lossy(),
                    "created": prep.created,
                })),
            )?;

            let logs_dir = self
                .home
                .task_log_dir(&self.project, &self.run_id, task_id, &task.slug);
            std::fs::create_dir_all(&logs_dir).map_err(StateError::Io)?;

            let slot = state.tasks.get_mut(task_id).expect("task state exists");
            slot.status = TaskStatus::Running;
            slot.attempts += 1;
            slot.branch = Some(branch.clone());
            slot.workspace = Some(prep.workspace_path.to_string_lossy().to_string());
            slot.logs_dir = Some(logs_dir.to_string_lossy().to_string());
            slot.batch_id = Some(batch_id);
            let attempt = slot.attempts;

            log.append(
                &EventRecord::new(event_types::TASK_START, &self.run_id)
                    .with_task(task_id)
                    .with_batch(batch_id)
                    .with_payload(json!({ "attempt": attempt, "branch": branch })),
            )?;
            self.store.save(state)?;

            prepared.push(PreparedTask {
                task_id: task_id.clone(),
                request: AttemptRequest {
                    task_id: task_id.clone(),
                    slug: task.slug.clone(),
                    task_branch: branch,
                    workspace_path: prep.workspace_path,
                    manifest_path: task.manifest_path(),
                    spec_path: task.spec_path(),
                    doctor_cmd: task.manifest.verify.doctor.clone(),
                    doctor_timeout: self.config.doctor_timeout,
                    lint_cmd: task
                        .manifest
                        .verify
                        .lint
                        .clone()
                        .or_else(|| self.config.lint.clone()),
                    lint_timeout: self.config.lint_timeout,
                    fast_cmd: task.manifest.verify.fast.clone(),
                    max_retries: self.config.max_retries,
                    bootstrap_cmds: self.config.bootstrap.clone(),
                    checkpoint_commits: self.config.worker.checkpoint_commits,
                    default_test_paths: task.manifest.test_paths.clone(),
                    logs_dir,
                    model: self.config.worker.model.clone(),
                    reasoning_effort: self.config.worker.reasoning_effort.clone(),
                },
                log: task_log,
            });
        }

        // Parallel attempt section. Container-id proposals arrive over a
        // channel and are applied here, on the coordinator.
        let (tx, mut rx) = mpsc::unbounded_channel::<(String, String)>();
        let mut join_set: JoinSet<(String, std::result::Result<AttemptOutcome, WorkerError>)> =
            JoinSet::new();
        for p in &prepared {
            let worker = Arc::clone(&self.worker);
            let request = p.request.clone();
            let task_log = p.log.clone();
            let task_id = p.task_id.clone();
            let tx = tx.clone();
            join_set.spawn(async move {
                let cb_task = task_id.clone();
                let callback: Box<ContainerReadyFn> = Box::new(move |container_id: &str| {
                    let _ = tx.send((cb_task.clone(), container_id.to_string()));
                });
                let result = worker
                    .run_attempt(&request, &task_log, Some(callback.as_ref()))
                    .await;
                (task_id, result)
            });
        }
        drop(tx);

        let mut results = Vec::new();
        let mut stopped = false;
        loop {
            tokio::select! {
                biased;
                () = self.stop.cancelled(), if !stopped => {
                    info!(batch_id, "stop requested; cancelling outstanding attempts");
                    stopped = true;
                    join_set.abort_all();
                }
                Some((task_id, container_id)) = rx.recv() => {
                    if let Some(slot) = state.tasks.get_mut(&task_id) {
                        slot.container_id = Some(container_id);
                        self.store.save(state)?;
                    }
                }
                joined = join_set.join_next() => {
                    match joined {
                        None => break,
                        Some(Ok(result)) => results.push(result),
                        Some(Err(err)) if err.is_cancelled() => {}
                        Some(Err(err)) => return Err(EngineError::Join(err.to_string())),
                    }
                }
            }
        }
        while let Ok((task_id, container_id)) = rx.try_recv() {
            if let Some(slot) = state.tasks.get_mut(&task_id) {
                slot.container_id = Some(container_id);
            }
        }
        self.store.save(state)?;

        if stopped {
            return Ok(BatchDisposition::Stopped);
        }

        // Absorb outcomes on the coordinator.
        let mut run_failure: Option<String> = None;
        for (task_id, result) in results {
            let slug = tasks[&task_id].slug.clone();
            let outcome = match result {
                Ok(outcome) => outcome,
                Err(err) => {
                    error!(task_id, error = %err, "worker attempt errored");
                    AttemptOutcome {
                        success: false,
                        error_message: Some(err.to_string()),
                        reset_to_pending: false,
                        container_id: None,
                    }
                }
            };
            self.absorb_attempt_outcome(state, &task_id, &slug, &outcome, log)?;

            // Budget checks run after usage is absorbed.
            let breaches = self.budget.check(state, &task_id);
            for breach in &breaches {
                let payload = BudgetBreachPayload {
                    limit: breach.limit.clone(),
                    used: breach.used,
                    max: breach.max,
                    task_id: breach.task_id.clone(),
                };
                match self.budget.mode() {
                    BudgetMode::Warn => {
                        log.append(
                            &EventRecord::new(event_types::BUDGET_WARN, &self.run_id)
                                .with_payload(serde_json::to_value(&payload).unwrap_or(Value::Null)),
                        )?;
                    }
                    BudgetMode::Block => {
                        log.append(
                            &EventRecord::new(event_types::BUDGET_BLOCK, &self.run_id)
                                .with_payload(serde_json::to_value(&payload).unwrap_or(Value::Null)),
                        )?;
                        run_failure = Some("budget_block".to_string());
                    }
                }
            }
            if run_failure.is_some() {
                self.store.save(state)?;
                break;
            }

            if outcome.success {
                let (declared_locks, declared_globs) = {
                    let manifest = &tasks[&task_id].manifest;
                    (manifest.locks.writes.clone(), manifest.files.writes.clone())
                };
                match self.apply_compliance(
                    state,
                    &task_id,
                    &declared_locks,
                    &declared_globs,
                    policy_engine,
                    log,
                )? {
                    ComplianceOutcome::Ok => {}
                    ComplianceOutcome::RunFailed(reason) => {
                        run_failure = Some(reason);
                    }
                }
            } else if outcome.reset_to_pending {
                self.reset_task(state, &task_id, "worker_unreachable", log)?;
            } else {
                match self.handle_worker_failure(state, &task_id, &outcome, log)? {
                    None => {}
                    Some(reason) => run_failure = Some(reason),
                }
            }
            self.store.save(state)?;
            if run_failure.is_some() {
                break;
            }
        }

        if let Some(reason) = run_failure {
            if let Some(batch) = state.batches.iter_mut().find(|b| b.batch_id == batch_id) {
                batch.status = BatchStatus::Failed;
                batch.completed_at = Some(Utc::now());
            }
            self.store.save(state)?;
            return Ok(BatchDisposition::RunFailed(reason));
        }

        self.merge_pipeline(state, batch_id, tasks, ledger, log).await
    }

    /// Record a finished attempt: container id, usage, checkpoints, thread
    /// id, and the validated/failed status flip.
    fn absorb_attempt_outcome(
        &self,
        state: &mut RunState,
        task_id: &str,
        slug: &str,
        outcome: &AttemptOutcome,
        _log: &EventLog,
    ) -> Result<()> {
        let log_path = self
            .home
            .task_log_path(&self.project, &self.run_id, task_id, slug);
        let usage = budget::usage_from_task_log(&log_path)?;
        if !usage.is_empty() {
            self.budget.apply_task_usage(state, task_id, usage);
        }

        let checkpoints = collect_checkpoints(&log_path)?;
        let thread_id = read_worker_thread_id(&log_path);
        if let Some(slot) = state.tasks.get_mut(task_id) {
            if let Some(container_id) = &outcome.container_id {
                slot.container_id = Some(container_id.clone());
            }
            if let Some(thread_id) = thread_id {
                slot.thread_id = Some(thread_id);
            }
            for checkpoint in checkpoints {
                let last = slot.checkpoint_commits.last().map_or(0, |c| c.attempt);
                if checkpoint.attempt > last {
                    slot.checkpoint_commits.push(checkpoint);
                }
            }
            if outcome.success {
                slot.status = TaskStatus::Validated;
            }
        }
        Ok(())
    }

    /// Post-attempt compliance: changed files vs declared writes, with
    /// tier-upgraded enforcement and rescope planning.
    fn apply_compliance(
        &self,
        state: &mut RunState,
        task_id: &str,
        declared_locks: &[String],
        declared_globs: &[String],
        policy_engine: &PolicyEngine,
        log: &EventLog,
    ) -> Result<ComplianceOutcome> {
        if self.config.manifest_enforcement == EnforcementMode::Off {
            return Ok(ComplianceOutcome::Ok);
        }
        let Some(workspace) = state.tasks.get(task_id).and_then(|t| t.workspace.clone()) else {
            return Ok(ComplianceOutcome::Ok);
        };
        let changed =
            vcs::changed_files_from_base(Path::new(&workspace), &self.config.main_branch)?;

        // Re-decide with the observed changes so the tier reflects what the
        // attempt actually touched.
        let decision = policy_engine.decide(task_id, declared_locks, declared_globs, &changed);

        let checkset = policy::checkset(task_id, &changed, declared_globs)?;
        let checkset_path =
            self.home
                .validator_report_path(&self.project, &self.run_id, "checkset", task_id);
        atomic_write_json(&checkset_path, &checkset)?;

        if checkset.ok {
            log.append(
                &EventRecord::new(event_types::VALIDATOR_PASS, &self.run_id)
                    .with_task(task_id)
                    .with_payload(json!({ "validator": "checkset" })),
            )?;
            return Ok(ComplianceOutcome::Ok);
        }

        log.append(
            &EventRecord::new(event_types::VALIDATOR_FAIL, &self.run_id)
                .with_task(task_id)
                .with_payload(json!({
                    "validator": "checkset",
                    "undeclared_writes": checkset.undeclared_writes,
                    "tier": decision.tier,
                    "enforcement": decision.enforcement.as_str(),
                })),
        )?;

        if decision.enforcement != EnforcementMode::Block {
            return Ok(ComplianceOutcome::Ok);
        }

        let plan = policy::rescope(
            &checkset.undeclared_writes,
            policy_engine.model(),
            Some(self.config.control_plane.fallback_resource.as_str()),
        );
        let plan_path =
            self.home
                .validator_report_path(&self.project, &self.run_id, "rescope", task_id);
        atomic_write_json(&plan_path, &plan)?;

        match plan.status {
            RescopeStatus::Noop => Ok(ComplianceOutcome::Ok),
            RescopeStatus::Updated => {
                warn!(task_id, "blocked on compliance; task needs rescope");
                if let Some(slot) = state.tasks.get_mut(task_id) {
                    slot.status = TaskStatus::NeedsRescope;
                }
                Ok(ComplianceOutcome::Ok)
            }
            RescopeStatus::Failed => {
                if let Some(slot) = state.tasks.get_mut(task_id) {
                    slot.status = TaskStatus::Failed;
                }
                Ok(ComplianceOutcome::RunFailed("rescope_failed".to_string()))
            }
        }
    }

    /// Failed worker attempt: retry policy resets the task, fail_fast ends
    /// the run.
    fn handle_worker_failure(
        &self,
        state: &mut RunState,
        task_id: &str,
        outcome: &AttemptOutcome,
        log: &EventLog,
    ) -> Result<Option<String>> {
        let attempts = state.tasks.get(task_id).map_or(0, |t| t.attempts);
        match self.config.task_failure_policy {
            TaskFailurePolicy::Retry => {
                let retriable =
                    self.config.unlimited_retries() || attempts < self.config.max_retries;
                if retriable {
                    self.reset_task(state, task_id, "worker_failed", log)?;
                    Ok(None)
                } else {
                    self.mark_task_failed(state, task_id, outcome, log)?;
                    Ok(None)
                }
            }
            TaskFailurePolicy::FailFast => {
                self.mark_task_failed(state, task_id, outcome, log)?;
                Ok(Some("task_failed".to_string()))
            }
        }
    }

    fn mark_task_failed(
        &self,
        state: &mut RunState,
        task_id: &str,
        outcome: &AttemptOutcome,
        log: &EventLog,
    ) -> Result<()> {
        warn!(task_id, error = ?outcome.error_message, "task failed");
        if let Some(slot) = state.tasks.get_mut(task_id) {
            slot.status = TaskStatus::Failed;
        }
        log.append(
            &EventRecord::new(event_types::TASK_FAILED, &self.run_id)
                .with_task(task_id)
                .with_payload(json!({ "error": outcome.error_message })),
        )?;
        Ok(())
    }

    fn reset_task(
        &self,
        state: &mut RunState,
        task_id: &str,
        reason: &str,
        log: &EventLog,
    ) -> Result<()> {
        let attempt = state.tasks.get(task_id).map_or(0, |t| t.attempts);
        if let Some(slot) = state.tasks.get_mut(task_id) {
            slot.status = TaskStatus::Pending;
        }
        log.append(
            &EventRecord::new(event_types::TASK_RESET, &self.run_id)
                .with_task(task_id)
                .with_payload(
                    serde_json::to_value(TaskResetPayload {
                        task_id: task_id.to_string(),
                        reason: reason.to_string(),
                        attempt,
                    })
                    .unwrap_or(Value::Null),
                ),
        )?;
        Ok(())
    }

    /// Merge pipeline for a batch: probe, reschedule conflicts, publish the
    /// clean set, run the integration doctor, and close out the batch.
    async fn merge_pipeline(
        &self,
        state: &mut RunState,
        batch_id: u64,
        tasks: &mut BTreeMap<String, TaskSpec>,
        ledger: &mut Ledger,
        log: &EventLog,
    ) -> Result<BatchDisposition> {
        let batch_task_ids: Vec<String> = state
            .batches
            .iter()
            .find(|b| b.batch_id == batch_id)
            .map(|b| b.task_ids.clone())
            .unwrap_or_default();

        let validated: Vec<String> = batch_task_ids
            .iter()
            .filter(|id| {
                state
                    .tasks
                    .get(*id)
                    .is_some_and(|t| t.status == TaskStatus::Validated)
            })
            .cloned()
            .collect();

        if validated.is_empty() {
            // Nothing survived the attempts; close the batch and move on.
            if let Some(batch) = state.batches.iter_mut().find(|b| b.batch_id == batch_id) {
                batch.status = BatchStatus::Failed;
                batch.completed_at = Some(Utc::now());
            }
            log.append(
                &EventRecord::new(event_types::BATCH_FAILED, &self.run_id).with_batch(batch_id),
            )?;
            self.store.save(state)?;
            return Ok(BatchDisposition::Continue);
        }

        let branch_of = |state: &RunState, id: &str| {
            state
                .tasks
                .get(id)
                .and_then(|t| t.branch.clone())
                .unwrap_or_else(|| vcs::task_branch_name(id, id))
        };
        let branches: Vec<String> = validated.iter().map(|id| branch_of(state, id)).collect();

        let probe =
            vcs::temp_merge_probe(&self.config.repo_path, &self.config.main_branch, &branches)?;

        let mut merged_ids = validated.clone();
        if !probe.conflicts.is_empty() {
            for conflict in &probe.conflicts {
                let Some(task_id) = validated
                    .iter()
                    .find(|id| branch_of(state, id) == conflict.branch)
                    .cloned()
                else {
                    continue;
                };
                info!(task_id, branch = %conflict.branch, "merge conflict; rescheduling");
                self.reset_task(state, &task_id, "merge_conflict", log)?;
                merged_ids.retain(|id| *id != task_id);
            }
            self.store.save(state)?;
        }

        if merged_ids.is_empty() {
            if let Some(batch) = state.batches.iter_mut().find(|b| b.batch_id == batch_id) {
                batch.status = BatchStatus::Complete;
                batch.completed_at = Some(Utc::now());
            }
            self.store.save(state)?;
            return Ok(BatchDisposition::Continue);
        }

        let clean_branches: Vec<String> =
            merged_ids.iter().map(|id| branch_of(state, id)).collect();
        let merge_commit = vcs::final_merge(
            &self.config.repo_path,
            &self.config.main_branch,
            &clean_branches,
        )?;

        let doctor_passed = match &self.config.doctor {
            Some(cmd) => {
                let result =
                    doctor::run_command(cmd, &self.config.repo_path, self.config.doctor_timeout)
                        .await?;
                let event_type = if result.passed {
                    event_types::DOCTOR_PASS
                } else {
                    event_types::DOCTOR_FAIL
                };
                let mut payload = json!({ "cmd": cmd, "exit_code": result.exit_code });
                if !result.passed {
                    payload["output_tail"] = Value::String(result.output_tail());
                }
                log.append(
                    &EventRecord::new(event_type, &self.run_id)
                        .with_batch(batch_id)
                        .with_payload(payload),
                )?;
                result.passed
            }
            None => true,
        };

        if let Some(batch) = state.batches.iter_mut().find(|b| b.batch_id == batch_id) {
            batch.merge_commit = Some(merge_commit.clone());
            batch.integration_doctor_passed = Some(doctor_passed);
            batch.completed_at = Some(Utc::now());
            batch.status = if doctor_passed {
                BatchStatus::Complete
            } else {
                BatchStatus::Failed
            };
        }

        if doctor_passed {
            for task_id in &merged_ids {
                if let Some(slot) = state.tasks.get_mut(task_id) {
                    slot.status = TaskStatus::Complete;
                }
                log.append(
                    &EventRecord::new(event_types::TASK_COMPLETE, &self.run_id)
                        .with_task(task_id)
                        .with_batch(batch_id)
                        .with_payload(json!({ "merge_commit": merge_commit })),
                )?;

                if let Some(task) = tasks.get_mut(task_id) {
                    self.ledger_store.upsert_entry(
                        ledger,
                        LedgerEntry {
                            task_id: task_id.clone(),
                            status: LedgerStatus::Complete,
                            fingerprint: task.fingerprint.clone(),
                            merge_commit: Some(merge_commit.clone()),
                            integration_doctor_passed: Some(true),
                            completed_at: Some(Utc::now()),
                            run_id: Some(self.run_id.clone()),
                            source: LedgerSource::Executor,
                        },
                    )?;

                    if task.stage != TaskStage::Archive {
                        let from = task.stage;
                        let new_dir = self.catalog.move_stage(
                            &task.dir,
                            TaskStage::Archive,
                            Some(&self.run_id),
                        )?;
                        log.append(
                            &EventRecord::new(event_types::TASK_STAGE_MOVE, &self.run_id)
                                .with_task(task_id)
                                .with_payload(
                                    serde_json::to_value(StageMovePayload {
                                        task_id: task_id.clone(),
                                        from: from.as_str().to_string(),
                                        to: TaskStage::Archive.as_str().to_string(),
                                    })
                                    .unwrap_or(Value::Null),
                                ),
                        )?;
                        task.dir = new_dir;
                        task.stage = TaskStage::Archive;
                    }
                }

                // Success cleanup per config.
                if self.config.cleanup.workspaces == CleanupPolicy::OnSuccess {
                    self.workspaces
                        .remove_task_workspace(&self.config.repo_path, &self.run_id, task_id);
                }
                if self.config.cleanup.containers == CleanupPolicy::OnSuccess {
                    let container_id = state
                        .tasks
                        .get(task_id)
                        .and_then(|t| t.container_id.clone());
                    let slug = tasks.get(task_id).map_or_else(|| task_id.clone(), |t| t.slug.clone());
                    let task_log = self.store.task_log(&self.run_id, task_id, &slug);
                    self.worker
                        .cleanup_task(task_id, container_id.as_deref(), &task_log)
                        .await?;
                }
            }
            log.append(
                &EventRecord::new(event_types::BATCH_COMPLETE, &self.run_id)
                    .with_batch(batch_id)
                    .with_payload(json!({ "merge_commit": merge_commit })),
            )?;
            self.store.save(state)?;
            return Ok(BatchDisposition::Continue);
        }

        // Integration doctor failed: the batch fails, and policy decides
        // whether the offending tasks retry or the run aborts.
        log.append(
            &EventRecord::new(event_types::BATCH_FAILED, &self.run_id)
                .with_batch(batch_id)
                .with_payload(json!({ "reason": "integration_doctor_failed" })),
        )?;
        match self.config.task_failure_policy {
            TaskFailurePolicy::Retry => {
                for task_id in &merged_ids {
                    self.reset_task(state, task_id, "integration_doctor_failed", log)?;
                }
                self.store.save(state)?;
                Ok(BatchDisposition::Continue)
            }
            TaskFailurePolicy::FailFast => {
                for task_id in &merged_ids {
                    if let Some(slot) = state.tasks.get_mut(task_id) {
                        slot.status = TaskStatus::Failed;
                    }
                }
                self.store.save(state)?;
                Ok(BatchDisposition::RunFailed(
                    "integration_doctor_failed".to_string(),
                ))
            }
        }
    }

    fn finish_run(&self, mut state: RunState, log: &EventLog) -> Result<RunOutcome> {
        let all_done = state
            .tasks
            .values()
            .all(|t| matches!(t.status, TaskStatus::Complete | TaskStatus::Skipped));
        if all_done {
            state.status = RunStatus::Complete;
            log.append(&EventRecord::new(event_types::RUN_COMPLETE, &self.run_id))?;
            info!(run_id = %self.run_id, "run complete");
        } else {
            state.status = RunStatus::Failed;
            state.stop_reason = Some("tasks_failed".to_string());
            log.append(
                &EventRecord::new(event_types::RUN_FAILED, &self.run_id)
                    .with_payload(json!({ "reason": "tasks_failed" })),
            )?;
        }
        self.store.save(&mut state)?;
        Ok(RunOutcome {
            run_id: state.run_id.clone(),
            status: state.status,
            stop_reason: state.stop_reason,
        })
    }

    fn block_run(
        &self,
        mut state: RunState,
        blocked_tasks: Vec<BlockedTask>,
        log: &EventLog,
    ) -> Result<RunOutcome> {
        warn!(run_id = %self.run_id, ?blocked_tasks, "run blocked on missing dependencies");
        log.append(
            &EventRecord::new(event_types::RUN_BLOCKED, &self.run_id).with_payload(
                serde_json::to_value(RunBlockedPayload {
                    reason: "missing_dependencies".to_string(),
                    blocked_tasks,
                })
                .unwrap_or(Value::Null),
            ),
        )?;
        state.status = RunStatus::Failed;
        state.stop_reason = Some("missing_dependencies".to_string());
        self.store.save(&mut state)?;
        Ok(RunOutcome {
            run_id: state.run_id.clone(),
            status: state.status,
            stop_reason: state.stop_reason,
        })
    }

    fn fail_run(&self, mut state: RunState, reason: String, log: &EventLog) -> Result<RunOutcome> {
        error!(run_id = %self.run_id, reason, "run failed");
        state.status = RunStatus::Failed;
        state.stop_reason = Some(reason.clone());
        log.append(
            &EventRecord::new(event_types::RUN_FAILED, &self.run_id)
                .with_payload(json!({ "reason": reason })),
        )?;
        self.store.save(&mut state)?;
        Ok(RunOutcome {
            run_id: state.run_id.clone(),
            status: state.status,
            stop_reason: state.stop_reason,
        })
    }

    /// Graceful stop: pause the run, optionally stop containers, finalize
    /// the log, and return promptly. State remains resumable.
    async fn graceful_stop(&self, mut state: RunState, log: &EventLog) -> Result<RunOutcome> {
        if !state.status.is_terminal() {
            state.status = RunStatus::Paused;
            state.stop_reason = Some("signal".to_string());
        }

        let (containers, containers_stopped) = if self.config.stop_containers_on_exit {
            let stopped = self.worker.stop(log).await?;
            ("stopped".to_string(), Some(stopped.stopped))
        } else {
            ("left_running".to_string(), None)
        };

        log.append(
            &EventRecord::new(event_types::RUN_STOP, &self.run_id).with_payload(
                serde_json::to_value(RunStopPayload {
                    reason: "signal".to_string(),
                    containers,
                    containers_stopped,
                })
                .unwrap_or(Value::Null),
            ),
        )?;
        self.store.save(&mut state)?;
        info!(run_id = %self.run_id, "run paused by signal");
        Ok(RunOutcome {
            run_id: state.run_id.clone(),
            status: state.status,
            stop_reason: state.stop_reason,
        })
    }
}

enum ComplianceOutcome {
    Ok,
    RunFailed(String),
}

/// Checkpoint commits the worker reported in its event log.
fn collect_checkpoints(log_path: &Path) -> Result<Vec<CheckpointCommit>> {
    let page = crate::state::read_jsonl_from_cursor(log_path, 0, None, Some("checkpoint.commit"))?;
    let mut checkpoints = Vec::new();
    for event in page.events {
        let Some(payload) = event.payload else { continue };
        let Some(sha) = payload.get("sha").and_then(Value::as_str) else {
            continue;
        };
        let attempt = payload.get("attempt").and_then(Value::as_u64).unwrap_or(1) as u32;
        checkpoints.push(CheckpointCommit {
            attempt,
            sha: sha.to_string(),
            created_at: event.ts,
        });
    }
    Ok(checkpoints)
}

/// Worker continuation handle, if the worker published one.
fn read_worker_thread_id(log_path: &Path) -> Option<String> {
    let state_path = log_path.parent()?.join("worker-state.json");
    let content = std::fs::read_to_string(state_path).ok()?;
    let value: Value = serde_json::from_str(&content).ok()?;
    value
        .get("thread_id")
        .and_then(Value::as_str)
        .map(String::from)
}

//! Batch scheduling.
//!
//! Computes the ready set from dependencies, ledger reuse, and task status,
//! then forms lock-disjoint batches in task-id order. Batches run serially;
//! tasks within a batch run in parallel, so admission requires that every
//! admitted task's effective write locks are disjoint from the batch's
//! running union.

use crate::catalog::{Catalog, TaskSpec};
use crate::ledger;
use mycelium_core::events::{BlockedTask, SatisfiedDep};
use mycelium_core::types::{Ledger, RunState, TaskStatus};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Why a pending task cannot run yet.
#[derive(Debug, Clone)]
pub enum Readiness {
    /// All deps satisfied; external deps listed with their ledger evidence.
    Ready(Vec<SatisfiedDep>),
    /// Waiting on an internal dep that has not completed yet.
    Waiting,
    /// An external dep is missing from the ledger or fingerprint-mismatched.
    Blocked(Vec<String>),
}

/// What the engine should do next.
#[derive(Debug)]
pub enum Plan {
    /// Run this batch of lock-disjoint tasks (in admission order).
    Batch {
        task_ids: Vec<String>,
        /// Union of the admitted tasks' effective write locks.
        locks: Vec<String>,
        /// External dependency satisfaction evidence, per admitted task.
        satisfied: Vec<(String, Vec<SatisfiedDep>)>,
    },
    /// External dependencies can never be satisfied; the run must stop.
    Blocked { blocked_tasks: Vec<BlockedTask> },
    /// Pending tasks remain but none can ever become ready (an internal dep
    /// failed or is itself unrunnable).
    Stalled { task_ids: Vec<String> },
    /// Nothing pending.
    Done,
}

/// Readiness of a single pending task.
///
/// `present` is the set of task ids in this run; deps outside it are
/// external and resolve through the ledger (entry must exist and its
/// fingerprint must match the dep's current fingerprint on disk).
pub fn task_readiness(
    task: &TaskSpec,
    state: &RunState,
    present: &BTreeSet<String>,
    ledger_doc: &Ledger,
    catalog: &Catalog,
    ledger_reuse_enabled: bool,
) -> Readiness {
    let mut satisfied = Vec::new();
    let mut missing = Vec::new();
    let mut waiting = false;

    for dep in &task.manifest.dependencies {
        if present.contains(dep) {
            let dep_status = state.tasks.get(dep).map(|t| t.status);
            match dep_status {
                Some(TaskStatus::Complete | TaskStatus::Skipped) => {}
                _ => waiting = true,
            }
            continue;
        }

        if !ledger_reuse_enabled {
            missing.push(dep.clone());
            continue;
        }
        let current = ledger::external_dep_fingerprint(catalog, ledger_doc, dep);
        match current {
            Some(fp) if ledger_doc.satisfied_entry(dep, &fp).is_some() => {
                let entry = &ledger_doc.entries[dep];
                satisfied.push(SatisfiedDep {
                    dep_id: dep.clone(),
                    fingerprint: fp,
                    run_id: entry.run_id.clone(),
                });
            }
            _ => missing.push(dep.clone()),
        }
    }

    if !missing.is_empty() {
        Readiness::Blocked(missing)
    } else if waiting {
        Readiness::Waiting
    } else {
        Readiness::Ready(satisfied)
    }
}

/// Compute the next scheduling step.
///
/// `effective_locks` maps task id to the task's effective write locks (from
/// the policy engine). Tasks are considered in catalog order; a candidate is
/// admitted only when its locks are disjoint from the batch's running union,
/// up to `max_parallel` tasks.
pub fn plan(
    tasks: &[TaskSpec],
    state: &RunState,
    ledger_doc: &Ledger,
    catalog: &Catalog,
    effective_locks: &BTreeMap<String, Vec<String>>,
    max_parallel: usize,
    ledger_reuse_enabled: bool,
) -> Plan {
    let present: BTreeSet<String> = tasks.iter().map(|t| t.task_id.clone()).collect();

    let pending: Vec<&TaskSpec> = tasks
        .iter()
        .filter(|t| {
            state
                .tasks
                .get(&t.task_id)
                .is_none_or(|s| s.status == TaskStatus::Pending)
        })
        .collect();
    if pending.is_empty() {
        return Plan::Done;
    }

    let mut ready: Vec<(&TaskSpec, Vec<SatisfiedDep>)> = Vec::new();
    let mut blocked: Vec<BlockedTask> = Vec::new();
    let mut waiting = 0usize;

    for task in &pending {
        match task_readiness(task, state, &present, ledger_doc, catalog, ledger_reuse_enabled) {
            Readiness::Ready(deps) => ready.push((task, deps)),
            Readiness::Waiting => waiting += 1,
            Readiness::Blocked(missing_deps) => blocked.push(BlockedTask {
                task_id: task.task_id.clone(),
                missing_deps,
            }),
        }
    }

    if !ready.is_empty() {
        let mut task_ids = Vec::new();
        let mut satisfied = Vec::new();
        let mut held: BTreeSet<String> = BTreeSet::new();
        for (task, deps) in ready {
            if task_ids.len() >= max_parallel {
                break;
            }
            let locks: Vec<String> = effective_locks
                .get(&task.task_id)
                .cloned()
                .unwrap_or_default();
            let disjoint = locks.iter().all(|lock| !held.contains(lock));
            if !disjoint {
                debug!(task_id = %task.task_id, "deferred by write-lock overlap");
                continue;
            }
            held.extend(locks.iter().cloned());
            task_ids.push(task.task_id.clone());
            if !deps.is_empty() {
                satisfied.push((task.task_id.clone(), deps));
            }
        }
        return Plan::Batch {
            task_ids,
            locks: held.into_iter().collect(),
            satisfied,
        };
    }

    if !blocked.is_empty() {
        return Plan::Blocked {
            blocked_tasks: blocked,
        };
    }

    debug_assert!(waiting > 0);
    Plan::Stalled {
        task_ids: pending.iter().map(|t| t.task_id.clone()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{MANIFEST_FILE, SPEC_FILE};
    use mycelium_core::types::{LedgerEntry, LedgerSource, LedgerStatus, TaskState};
    use std::path::Path;
    use tempfile::TempDir;

    fn write_task(dir: &Path, id: &str, name: &str, deps: &[&str], write_locks: &[&str]) {
        let slug = mycelium_core::slugify(name);
        let task_dir = dir.join(format!("{id}-{slug}"));
        std::fs::create_dir_all(&task_dir).unwrap();
        let deps_json: Vec<String> = deps.iter().map(|d| format!("\"{d}\"")).collect();
        let locks_json: Vec<String> = write_locks.iter().map(|l| format!("\"{l}\"")).collect();
        std::fs::write(
            task_dir.join(MANIFEST_FILE),
            format!(
                r#"{{
                    "name": "{name}",
                    "dependencies": [{}],
                    "locks": {{ "writes": [{}] }},
                    "verify": {{ "doctor": "true" }}
                }}"#,
                deps_json.join(","),
                locks_json.join(",")
            ),
        )
        .unwrap();
        std::fs::write(task_dir.join(SPEC_FILE), format!("# {name}\n")).unwrap();
    }

    struct Fixture {
        _dir: TempDir,
        catalog: Catalog,
        tasks: Vec<TaskSpec>,
        state: RunState,
        ledger: Ledger,
        locks: BTreeMap<String, Vec<String>>,
    }

    fn fixture(defs: &[(&str, &str, &[&str], &[&str])]) -> Fixture {
        let dir = TempDir::new().unwrap();
        let tasks_root = dir.path().join("tasks");
        std::fs::create_dir_all(tasks_root.join("backlog")).unwrap();
        let catalog = Catalog::new(&tasks_root);
        for (id, name, deps, locks) in defs {
            write_task(&catalog.layout().backlog_dir(), id, name, deps, locks);
        }
        let load = catalog.load(None, true).unwrap();
        let mut state = RunState::new(
            "run-1".into(),
            "demo".into(),
            "/repo".into(),
            "main".into(),
        );
        let mut locks = BTreeMap::new();
        for task in &load.tasks {
            state
                .tasks
                .insert(task.task_id.clone(), TaskState::default());
            locks.insert(
                task.task_id.clone(),
                task.manifest.locks.writes.clone(),
            );
        }
        Fixture {
            _dir: dir,
            catalog,
            tasks: load.tasks,
            state,
            ledger: Ledger::default(),
            locks,
        }
    }

    fn plan_of(f: &Fixture, max_parallel: usize) -> Plan {
        plan(
            &f.tasks,
            &f.state,
            &f.ledger,
            &f.catalog,
            &f.locks,
            max_parallel,
            true,
        )
    }

    #[test]
    fn batch_admits_lock_disjoint_tasks_in_id_order() {
        let f = fixture(&[
            ("001", "A", &[], &["api"]),
            ("002", "B", &[], &["db"]),
            ("003", "C", &[], &["api"]),
        ]);
        let Plan::Batch { task_ids, locks, .. } = plan_of(&f, 8) else {
            panic!("expected a batch");
        };
        // 003 overlaps 001 on `api` and is deferred to a later batch.
        assert_eq!(task_ids, vec!["001", "002"]);
        assert_eq!(locks, vec!["api", "db"]);
    }

    #[test]
    fn batch_write_lock_sets_are_pairwise_disjoint() {
        let f = fixture(&[
            ("001", "A", &[], &["api", "db"]),
            ("002", "B", &[], &["db", "cache"]),
            ("003", "C", &[], &["cache"]),
            ("004", "D", &[], &["web"]),
        ]);
        let Plan::Batch { task_ids, .. } = plan_of(&f, 8) else {
            panic!("expected a batch");
        };
        // Verify pairwise disjointness of the admitted set.
        let lock_sets: Vec<BTreeSet<&String>> = task_ids
            .iter()
            .map(|id| f.locks[id].iter().collect())
            .collect();
        for (i, a) in lock_sets.iter().enumerate() {
            for b in lock_sets.iter().skip(i + 1) {
                assert!(a.is_disjoint(b), "batch {task_ids:?} overlaps");
            }
        }
        assert_eq!(task_ids, vec!["001", "003", "004"]);
    }

    #[test]
    fn max_parallel_caps_batch_size() {
        let f = fixture(&[
            ("001", "A", &[], &["a"]),
            ("002", "B", &[], &["b"]),
            ("003", "C", &[], &["c"]),
        ]);
        let Plan::Batch { task_ids, .. } = plan_of(&f, 2) else {
            panic!("expected a batch");
        };
        assert_eq!(task_ids.len(), 2);
    }

    #[test]
    fn internal_dep_gates_until_complete() {
        let mut f = fixture(&[("001", "A", &[], &[]), ("002", "B", &["001"], &[])]);
        let Plan::Batch { task_ids, .. } = plan_of(&f, 8) else {
            panic!("expected a batch");
        };
        assert_eq!(task_ids, vec!["001"]);

        // Completing 001 unblocks 002.
        f.state.tasks.get_mut("001").unwrap().status = TaskStatus::Complete;
        let Plan::Batch { task_ids, satisfied, .. } = plan_of(&f, 8) else {
            panic!("expected a batch");
        };
        assert_eq!(task_ids, vec!["002"]);
        // Internal deps need no ledger evidence.
        assert!(satisfied.is_empty());
    }

    #[test]
    fn external_dep_satisfied_through_ledger() {
        let mut f = fixture(&[("002", "B", &["001"], &[])]);

        // Archive the dep as a prior run would have.
        let archived = f.catalog.layout().archive_dir("run-a").join("001-alpha");
        std::fs::create_dir_all(&archived).unwrap();
        std::fs::write(
            archived.join(MANIFEST_FILE),
            r#"{"name":"Alpha","verify":{"doctor":"true"}}"#,
        )
        .unwrap();
        std::fs::write(archived.join(SPEC_FILE), "# Alpha\n").unwrap();
        let fp = crate::ledger::archived_fingerprint(&f.catalog, "run-a", "001").unwrap();
        f.ledger.entries.insert(
            "001".into(),
            LedgerEntry {
                task_id: "001".into(),
                status: LedgerStatus::Complete,
                fingerprint: fp.clone(),
                merge_commit: None,
                integration_doctor_passed: Some(true),
                completed_at: None,
                run_id: Some("run-a".into()),
                source: LedgerSource::Executor,
            },
        );

        let Plan::Batch { task_ids, satisfied, .. } = plan_of(&f, 8) else {
            panic!("expected a batch");
        };
        assert_eq!(task_ids, vec!["002"]);
        assert_eq!(satisfied.len(), 1);
        assert_eq!(satisfied[0].0, "002");
        assert_eq!(satisfied[0].1[0].dep_id, "001");
        assert_eq!(satisfied[0].1[0].fingerprint, fp);
        assert_eq!(satisfied[0].1[0].run_id.as_deref(), Some("run-a"));
    }

    #[test]
    fn missing_external_dep_blocks_the_run() {
        let f = fixture(&[("002", "B", &["001"], &[])]);
        let Plan::Blocked { blocked_tasks } = plan_of(&f, 8) else {
            panic!("expected blocked");
        };
        assert_eq!(blocked_tasks.len(), 1);
        assert_eq!(blocked_tasks[0].task_id, "002");
        assert_eq!(blocked_tasks[0].missing_deps, vec!["001"]);
    }

    #[test]
    fn fingerprint_mismatch_blocks_the_run() {
        let mut f = fixture(&[("002", "B", &["001"], &[])]);
        let archived = f.catalog.layout().archive_dir("run-a").join("001-alpha");
        std::fs::create_dir_all(&archived).unwrap();
        std::fs::write(
            archived.join(MANIFEST_FILE),
            r#"{"name":"Alpha","verify":{"doctor":"true"}}"#,
        )
        .unwrap();
        std::fs::write(archived.join(SPEC_FILE), "# Alpha\n").unwrap();
        let fp = crate::ledger::archived_fingerprint(&f.catalog, "run-a", "001").unwrap();
        f.ledger.entries.insert(
            "001".into(),
            LedgerEntry {
                task_id: "001".into(),
                status: LedgerStatus::Complete,
                fingerprint: fp,
                merge_commit: None,
                integration_doctor_passed: Some(true),
                completed_at: None,
                run_id: Some("run-a".into()),
                source: LedgerSource::Executor,
            },
        );

        // Sanity: satisfied before the edit.
        assert!(matches!(plan_of(&f, 8), Plan::Batch { .. }));

        // One-character edit to the archived spec invalidates reuse.
        let spec_path = archived.join(SPEC_FILE);
        std::fs::write(&spec_path, "# Alpha!\n").unwrap();
        let Plan::Blocked { blocked_tasks } = plan_of(&f, 8) else {
            panic!("expected blocked after edit");
        };
        assert_eq!(blocked_tasks[0].missing_deps, vec!["001"]);
    }

    #[test]
    fn reuse_disabled_treats_external_deps_as_missing() {
        let f = fixture(&[("002", "B", &["001"], &[])]);
        let result = plan(
            &f.tasks,
            &f.state,
            &f.ledger,
            &f.catalog,
            &f.locks,
            8,
            false,
        );
        assert!(matches!(result, Plan::Blocked { .. }));
    }

    #[test]
    fn done_when_nothing_pending() {
        let mut f = fixture(&[("001", "A", &[], &[])]);
        f.state.tasks.get_mut("001").unwrap().status = TaskStatus::Complete;
        assert!(matches!(plan_of(&f, 8), Plan::Done));
    }

    #[test]
    fn stalled_when_internal_dep_failed() {
        let mut f = fixture(&[("001", "A", &[], &[]), ("002", "B", &["001"], &[])]);
        f.state.tasks.get_mut("001").unwrap().status = TaskStatus::Failed;
        let Plan::Stalled { task_ids } = plan_of(&f, 8) else {
            panic!("expected stalled");
        };
        assert_eq!(task_ids, vec!["002"]);
    }

    #[test]
    fn validated_tasks_are_not_readmitted() {
        let mut f = fixture(&[("001", "A", &[], &[]), ("002", "B", &[], &[])]);
        f.state.tasks.get_mut("001").unwrap().status = TaskStatus::Validated;
        let Plan::Batch { task_ids, .. } = plan_of(&f, 8) else {
            panic!("expected a batch");
        };
        assert_eq!(task_ids, vec!["002"]);
    }
}

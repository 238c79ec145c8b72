//! Task catalog.
//!
//! Discovers task specs on disk, validates their manifests, assigns a stable
//! ordering, and moves task directories between stage buckets. Two layouts
//! are supported: the staged layout (`backlog/`, `active/`, `archive/<run_id>/`)
//! and a flat legacy layout where every task directory sits directly under
//! the tasks root.

use mycelium_core::fingerprint;
use mycelium_core::manifest::ManifestError;
use mycelium_core::types::compare_task_ids;
use mycelium_core::{TaskManifest, TaskStage, TasksLayout};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const SPEC_FILE: &str = "spec.md";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("task {task_id}: {source}")]
    Manifest {
        task_id: String,
        source: ManifestError,
    },
    #[error("task directory missing {MANIFEST_FILE}: {0}")]
    MissingManifest(PathBuf),
    #[error("task directory missing {SPEC_FILE}: {0}")]
    MissingSpec(PathBuf),
    #[error("duplicate task id: {0}")]
    DuplicateTask(String),
    #[error("dependency cycle involving tasks: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),
    #[error("invalid fingerprint input for task {task_id}: {source}")]
    Fingerprint {
        task_id: String,
        source: fingerprint::FingerprintError,
    },
    #[error("archived task not found: {task_id} under {}", .dir.display())]
    ArchivedTaskNotFound { task_id: String, dir: PathBuf },
}

pub type Result<T> = std::result::Result<T, CatalogError>;

/// A discovered task: manifest, raw file contents, and placement.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub task_id: String,
    pub slug: String,
    pub stage: TaskStage,
    pub dir: PathBuf,
    pub manifest: TaskManifest,
    /// Raw `manifest.json` contents, kept for fingerprinting.
    pub manifest_raw: String,
    /// Raw `spec.md` contents.
    pub spec: String,
    pub fingerprint: String,
}

impl TaskSpec {
    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    pub fn spec_path(&self) -> PathBuf {
        self.dir.join(SPEC_FILE)
    }
}

/// Result of a catalog scan: ordered tasks plus collected errors.
#[derive(Debug)]
pub struct CatalogLoad {
    pub tasks: Vec<TaskSpec>,
    pub errors: Vec<CatalogError>,
}

/// Scans and mutates the tasks directory of one repository.
#[derive(Debug, Clone)]
pub struct Catalog {
    layout: TasksLayout,
}

impl Catalog {
    pub fn new(tasks_root: impl Into<PathBuf>) -> Self {
        Self {
            layout: TasksLayout::new(tasks_root),
        }
    }

    pub fn layout(&self) -> &TasksLayout {
        &self.layout
    }

    /// Scan the tasks directory.
    ///
    /// In strict mode the first error aborts the scan; otherwise errors are
    /// collected and the surviving tasks returned. Archived tasks are
    /// excluded from the scan (they are inputs to ledger import only).
    pub fn load(
        &self,
        known_resources: Option<&BTreeSet<String>>,
        strict: bool,
    ) -> Result<CatalogLoad> {
        let mut tasks: BTreeMap<String, TaskSpec> = BTreeMap::new();
        let mut errors = Vec::new();

        let buckets: Vec<(PathBuf, TaskStage)> = if self.layout.is_staged() {
            vec![
                (self.layout.backlog_dir(), TaskStage::Backlog),
                (self.layout.active_dir(), TaskStage::Active),
            ]
        } else {
            vec![(self.layout.root().to_path_buf(), TaskStage::Legacy)]
        };

        for (dir, stage) in buckets {
            if !dir.is_dir() {
                continue;
            }
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                let task_dir = entry.path();
                if !task_dir.join(MANIFEST_FILE).is_file() {
                    // Not a task directory; skip silently in legacy roots
                    // where planning files may live alongside tasks.
                    debug!(dir = %task_dir.display(), "skipping non-task directory");
                    continue;
                }
                match self.load_task_dir(&task_dir, stage, known_resources) {
                    Ok(task) => {
                        if tasks.contains_key(&task.task_id) {
                            let err = CatalogError::DuplicateTask(task.task_id.clone());
                            if strict {
                                return Err(err);
                            }
                            errors.push(err);
                        } else {
                            tasks.insert(task.task_id.clone(), task);
                        }
                    }
                    Err(err) => {
                        if strict {
                            return Err(err);
                        }
                        warn!(dir = %task_dir.display(), error = %err, "skipping invalid task");
                        errors.push(err);
                    }
                }
            }
        }

        if let Err(err) = check_dependency_cycles(&tasks) {
            if strict {
                return Err(err);
            }
            errors.push(err);
        }

        let mut ordered: Vec<TaskSpec> = tasks.into_values().collect();
        ordered.sort_by(|a, b| compare_task_ids(&a.task_id, &b.task_id));

        Ok(CatalogLoad {
            tasks: ordered,
            errors,
        })
    }

    /// Load one task directory (`<id>-<slug>` or bare `<id>`).
    fn load_task_dir(
        &self,
        task_dir: &Path,
        stage: TaskStage,
        known_resources: Option<&BTreeSet<String>>,
    ) -> Result<TaskSpec> {
        let dir_name = task_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let task_id = dir_name
            .split_once('-')
            .map_or(dir_name.as_str(), |(id, _)| id)
            .to_string();

        let manifest_path = task_dir.join(MANIFEST_FILE);
        let spec_path = task_dir.join(SPEC_FILE);
        if !manifest_path.is_file() {
            return Err(CatalogError::MissingManifest(task_dir.to_path_buf()));
        }
        if !spec_path.is_file() {
            return Err(CatalogError::MissingSpec(task_dir.to_path_buf()));
        }

        let manifest_raw = std::fs::read_to_string(&manifest_path)?;
        let spec = std::fs::read_to_string(&spec_path)?;

        let manifest = TaskManifest::parse(&manifest_raw).map_err(|source| {
            CatalogError::Manifest {
                task_id: task_id.clone(),
                source,
            }
        })?;

        if let Some(err) = manifest
            .validate(&task_id, known_resources)
            .into_iter()
            .next()
        {
            return Err(CatalogError::Manifest {
                task_id,
                source: err,
            });
        }

        let fp = fingerprint::fingerprint(&manifest_raw, &spec).map_err(|source| {
            CatalogError::Fingerprint {
                task_id: task_id.clone(),
                source,
            }
        })?;

        let slug = manifest.slug();
        Ok(TaskSpec {
            task_id,
            slug,
            stage,
            dir: task_dir.to_path_buf(),
            manifest,
            manifest_raw,
            spec,
            fingerprint: fp,
        })
    }

    /// Move a task directory to another stage bucket. Returns the new path.
    ///
    /// `run_id` is required for moves into `archive`.
    pub fn move_stage(
        &self,
        task_dir: &Path,
        to: TaskStage,
        run_id: Option<&str>,
    ) -> Result<PathBuf> {
        let dir_name = task_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let target_parent = match to {
            TaskStage::Backlog => self.layout.backlog_dir(),
            TaskStage::Active => self.layout.active_dir(),
            TaskStage::Archive => self.layout.archive_dir(run_id.unwrap_or("unknown")),
            TaskStage::Legacy => self.layout.root().to_path_buf(),
        };
        std::fs::create_dir_all(&target_parent)?;
        let target = target_parent.join(dir_name);
        if target == task_dir {
            return Ok(target);
        }
        std::fs::rename(task_dir, &target)?;
        Ok(target)
    }

    /// Find an archived task directory for a run: `archive/<run_id>/<id>-*`
    /// first, then anywhere nested under the archive run directory.
    pub fn find_archived(&self, run_id: &str, task_id: &str) -> Result<PathBuf> {
        let archive_dir = self.layout.archive_dir(run_id);
        if let Some(found) = find_task_dir_shallow(&archive_dir, task_id)? {
            return Ok(found);
        }
        if let Some(found) = find_task_dir_nested(&archive_dir, task_id)? {
            return Ok(found);
        }
        Err(CatalogError::ArchivedTaskNotFound {
            task_id: task_id.to_string(),
            dir: archive_dir,
        })
    }
}

fn dir_matches_task(name: &str, task_id: &str) -> bool {
    name == task_id || name.starts_with(&format!("{task_id}-"))
}

fn find_task_dir_shallow(dir: &Path, task_id: &str) -> Result<Option<PathBuf>> {
    if !dir.is_dir() {
        return Ok(None);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if dir_matches_task(&name, task_id) && entry.path().join(MANIFEST_FILE).is_file() {
            return Ok(Some(entry.path()));
        }
    }
    Ok(None)
}

fn find_task_dir_nested(dir: &Path, task_id: &str) -> Result<Option<PathBuf>> {
    if !dir.is_dir() {
        return Ok(None);
    }
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let path = entry.path();
            if dir_matches_task(&name, task_id) && path.join(MANIFEST_FILE).is_file() {
                return Ok(Some(path));
            }
            stack.push(path);
        }
    }
    Ok(None)
}

/// Reject dependency cycles among the discovered tasks. External deps
/// (ids not present in the scan) are ignored here; the scheduler resolves
/// them through the ledger.
fn check_dependency_cycles(tasks: &BTreeMap<String, TaskSpec>) -> Result<()> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    let mut marks: BTreeMap<&str, Mark> =
        tasks.keys().map(|id| (id.as_str(), Mark::Unvisited)).collect();

    fn visit<'a>(
        id: &'a str,
        tasks: &'a BTreeMap<String, TaskSpec>,
        marks: &mut BTreeMap<&'a str, Mark>,
        path: &mut Vec<String>,
    ) -> Result<()> {
        match marks.get(id).copied() {
            Some(Mark::Done) | None => return Ok(()),
            Some(Mark::InProgress) => {
                let mut cycle = path.clone();
                cycle.push(id.to_string());
                return Err(CatalogError::DependencyCycle(cycle));
            }
            Some(Mark::Unvisited) => {}
        }
        marks.insert(id, Mark::InProgress);
        path.push(id.to_string());
        if let Some(task) = tasks.get(id) {
            for dep in &task.manifest.dependencies {
                if tasks.contains_key(dep) {
                    visit(dep.as_str(), tasks, marks, path)?;
                }
            }
        }
        path.pop();
        marks.insert(id, Mark::Done);
        Ok(())
    }

    let ids: Vec<&str> = tasks.keys().map(String::as_str).collect();
    for id in ids {
        let mut path = Vec::new();
        visit(id, tasks, &mut marks, &mut path)?;
    }
    Ok(())
}

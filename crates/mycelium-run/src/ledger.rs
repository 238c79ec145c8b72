//! Cross-run ledger.
//!
//! One JSON document per project mapping task ids to completed-task
//! fingerprints. Later runs consult it to satisfy external dependencies
//! without re-executing work. Writes go through the atomic-replace helper so
//! a crash mid-save can never corrupt the ledger.

use crate::catalog::{Catalog, CatalogError, MANIFEST_FILE, SPEC_FILE};
use crate::state::atomic_write_json;
use chrono::Utc;
use mycelium_core::fingerprint;
use mycelium_core::types::{Ledger, LedgerEntry, LedgerSource, LedgerStatus, RunState, TaskStatus};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("state error: {0}")]
    State(#[from] crate::state::StateError),
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("fingerprint error: {0}")]
    Fingerprint(#[from] fingerprint::FingerprintError),
}

pub type Result<T> = std::result::Result<T, LedgerError>;

/// Why a task was skipped during an import.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SkippedImport {
    pub task_id: String,
    pub reason: String,
}

/// Result of `import_from_run_state`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ImportSummary {
    pub imported: usize,
    pub skipped: usize,
    pub skipped_details: Vec<SkippedImport>,
}

/// Loads and persists the per-project ledger document.
#[derive(Debug, Clone)]
pub struct LedgerStore {
    path: PathBuf,
}

impl LedgerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the ledger; a missing file is an empty ledger.
    pub fn load(&self) -> Result<Ledger> {
        if !self.path.is_file() {
            return Ok(Ledger::default());
        }
        let content = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, ledger: &Ledger) -> Result<()> {
        Ok(atomic_write_json(&self.path, ledger)?)
    }

    /// Insert or replace an entry and persist.
    pub fn upsert_entry(&self, ledger: &mut Ledger, entry: LedgerEntry) -> Result<()> {
        debug!(task_id = %entry.task_id, status = entry.status.as_str(), "upserting ledger entry");
        ledger.entries.insert(entry.task_id.clone(), entry);
        self.save(ledger)
    }

    /// Walk a completed run's task states and record every task whose batch
    /// passed the integration doctor. Fingerprints are recomputed from the
    /// archived task directories, so the entries reflect what actually ran.
    pub fn import_from_run_state(
        &self,
        state: &RunState,
        catalog: &Catalog,
    ) -> Result<ImportSummary> {
        let mut ledger = self.load()?;
        let mut imported = 0usize;
        let mut skipped_details = Vec::new();

        for (task_id, task) in &state.tasks {
            if task.status != TaskStatus::Complete {
                skipped_details.push(SkippedImport {
                    task_id: task_id.clone(),
                    reason: format!("task status is {}", task.status.as_str()),
                });
                continue;
            }

            let batch = task
                .batch_id
                .and_then(|id| state.batches.iter().find(|b| b.batch_id == id));
            let Some(batch) = batch else {
                skipped_details.push(SkippedImport {
                    task_id: task_id.clone(),
                    reason: "no batch recorded for task".to_string(),
                });
                continue;
            };
            if batch.integration_doctor_passed != Some(true) {
                skipped_details.push(SkippedImport {
                    task_id: task_id.clone(),
                    reason: "integration doctor did not pass".to_string(),
                });
                continue;
            }

            let fp = match archived_fingerprint(catalog, &state.run_id, task_id) {
                Ok(fp) => fp,
                Err(err) => {
                    skipped_details.push(SkippedImport {
                        task_id: task_id.clone(),
                        reason: err.to_string(),
                    });
                    continue;
                }
            };

            ledger.entries.insert(
                task_id.clone(),
                LedgerEntry {
                    task_id: task_id.clone(),
                    status: LedgerStatus::Complete,
                    fingerprint: fp,
                    merge_commit: batch.merge_commit.clone(),
                    integration_doctor_passed: batch.integration_doctor_passed,
                    completed_at: batch.completed_at.or_else(|| Some(Utc::now())),
                    run_id: Some(state.run_id.clone()),
                    source: LedgerSource::ImportRun,
                },
            );
            imported += 1;
        }

        self.save(&ledger)?;
        info!(
            run_id = %state.run_id,
            imported,
            skipped = skipped_details.len(),
            "ledger import complete"
        );
        Ok(ImportSummary {
            imported,
            skipped: skipped_details.len(),
            skipped_details,
        })
    }
}

/// Fingerprint of an archived task under `archive/<run_id>/`.
pub fn archived_fingerprint(catalog: &Catalog, run_id: &str, task_id: &str) -> Result<String> {
    let dir = catalog.find_archived(run_id, task_id)?;
    let manifest_raw = std::fs::read_to_string(dir.join(MANIFEST_FILE))?;
    let spec = std::fs::read_to_string(dir.join(SPEC_FILE))?;
    Ok(fingerprint::fingerprint(&manifest_raw, &spec)?)
}

/// Current on-disk fingerprint of an external dependency.
///
/// The dependency's producing run archived its directory, so look there
/// first (via the ledger entry's `run_id`); a dep still sitting in
/// backlog/active is found through the caller's catalog load instead.
pub fn external_dep_fingerprint(
    catalog: &Catalog,
    ledger: &Ledger,
    dep_id: &str,
) -> Option<String> {
    let entry = ledger.entries.get(dep_id)?;
    let run_id = entry.run_id.as_deref()?;
    archived_fingerprint(catalog, run_id, dep_id).ok()
}

//! Durable run state and event logs.
//!
//! Run state is one JSON document per run, replaced atomically on every save
//! so a crash can never leave a torn file. Event logs are append-only JSONL,
//! one event per line, LF-terminated, with a byte-cursor reader that never
//! advances past a partial trailing line.

use chrono::{Duration, Utc};
use globset::{Glob, GlobMatcher};
use mycelium_core::types::RunHistoryEntry;
use mycelium_core::{EventRecord, MyceliumHome, RunState, RunStatus};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StateError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("run not found: {0}")]
    RunNotFound(String),
    #[error("invalid event type filter: {0}")]
    InvalidFilter(#[from] globset::Error),
}

pub type Result<T> = std::result::Result<T, StateError>;

/// Write a JSON document atomically: unique temp sibling, fsync, rename,
/// best-effort fsync of the parent directory.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;

    let tmp = parent.join(format!(
        ".{}.tmp-{}",
        path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default(),
        uuid::Uuid::now_v7()
    ));

    {
        let mut file = File::create(&tmp)?;
        let body = serde_json::to_vec_pretty(value)?;
        file.write_all(&body)?;
        file.write_all(b"\n")?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    if let Ok(dir) = File::open(parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}

/// Per-project store for run state documents and the history index.
#[derive(Debug, Clone)]
pub struct StateStore {
    home: MyceliumHome,
    project: String,
}

impl StateStore {
    pub fn new(home: MyceliumHome, project: impl Into<String>) -> Self {
        Self {
            home,
            project: project.into(),
        }
    }

    pub fn home(&self) -> &MyceliumHome {
        &self.home
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn run_state_path(&self, run_id: &str) -> PathBuf {
        self.home.run_state_path(&self.project, run_id)
    }

    /// Persist a run state document. Bumps `updated_at` first.
    pub fn save(&self, state: &mut RunState) -> Result<()> {
        state.touch();
        atomic_write_json(&self.run_state_path(&state.run_id), state)
    }

    pub fn load(&self, run_id: &str) -> Result<RunState> {
        let path = self.run_state_path(run_id);
        if !path.is_file() {
            return Err(StateError::RunNotFound(run_id.to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Enumerate runs newest-first, demoting stale `running` runs to `paused`.
    ///
    /// A run is stale when its `updated_at` is older than `stale_after`; the
    /// demotion is persisted so later readers agree. The history index is
    /// rebuilt from the state files on every enumeration, which also covers
    /// the missing-index case.
    pub fn list_runs(&self, stale_after: Duration) -> Result<Vec<RunHistoryEntry>> {
        let state_dir = self.home.state_dir(&self.project);
        let mut entries = Vec::new();
        if state_dir.is_dir() {
            for entry in std::fs::read_dir(&state_dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().to_string();
                if !name.starts_with("run-") || !name.ends_with(".json") {
                    continue;
                }
                let content = std::fs::read_to_string(entry.path())?;
                let mut state: RunState = match serde_json::from_str(&content) {
                    Ok(state) => state,
                    Err(err) => {
                        warn!(file = %entry.path().display(), error = %err, "skipping unreadable run state");
                        continue;
                    }
                };

                if state.status == RunStatus::Running
                    && Utc::now() - state.updated_at > stale_after
                {
                    debug!(run_id = %state.run_id, "demoting stale running run to paused");
                    state.status = RunStatus::Paused;
                    state.stop_reason = Some("stale".to_string());
                    self.save(&mut state)?;
                }

                entries.push(RunHistoryEntry {
                    run_id: state.run_id.clone(),
                    status: state.status,
                    started_at: state.started_at,
                    updated_at: state.updated_at,
                    task_count: state.tasks.len(),
                    tokens_used: state.tokens_used,
                    estimated_cost: state.estimated_cost,
                });
            }
        }

        entries.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        atomic_write_json(&self.home.history_path(&self.project), &entries)?;
        Ok(entries)
    }

    /// The most recently started run, if any.
    pub fn latest_run_id(&self, stale_after: Duration) -> Result<Option<String>> {
        Ok(self
            .list_runs(stale_after)?
            .into_iter()
            .next()
            .map(|e| e.run_id))
    }

    pub fn orchestrator_log(&self, run_id: &str) -> EventLog {
        EventLog::new(self.home.orchestrator_log_path(&self.project, run_id))
    }

    pub fn task_log(&self, run_id: &str, task_id: &str, slug: &str) -> EventLog {
        EventLog::new(self.home.task_log_path(&self.project, run_id, task_id, slug))
    }

    pub fn validator_log(&self, run_id: &str, name: &str) -> EventLog {
        EventLog::new(self.home.validator_log_path(&self.project, run_id, name))
    }
}

/// Append-only JSONL writer. One writer per log file; events for a given
/// task are written in causal order by that task's writer.
#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, event: &EventRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut line = event.to_json_line()?;
        line.push('\n');
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}

/// One page of events read from a JSONL log.
#[derive(Debug)]
pub struct JsonlPage {
    pub events: Vec<EventRecord>,
    /// Byte offset to pass as the next cursor. Never points into a line.
    pub next_cursor: u64,
    /// True when `max_bytes` stopped the read before the end of file.
    pub truncated: bool,
}

/// Read events strictly after `cursor` (a byte offset).
///
/// The returned cursor only ever lands on line boundaries; a partial trailing
/// line (no LF yet) is left for the next read. `max_bytes` caps how much is
/// consumed and truncates on a line boundary. `type_glob` filters by event
/// type after decoding, so filtering never affects cursor math.
pub fn read_jsonl_from_cursor(
    path: &Path,
    cursor: u64,
    max_bytes: Option<u64>,
    type_glob: Option<&str>,
) -> Result<JsonlPage> {
    let matcher: Option<GlobMatcher> = match type_glob {
        Some(pattern) => Some(Glob::new(pattern)?.compile_matcher()),
        None => None,
    };

    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(JsonlPage {
                events: Vec::new(),
                next_cursor: cursor,
                truncated: false,
            });
        }
        Err(err) => return Err(err.into()),
    };

    let len = file.metadata()?.len();
    if cursor >= len {
        return Ok(JsonlPage {
            events: Vec::new(),
            next_cursor: cursor,
            truncated: false,
        });
    }

    file.seek(SeekFrom::Start(cursor))?;
    let mut buf = Vec::with_capacity((len - cursor) as usize);
    file.read_to_end(&mut buf)?;

    let mut events = Vec::new();
    let mut consumed = 0usize;
    let mut truncated = false;

    let mut line_start = 0usize;
    while let Some(offset) = buf[line_start..].iter().position(|&b| b == b'\n') {
        let line_end = line_start + offset + 1;
        if let Some(cap) = max_bytes {
            if line_end as u64 > cap {
                if consumed > 0 {
                    truncated = true;
                    break;
                }
                // First line alone exceeds the cap: return it anyway so the
                // reader always makes progress, then report truncation.
                truncated = line_end < buf.len();
            }
        }

        let line = &buf[line_start..line_end - 1];
        consumed = line_end;
        if !line.is_empty() {
            match serde_json::from_slice::<EventRecord>(line) {
                Ok(event) => {
                    let keep = matcher
                        .as_ref()
                        .is_none_or(|m| m.is_match(event.event_type.as_str()));
                    if keep {
                        events.push(event);
                    }
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping undecodable event line");
                }
            }
        }

        line_start = line_end;
        if let Some(cap) = max_bytes {
            if consumed as u64 >= cap {
                truncated = line_start < buf.len();
                break;
            }
        }
    }

    Ok(JsonlPage {
        events,
        next_cursor: cursor + consumed as u64,
        truncated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mycelium_core::events::event_types;
    use tempfile::TempDir;

    fn store() -> (TempDir, StateStore) {
        let dir = TempDir::new().unwrap();
        let home = MyceliumHome::new(dir.path());
        (dir, StateStore::new(home, "demo"))
    }

    fn sample_state(run_id: &str) -> RunState {
        RunState::new(run_id.into(), "demo".into(), "/repo".into(), "main".into())
    }

    #[test]
    fn save_and_load_round_trip() {
        let (_dir, store) = store();
        let mut state = sample_state("r1");
        store.save(&mut state).unwrap();

        let loaded = store.load("r1").unwrap();
        assert_eq!(loaded.run_id, "r1");
        assert_eq!(loaded.status, RunStatus::Running);
    }

    #[test]
    fn load_missing_run_is_an_error() {
        let (_dir, store) = store();
        assert!(matches!(
            store.load("ghost"),
            Err(StateError::RunNotFound(_))
        ));
    }

    #[test]
    fn atomic_write_leaves_no_temp_files() {
        let (_dir, store) = store();
        let mut state = sample_state("r1");
        store.save(&mut state).unwrap();
        store.save(&mut state).unwrap();

        let state_dir = store.home().state_dir("demo");
        let leftovers: Vec<_> = std::fs::read_dir(state_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn list_runs_sorts_newest_first_and_writes_history() {
        let (_dir, store) = store();
        let mut a = sample_state("aaa");
        a.started_at = Utc::now() - Duration::hours(2);
        store.save(&mut a).unwrap();
        let mut b = sample_state("bbb");
        store.save(&mut b).unwrap();

        let runs = store.list_runs(Duration::minutes(30)).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].run_id, "bbb");
        assert!(store.home().history_path("demo").is_file());
    }

    #[test]
    fn stale_running_runs_are_demoted_to_paused() {
        let (_dir, store) = store();
        let mut state = sample_state("old");
        store.save(&mut state).unwrap();

        // Rewind updated_at past the idle threshold, bypassing save()'s touch.
        state.updated_at = Utc::now() - Duration::hours(3);
        atomic_write_json(&store.run_state_path("old"), &state).unwrap();

        let runs = store.list_runs(Duration::minutes(30)).unwrap();
        assert_eq!(runs[0].status, RunStatus::Paused);
        assert_eq!(store.load("old").unwrap().status, RunStatus::Paused);
    }

    #[test]
    fn event_log_appends_lf_terminated_lines() {
        let (_dir, store) = store();
        let log = store.orchestrator_log("r1");
        log.append(&EventRecord::new(event_types::RUN_START, "r1"))
            .unwrap();
        log.append(&EventRecord::new(event_types::BATCH_START, "r1"))
            .unwrap();

        let content = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.ends_with('\n'));
    }

    #[test]
    fn cursor_reader_returns_lines_after_offset() {
        let (_dir, store) = store();
        let log = store.orchestrator_log("r1");
        log.append(&EventRecord::new(event_types::RUN_START, "r1"))
            .unwrap();

        let page = read_jsonl_from_cursor(log.path(), 0, None, None).unwrap();
        assert_eq!(page.events.len(), 1);
        assert!(!page.truncated);

        // Nothing new: cursor stays put.
        let page2 = read_jsonl_from_cursor(log.path(), page.next_cursor, None, None).unwrap();
        assert!(page2.events.is_empty());
        assert_eq!(page2.next_cursor, page.next_cursor);

        // New event appears after the cursor.
        log.append(&EventRecord::new(event_types::TASK_START, "r1"))
            .unwrap();
        let page3 = read_jsonl_from_cursor(log.path(), page.next_cursor, None, None).unwrap();
        assert_eq!(page3.events.len(), 1);
        assert_eq!(page3.events[0].event_type, "task.start");
    }

    #[test]
    fn cursor_never_advances_past_partial_trailing_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.jsonl");
        let full = EventRecord::new(event_types::RUN_START, "r1")
            .to_json_line()
            .unwrap();
        // A complete line followed by a partial one (no trailing LF).
        std::fs::write(&path, format!("{full}\n{{\"ts\":\"2026-01-01")).unwrap();

        let page = read_jsonl_from_cursor(&path, 0, None, None).unwrap();
        assert_eq!(page.events.len(), 1);
        assert_eq!(page.next_cursor as usize, full.len() + 1);

        // Completing the line makes it visible from the same cursor.
        let second = EventRecord::new(event_types::RUN_STOP, "r1")
            .to_json_line()
            .unwrap();
        std::fs::write(&path, format!("{full}\n{second}\n")).unwrap();
        let page2 = read_jsonl_from_cursor(&path, page.next_cursor, None, None).unwrap();
        assert_eq!(page2.events.len(), 1);
        assert_eq!(page2.events[0].event_type, "run.stop");
    }

    /// Event with a pinned timestamp so every serialized line has the same
    /// length (fractional seconds would otherwise vary per event).
    fn fixed_ts_event() -> EventRecord {
        let mut event = EventRecord::new(event_types::TASK_START, "r1");
        event.ts = chrono::DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        event
    }

    #[test]
    fn max_bytes_truncates_on_line_boundaries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.jsonl");
        let log = EventLog::new(&path);
        for _ in 0..5 {
            log.append(&fixed_ts_event()).unwrap();
        }
        let line_len = fixed_ts_event().to_json_line().unwrap().len() as u64 + 1;

        // Room for two lines plus change: must stop after a whole line.
        let page = read_jsonl_from_cursor(&path, 0, Some(line_len * 2 + 5), None).unwrap();
        assert_eq!(page.events.len(), 2);
        assert!(page.truncated);
        assert_eq!(page.next_cursor % line_len, 0);

        // Resume from the truncation point picks up the rest.
        let rest = read_jsonl_from_cursor(&path, page.next_cursor, None, None).unwrap();
        assert_eq!(rest.events.len(), 3);
        assert!(!rest.truncated);
    }

    #[test]
    fn type_glob_filters_without_moving_cursor_math() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.jsonl");
        let log = EventLog::new(&path);
        log.append(&EventRecord::new(event_types::TASK_START, "r1"))
            .unwrap();
        log.append(&EventRecord::new(event_types::CONTAINER_CREATE, "r1"))
            .unwrap();
        log.append(&EventRecord::new(event_types::TASK_RESET, "r1"))
            .unwrap();

        let unfiltered = read_jsonl_from_cursor(&path, 0, None, None).unwrap();
        let filtered = read_jsonl_from_cursor(&path, 0, None, Some("task.*")).unwrap();
        assert_eq!(filtered.events.len(), 2);
        assert!(filtered
            .events
            .iter()
            .all(|e| e.event_type.starts_with("task.")));
        // Filtering consumed the same bytes.
        assert_eq!(filtered.next_cursor, unfiltered.next_cursor);
    }

    #[test]
    fn reading_a_missing_log_is_empty_not_an_error() {
        let dir = TempDir::new().unwrap();
        let page =
            read_jsonl_from_cursor(&dir.path().join("absent.jsonl"), 0, None, None).unwrap();
        assert!(page.events.is_empty());
        assert_eq!(page.next_cursor, 0);
    }
}

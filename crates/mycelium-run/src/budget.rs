//! Budget tracking.
//!
//! Token and cost usage comes out of each task's event log: workers emit
//! `turn.completed` events whose payload carries a `usage` record. After an
//! attempt finishes the tracker aggregates per-attempt usage, rolls it into
//! the task and run totals, and checks the configured budgets.

use crate::state::read_jsonl_from_cursor;
use mycelium_core::config::{BudgetConfig, BudgetMode};
use mycelium_core::types::{AttemptUsage, RunState};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Flat cost model applied to total tokens.
pub const COST_PER_1K_TOKENS: f64 = 0.015;

/// Event type carrying usage records.
pub const USAGE_EVENT_TYPE: &str = "turn.completed";

#[derive(Debug, Error)]
pub enum BudgetError {
    #[error("state error: {0}")]
    State(#[from] crate::state::StateError),
}

pub type Result<T> = std::result::Result<T, BudgetError>;

/// One budget limit breach.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BudgetBreach {
    /// `task_tokens` or `run_cost`.
    pub limit: String,
    pub used: f64,
    pub max: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

fn usage_from_payload(payload: &Value) -> Option<AttemptUsage> {
    let usage = payload.get("usage")?;
    let input = usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0);
    let cached = usage
        .get("cached_input_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let output = usage
        .get("output_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let total = input + cached + output;
    Some(AttemptUsage {
        input_tokens: input,
        cached_input_tokens: cached,
        output_tokens: output,
        total_tokens: total,
        estimated_cost: (total as f64 / 1000.0) * COST_PER_1K_TOKENS,
    })
}

/// Aggregate per-attempt usage from a task's event log.
pub fn usage_from_task_log(path: &Path) -> Result<BTreeMap<u32, AttemptUsage>> {
    let page = read_jsonl_from_cursor(path, 0, None, Some(USAGE_EVENT_TYPE))?;
    let mut by_attempt: BTreeMap<u32, AttemptUsage> = BTreeMap::new();
    for event in page.events {
        let Some(payload) = event.payload.as_ref() else {
            continue;
        };
        let Some(usage) = usage_from_payload(payload) else {
            continue;
        };
        let attempt = payload
            .get("attempt")
            .and_then(Value::as_u64)
            .map_or(1, |a| a as u32);
        by_attempt.entry(attempt).or_default().add(&usage);
    }
    Ok(by_attempt)
}

/// Aggregates usage into run state and enforces budgets.
#[derive(Debug, Clone)]
pub struct BudgetTracker {
    config: BudgetConfig,
}

impl BudgetTracker {
    pub fn new(config: BudgetConfig) -> Self {
        Self { config }
    }

    pub fn mode(&self) -> BudgetMode {
        self.config.mode
    }

    /// Record a task's per-attempt usage and refresh task and run totals.
    pub fn apply_task_usage(
        &self,
        state: &mut RunState,
        task_id: &str,
        usage_by_attempt: BTreeMap<u32, AttemptUsage>,
    ) {
        if let Some(task) = state.tasks.get_mut(task_id) {
            let mut total = AttemptUsage::default();
            for usage in usage_by_attempt.values() {
                total.add(usage);
            }
            task.usage_by_attempt = usage_by_attempt;
            task.tokens_used = total.total_tokens;
            task.estimated_cost = total.estimated_cost;
        }

        let mut run_tokens = 0u64;
        let mut run_cost = 0f64;
        for task in state.tasks.values() {
            run_tokens += task.tokens_used;
            run_cost += task.estimated_cost;
        }
        state.tokens_used = run_tokens;
        state.estimated_cost = run_cost;
        debug!(task_id, run_tokens, run_cost, "usage applied");
    }

    /// Check the per-task and per-run budgets. Empty when within limits.
    pub fn check(&self, state: &RunState, task_id: &str) -> Vec<BudgetBreach> {
        let mut breaches = Vec::new();

        if let (Some(max_tokens), Some(task)) =
            (self.config.max_tokens_per_task, state.tasks.get(task_id))
        {
            if task.tokens_used > max_tokens {
                breaches.push(BudgetBreach {
                    limit: "task_tokens".to_string(),
                    used: task.tokens_used as f64,
                    max: max_tokens as f64,
                    task_id: Some(task_id.to_string()),
                });
            }
        }

        if let Some(max_cost) = self.config.max_cost_per_run {
            if state.estimated_cost > max_cost {
                breaches.push(BudgetBreach {
                    limit: "run_cost".to_string(),
                    used: state.estimated_cost,
                    max: max_cost,
                    task_id: None,
                });
            }
        }

        breaches
    }

    /// Rebuild all usage from task event logs. Used when prior state is
    /// absent or suspect (e.g. recovering from a crash mid-run).
    pub fn backfill(&self, state: &mut RunState) -> Result<()> {
        let task_ids: Vec<String> = state.tasks.keys().cloned().collect();
        for task_id in task_ids {
            let Some(logs_dir) = state
                .tasks
                .get(&task_id)
                .and_then(|t| t.logs_dir.clone())
            else {
                continue;
            };
            let log_path = Path::new(&logs_dir).join("events.jsonl");
            let usage = usage_from_task_log(&log_path)?;
            if !usage.is_empty() {
                self.apply_task_usage(state, &task_id, usage);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::EventLog;
    use mycelium_core::types::TaskState;
    use mycelium_core::EventRecord;
    use serde_json::json;
    use tempfile::TempDir;

    fn usage_event(attempt: u32, input: u64, cached: u64, output: u64) -> EventRecord {
        EventRecord::new(USAGE_EVENT_TYPE, "run-1")
            .with_task("001")
            .with_payload(json!({
                "attempt": attempt,
                "usage": {
                    "input_tokens": input,
                    "cached_input_tokens": cached,
                    "output_tokens": output,
                }
            }))
    }

    fn state_with_task(task_id: &str) -> RunState {
        let mut state = RunState::new(
            "run-1".into(),
            "demo".into(),
            "/repo".into(),
            "main".into(),
        );
        state.tasks.insert(task_id.into(), TaskState::default());
        state
    }

    #[test]
    fn aggregates_usage_per_attempt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.jsonl");
        let log = EventLog::new(&path);
        log.append(&usage_event(1, 100, 50, 30)).unwrap();
        log.append(&usage_event(1, 10, 0, 5)).unwrap();
        log.append(&usage_event(2, 200, 0, 40)).unwrap();
        // Non-usage events are ignored.
        log.append(&EventRecord::new("task.start", "run-1")).unwrap();

        let by_attempt = usage_from_task_log(&path).unwrap();
        assert_eq!(by_attempt.len(), 2);
        assert_eq!(by_attempt[&1].input_tokens, 110);
        assert_eq!(by_attempt[&1].total_tokens, 195);
        assert_eq!(by_attempt[&2].total_tokens, 240);
        let expected = (195.0 / 1000.0) * COST_PER_1K_TOKENS;
        assert!((by_attempt[&1].estimated_cost - expected).abs() < 1e-9);
    }

    #[test]
    fn missing_log_yields_no_usage() {
        let dir = TempDir::new().unwrap();
        let by_attempt = usage_from_task_log(&dir.path().join("absent.jsonl")).unwrap();
        assert!(by_attempt.is_empty());
    }

    #[test]
    fn apply_task_usage_updates_task_and_run_totals() {
        let tracker = BudgetTracker::new(BudgetConfig::default());
        let mut state = state_with_task("001");
        state.tasks.insert("002".into(), TaskState::default());

        let mut usage = BTreeMap::new();
        usage.insert(
            1,
            AttemptUsage {
                input_tokens: 100,
                cached_input_tokens: 0,
                output_tokens: 100,
                total_tokens: 200,
                estimated_cost: 0.003,
            },
        );
        tracker.apply_task_usage(&mut state, "001", usage);

        assert_eq!(state.tasks["001"].tokens_used, 200);
        assert_eq!(state.tokens_used, 200);
        assert!((state.estimated_cost - 0.003).abs() < 1e-9);

        // Applying a second task adds to run totals.
        let mut usage = BTreeMap::new();
        usage.insert(
            1,
            AttemptUsage {
                input_tokens: 0,
                cached_input_tokens: 0,
                output_tokens: 50,
                total_tokens: 50,
                estimated_cost: 0.00075,
            },
        );
        tracker.apply_task_usage(&mut state, "002", usage);
        assert_eq!(state.tokens_used, 250);
    }

    #[test]
    fn task_token_budget_breach_is_reported() {
        let tracker = BudgetTracker::new(BudgetConfig {
            max_tokens_per_task: Some(100),
            max_cost_per_run: None,
            mode: BudgetMode::Block,
        });
        let mut state = state_with_task("001");
        state.tasks.get_mut("001").unwrap().tokens_used = 150;

        let breaches = tracker.check(&state, "001");
        assert_eq!(breaches.len(), 1);
        assert_eq!(breaches[0].limit, "task_tokens");
        assert_eq!(breaches[0].task_id.as_deref(), Some("001"));

        state.tasks.get_mut("001").unwrap().tokens_used = 100;
        assert!(tracker.check(&state, "001").is_empty());
    }

    #[test]
    fn run_cost_budget_breach_is_reported() {
        let tracker = BudgetTracker::new(BudgetConfig {
            max_tokens_per_task: None,
            max_cost_per_run: Some(1.0),
            mode: BudgetMode::Warn,
        });
        let mut state = state_with_task("001");
        state.estimated_cost = 1.5;

        let breaches = tracker.check(&state, "001");
        assert_eq!(breaches.len(), 1);
        assert_eq!(breaches[0].limit, "run_cost");
        assert!(breaches[0].task_id.is_none());
    }

    #[test]
    fn backfill_rebuilds_usage_from_logs() {
        let dir = TempDir::new().unwrap();
        let logs_dir = dir.path().join("tasks/001-alpha");
        let log = EventLog::new(logs_dir.join("events.jsonl"));
        log.append(&usage_event(1, 500, 0, 500)).unwrap();

        let tracker = BudgetTracker::new(BudgetConfig::default());
        let mut state = state_with_task("001");
        state.tasks.get_mut("001").unwrap().logs_dir =
            Some(logs_dir.to_string_lossy().to_string());

        tracker.backfill(&mut state).unwrap();
        assert_eq!(state.tasks["001"].tokens_used, 1000);
        assert_eq!(state.tokens_used, 1000);
    }
}

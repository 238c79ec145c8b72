pub mod config;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod layout;
pub mod manifest;
pub mod types;

pub use config::{
    BudgetMode, CleanupPolicy, EnforcementMode, LockMode, RunConfig, TaskFailurePolicy,
};
pub use error::UserError;
pub use events::EventRecord;
pub use layout::{MyceliumHome, TasksLayout};
pub use manifest::{slugify, TaskManifest};
pub use types::{
    compare_task_ids, new_run_id, AttemptUsage, BatchState, BatchStatus, CheckpointCommit, Ledger,
    LedgerEntry, LedgerSource, LedgerStatus, RunState, RunStatus, TaskStage, TaskState, TaskStatus,
    TddMode,
};

//! mycelium-run - the run engine.
//!
//! Executes a planned set of engineering tasks against a target repository:
//! batches tasks under resource locks and dependency constraints, dispatches
//! each to an isolated worker, merges successful tasks into the integration
//! branch, and verifies the integration stays healthy. State is durable and
//! every run is stoppable and resumable.

pub mod budget;
pub mod catalog;
pub mod doctor;
pub mod engine;
pub mod ledger;
pub mod policy;
pub mod scheduler;
pub mod state;
pub mod vcs;
pub mod workspace;
pub mod worker;

pub use engine::{RunEngine, RunOutcome};

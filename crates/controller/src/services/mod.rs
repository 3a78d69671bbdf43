//! Orchestration services over the execution and delivery engines.

pub mod approval;
pub mod build;
pub mod deploy;
pub mod models;
pub mod store;
pub mod tracking;
pub mod workflow;

/// Allocation attempts before a run-number conflict is returned.
pub const RUN_NUMBER_ATTEMPTS: u32 = 3;

pub use approval::ApprovalService;
pub use build::{BuildService, TriggerBuild};
pub use deploy::{DeployService, UpdateDeployConfig};
pub use store::{ApprovalStore, BuildStore, DeployStore, MemoryStore, WorkflowStore};
pub use tracking::{run_status_pump, status_channel, RunOwner, RunTracker, StatusUpdate};
pub use workflow::{TriggerWorkflow, WorkflowService};

//! Persisted records owned by the orchestration services.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use crate::crd::RunPhase as RunState;

/// How a build's image tag is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TagStrategy {
    #[default]
    BranchCommit,
    Timestamp,
    Latest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    #[default]
    Manual,
    Webhook,
    Cron,
    Api,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BuildConfig {
    pub id: String,
    pub project_id: String,
    pub service_id: String,
    pub name: String,
    /// System template supplying the build image and default script.
    pub template: Option<String>,
    pub repo_url: String,
    pub branch: String,
    pub build_env: BTreeMap<String, String>,
    pub build_script: String,
    pub dockerfile_path: String,
    pub docker_context: String,
    pub image_repo: String,
    pub tag_strategy: TagStrategy,
    pub cache_enabled: bool,
    pub variables: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRun {
    pub id: String,
    pub build_config_id: String,
    pub run_number: u32,
    pub status: RunState,
    pub branch: String,
    pub commit_sha: String,
    pub commit_message: String,
    pub image_tag: String,
    /// Name of the submitted `TaskRun`.
    pub execution_ref: Option<String>,
    pub triggered_by: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Workflow {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub description: String,
    pub trigger_type: TriggerType,
    /// For webhook triggers: `repo_url` and optionally `branch`.
    pub trigger_config: BTreeMap<String, String>,
    pub enabled: bool,
    pub stages: Vec<WorkflowStage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WorkflowStage {
    pub id: String,
    pub name: String,
    pub stage_type: String,
    pub sort_order: i32,
    pub parallel: bool,
    pub enabled: bool,
    pub jobs: Vec<StageJob>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StageJob {
    pub id: String,
    pub name: String,
    pub job_type: String,
    pub sort_order: i32,
    pub config: Map<String, Value>,
    pub timeout_secs: u32,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: String,
    pub workflow_id: String,
    pub run_number: u32,
    pub status: RunState,
    pub trigger_type: TriggerType,
    pub triggered_by: String,
    pub input_params: BTreeMap<String, String>,
    /// Name of the submitted `PipelineRun`.
    pub execution_ref: Option<String>,
    pub error_message: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPolicy {
    #[default]
    Manual,
    Auto,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DeployConfig {
    pub id: String,
    pub project_id: String,
    pub service_id: String,
    pub environment_id: String,
    pub name: String,
    pub deploy_type: String,
    pub repo_url: String,
    pub target_revision: String,
    pub chart_path: String,
    pub values_override: BTreeMap<String, Value>,
    pub sync_policy: SyncPolicy,
    pub auto_sync: bool,
    pub self_heal: bool,
    pub prune: bool,
    pub argo_app_name: String,
    /// Destination namespace.
    pub namespace: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryStatus {
    #[default]
    Pending,
    Syncing,
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployHistory {
    pub id: String,
    pub deploy_config_id: String,
    pub revision: String,
    pub status: HistoryStatus,
    pub sync_status: String,
    pub health_status: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_secs: i64,
    pub triggered_by: String,
    pub rollback_from: Option<String>,
    /// Set only when the GitOps write succeeded.
    pub gitops_commit: Option<String>,
    pub error_message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub id: String,
    pub deploy_history_id: String,
    pub environment_id: String,
    pub requested_by: String,
    pub approver_id: Option<String>,
    pub status: ApprovalStatus,
    pub comment: String,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

/// Whole seconds between `started` and `finished`, if the run started.
#[must_use]
pub fn elapsed_secs(started: Option<DateTime<Utc>>, finished: DateTime<Utc>) -> Option<i64> {
    started.map(|s| (finished - s).num_seconds().max(0))
}

#[must_use]
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

//! Storage seams for run, history, and approval records.
//!
//! Run inserts enforce uniqueness of `(parent, run_number)` and report a
//! duplicate as [`Error::RunNumberConflict`] so callers can re-allocate.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::models::{
    ApprovalRecord, ApprovalStatus, BuildConfig, BuildRun, DeployConfig, DeployHistory,
    TriggerType, Workflow, WorkflowRun,
};
use crate::error::{Entity, Error, Result};

#[async_trait]
pub trait BuildStore: Send + Sync {
    async fn insert_config(&self, config: BuildConfig) -> Result<BuildConfig>;
    async fn get_config(&self, id: &str) -> Result<BuildConfig>;
    /// Highest allocated run number, zero when none.
    async fn max_run_number(&self, config_id: &str) -> Result<u32>;
    async fn insert_run(&self, run: BuildRun) -> Result<BuildRun>;
    async fn get_run(&self, id: &str) -> Result<BuildRun>;
    async fn update_run(&self, run: &BuildRun) -> Result<()>;
    async fn list_runs(&self, config_id: &str) -> Result<Vec<BuildRun>>;
}

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn insert_workflow(&self, workflow: Workflow) -> Result<Workflow>;
    async fn get_workflow(&self, id: &str) -> Result<Workflow>;
    async fn list_by_trigger(&self, trigger: TriggerType) -> Result<Vec<Workflow>>;
    async fn max_run_number(&self, workflow_id: &str) -> Result<u32>;
    async fn insert_run(&self, run: WorkflowRun) -> Result<WorkflowRun>;
    async fn get_run(&self, id: &str) -> Result<WorkflowRun>;
    async fn update_run(&self, run: &WorkflowRun) -> Result<()>;
    async fn list_runs(&self, workflow_id: &str) -> Result<Vec<WorkflowRun>>;
}

#[async_trait]
pub trait DeployStore: Send + Sync {
    async fn insert_config(&self, config: DeployConfig) -> Result<DeployConfig>;
    async fn get_config(&self, id: &str) -> Result<DeployConfig>;
    async fn update_config(&self, config: &DeployConfig) -> Result<()>;
    async fn delete_config(&self, id: &str) -> Result<()>;
    async fn insert_history(&self, history: DeployHistory) -> Result<DeployHistory>;
    async fn get_history(&self, id: &str) -> Result<DeployHistory>;
    async fn update_history(&self, history: &DeployHistory) -> Result<()>;
    async fn list_histories(&self, config_id: &str) -> Result<Vec<DeployHistory>>;
}

/// A one-shot approval decision.
#[derive(Debug, Clone)]
pub struct Decision {
    pub status: ApprovalStatus,
    pub approver_id: String,
    pub comment: String,
    pub decided_at: DateTime<Utc>,
}

#[async_trait]
pub trait ApprovalStore: Send + Sync {
    async fn insert_approval(&self, record: ApprovalRecord) -> Result<ApprovalRecord>;
    async fn get_approval(&self, id: &str) -> Result<ApprovalRecord>;
    /// Apply `decision` only if the record is still pending. Otherwise fails
    /// with [`Error::AlreadyDecided`] and leaves the record untouched.
    async fn decide(&self, id: &str, decision: Decision) -> Result<ApprovalRecord>;
    async fn list_pending(&self) -> Result<Vec<ApprovalRecord>>;
}

#[derive(Default)]
struct Tables {
    build_configs: HashMap<String, BuildConfig>,
    build_runs: HashMap<String, BuildRun>,
    workflows: HashMap<String, Workflow>,
    workflow_runs: HashMap<String, WorkflowRun>,
    deploy_configs: HashMap<String, DeployConfig>,
    histories: HashMap<String, DeployHistory>,
    approvals: HashMap<String, ApprovalRecord>,
}

/// In-process implementation of every store trait.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted_by_number<T: Clone>(items: impl Iterator<Item = T>, number: impl Fn(&T) -> u32) -> Vec<T> {
    let mut out: Vec<T> = items.collect();
    out.sort_by_key(|item| number(item));
    out
}

#[async_trait]
impl BuildStore for MemoryStore {
    async fn insert_config(&self, config: BuildConfig) -> Result<BuildConfig> {
        self.tables
            .write()
            .await
            .build_configs
            .insert(config.id.clone(), config.clone());
        Ok(config)
    }

    async fn get_config(&self, id: &str) -> Result<BuildConfig> {
        self.tables
            .read()
            .await
            .build_configs
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(Entity::BuildConfig, id))
    }

    async fn max_run_number(&self, config_id: &str) -> Result<u32> {
        Ok(self
            .tables
            .read()
            .await
            .build_runs
            .values()
            .filter(|r| r.build_config_id == config_id)
            .map(|r| r.run_number)
            .max()
            .unwrap_or(0))
    }

    async fn insert_run(&self, run: BuildRun) -> Result<BuildRun> {
        let mut tables = self.tables.write().await;
        let taken = tables
            .build_runs
            .values()
            .any(|r| r.build_config_id == run.build_config_id && r.run_number == run.run_number);
        if taken {
            return Err(Error::RunNumberConflict {
                parent_id: run.build_config_id,
                run_number: run.run_number,
            });
        }
        tables.build_runs.insert(run.id.clone(), run.clone());
        Ok(run)
    }

    async fn get_run(&self, id: &str) -> Result<BuildRun> {
        self.tables
            .read()
            .await
            .build_runs
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(Entity::BuildRun, id))
    }

    async fn update_run(&self, run: &BuildRun) -> Result<()> {
        let mut tables = self.tables.write().await;
        let slot = tables
            .build_runs
            .get_mut(&run.id)
            .ok_or_else(|| Error::not_found(Entity::BuildRun, &run.id))?;
        *slot = run.clone();
        Ok(())
    }

    async fn list_runs(&self, config_id: &str) -> Result<Vec<BuildRun>> {
        let tables = self.tables.read().await;
        Ok(sorted_by_number(
            tables
                .build_runs
                .values()
                .filter(|r| r.build_config_id == config_id)
                .cloned(),
            |r| r.run_number,
        ))
    }
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn insert_workflow(&self, workflow: Workflow) -> Result<Workflow> {
        self.tables
            .write()
            .await
            .workflows
            .insert(workflow.id.clone(), workflow.clone());
        Ok(workflow)
    }

    async fn get_workflow(&self, id: &str) -> Result<Workflow> {
        self.tables
            .read()
            .await
            .workflows
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(Entity::Workflow, id))
    }

    async fn list_by_trigger(&self, trigger: TriggerType) -> Result<Vec<Workflow>> {
        let mut found: Vec<Workflow> = self
            .tables
            .read()
            .await
            .workflows
            .values()
            .filter(|w| w.trigger_type == trigger)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }

    async fn max_run_number(&self, workflow_id: &str) -> Result<u32> {
        Ok(self
            .tables
            .read()
            .await
            .workflow_runs
            .values()
            .filter(|r| r.workflow_id == workflow_id)
            .map(|r| r.run_number)
            .max()
            .unwrap_or(0))
    }

    async fn insert_run(&self, run: WorkflowRun) -> Result<WorkflowRun> {
        let mut tables = self.tables.write().await;
        let taken = tables
            .workflow_runs
            .values()
            .any(|r| r.workflow_id == run.workflow_id && r.run_number == run.run_number);
        if taken {
            return Err(Error::RunNumberConflict {
                parent_id: run.workflow_id,
                run_number: run.run_number,
            });
        }
        tables.workflow_runs.insert(run.id.clone(), run.clone());
        Ok(run)
    }

    async fn get_run(&self, id: &str) -> Result<WorkflowRun> {
        self.tables
            .read()
            .await
            .workflow_runs
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(Entity::WorkflowRun, id))
    }

    async fn update_run(&self, run: &WorkflowRun) -> Result<()> {
        let mut tables = self.tables.write().await;
        let slot = tables
            .workflow_runs
            .get_mut(&run.id)
            .ok_or_else(|| Error::not_found(Entity::WorkflowRun, &run.id))?;
        *slot = run.clone();
        Ok(())
    }

    async fn list_runs(&self, workflow_id: &str) -> Result<Vec<WorkflowRun>> {
        let tables = self.tables.read().await;
        Ok(sorted_by_number(
            tables
                .workflow_runs
                .values()
                .filter(|r| r.workflow_id == workflow_id)
                .cloned(),
            |r| r.run_number,
        ))
    }
}

#[async_trait]
impl DeployStore for MemoryStore {
    async fn insert_config(&self, config: DeployConfig) -> Result<DeployConfig> {
        self.tables
            .write()
            .await
            .deploy_configs
            .insert(config.id.clone(), config.clone());
        Ok(config)
    }

    async fn get_config(&self, id: &str) -> Result<DeployConfig> {
        self.tables
            .read()
            .await
            .deploy_configs
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(Entity::DeployConfig, id))
    }

    async fn update_config(&self, config: &DeployConfig) -> Result<()> {
        let mut tables = self.tables.write().await;
        let slot = tables
            .deploy_configs
            .get_mut(&config.id)
            .ok_or_else(|| Error::not_found(Entity::DeployConfig, &config.id))?;
        *slot = config.clone();
        Ok(())
    }

    async fn delete_config(&self, id: &str) -> Result<()> {
        self.tables
            .write()
            .await
            .deploy_configs
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(Entity::DeployConfig, id))
    }

    async fn insert_history(&self, history: DeployHistory) -> Result<DeployHistory> {
        self.tables
            .write()
            .await
            .histories
            .insert(history.id.clone(), history.clone());
        Ok(history)
    }

    async fn get_history(&self, id: &str) -> Result<DeployHistory> {
        self.tables
            .read()
            .await
            .histories
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(Entity::DeployHistory, id))
    }

    async fn update_history(&self, history: &DeployHistory) -> Result<()> {
        let mut tables = self.tables.write().await;
        let slot = tables
            .histories
            .get_mut(&history.id)
            .ok_or_else(|| Error::not_found(Entity::DeployHistory, &history.id))?;
        *slot = history.clone();
        Ok(())
    }

    async fn list_histories(&self, config_id: &str) -> Result<Vec<DeployHistory>> {
        let mut found: Vec<DeployHistory> = self
            .tables
            .read()
            .await
            .histories
            .values()
            .filter(|h| h.deploy_config_id == config_id)
            .cloned()
            .collect();
        found.sort_by_key(|h| h.created_at);
        Ok(found)
    }
}

#[async_trait]
impl ApprovalStore for MemoryStore {
    async fn insert_approval(&self, record: ApprovalRecord) -> Result<ApprovalRecord> {
        self.tables
            .write()
            .await
            .approvals
            .insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn get_approval(&self, id: &str) -> Result<ApprovalRecord> {
        self.tables
            .read()
            .await
            .approvals
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(Entity::Approval, id))
    }

    async fn decide(&self, id: &str, decision: Decision) -> Result<ApprovalRecord> {
        let mut tables = self.tables.write().await;
        let record = tables
            .approvals
            .get_mut(id)
            .ok_or_else(|| Error::not_found(Entity::Approval, id))?;
        if record.status != ApprovalStatus::Pending {
            return Err(Error::AlreadyDecided);
        }
        record.status = decision.status;
        record.approver_id = Some(decision.approver_id);
        record.comment = decision.comment;
        record.decided_at = Some(decision.decided_at);
        Ok(record.clone())
    }

    async fn list_pending(&self) -> Result<Vec<ApprovalRecord>> {
        let mut found: Vec<ApprovalRecord> = self
            .tables
            .read()
            .await
            .approvals
            .values()
            .filter(|a| a.status == ApprovalStatus::Pending)
            .cloned()
            .collect();
        found.sort_by_key(|a| a.created_at);
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::models::RunState;

    fn build_run(config: &str, number: u32) -> BuildRun {
        BuildRun {
            id: crate::services::models::new_id(),
            build_config_id: config.to_string(),
            run_number: number,
            status: RunState::Pending,
            branch: "main".into(),
            commit_sha: String::new(),
            commit_message: String::new(),
            image_tag: "latest".into(),
            execution_ref: None,
            triggered_by: "u".into(),
            started_at: None,
            finished_at: None,
            duration_secs: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn duplicate_run_number_is_a_conflict() {
        let store = MemoryStore::new();
        BuildStore::insert_run(&store, build_run("cfg", 1)).await.unwrap();
        let err = BuildStore::insert_run(&store, build_run("cfg", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RunNumberConflict { run_number: 1, .. }));

        BuildStore::insert_run(&store, build_run("other", 1)).await.unwrap();
        assert_eq!(BuildStore::max_run_number(&store, "cfg").await.unwrap(), 1);
        assert_eq!(BuildStore::max_run_number(&store, "none").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn decide_is_one_shot() {
        let store = MemoryStore::new();
        store
            .insert_approval(ApprovalRecord {
                id: "a1".into(),
                deploy_history_id: "h1".into(),
                environment_id: "prod".into(),
                requested_by: "dev".into(),
                approver_id: None,
                status: ApprovalStatus::Pending,
                comment: String::new(),
                created_at: Utc::now(),
                decided_at: None,
            })
            .await
            .unwrap();
        let decision = Decision {
            status: ApprovalStatus::Approved,
            approver_id: "lead".into(),
            comment: "ok".into(),
            decided_at: Utc::now(),
        };
        store.decide("a1", decision.clone()).await.unwrap();
        let err = store
            .decide(
                "a1",
                Decision {
                    status: ApprovalStatus::Rejected,
                    ..decision
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyDecided));
        assert_eq!(
            store.get_approval("a1").await.unwrap().status,
            ApprovalStatus::Approved
        );
    }
}

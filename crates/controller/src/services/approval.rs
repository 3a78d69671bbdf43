//! Approval gate in front of deployments.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument, warn};

use super::models::{new_id, ApprovalRecord, ApprovalStatus, DeployHistory, HistoryStatus};
use super::store::{ApprovalStore, Decision, DeployStore};
use crate::error::Result;

pub struct ApprovalService {
    approvals: Arc<dyn ApprovalStore>,
    deploys: Arc<dyn DeployStore>,
}

impl ApprovalService {
    pub fn new(approvals: Arc<dyn ApprovalStore>, deploys: Arc<dyn DeployStore>) -> Self {
        Self { approvals, deploys }
    }

    /// Open a pending approval for an existing deploy history.
    #[instrument(skip(self))]
    pub async fn create_approval(
        &self,
        history_id: &str,
        environment_id: &str,
        requested_by: &str,
    ) -> Result<ApprovalRecord> {
        self.deploys.get_history(history_id).await?;
        let record = self
            .approvals
            .insert_approval(ApprovalRecord {
                id: new_id(),
                deploy_history_id: history_id.to_string(),
                environment_id: environment_id.to_string(),
                requested_by: requested_by.to_string(),
                approver_id: None,
                status: ApprovalStatus::Pending,
                comment: String::new(),
                created_at: Utc::now(),
                decided_at: None,
            })
            .await?;
        info!(approval_id = %record.id, "Approval requested");
        Ok(record)
    }

    /// Approve a pending record. The linked history becomes eligible to sync.
    #[instrument(skip(self, comment))]
    pub async fn approve(&self, id: &str, approver_id: &str, comment: &str) -> Result<ApprovalRecord> {
        let record = self
            .decide(id, ApprovalStatus::Approved, approver_id, comment)
            .await?;
        self.update_history(&record.deploy_history_id, |history| {
            history.status = HistoryStatus::Pending;
        })
        .await;
        Ok(record)
    }

    /// Reject a pending record and cancel the linked history.
    #[instrument(skip(self, comment))]
    pub async fn reject(&self, id: &str, approver_id: &str, comment: &str) -> Result<ApprovalRecord> {
        let record = self
            .decide(id, ApprovalStatus::Rejected, approver_id, comment)
            .await?;
        self.update_history(&record.deploy_history_id, |history| {
            history.status = HistoryStatus::Cancelled;
            history.finished_at = Some(Utc::now());
        })
        .await;
        Ok(record)
    }

    pub async fn get(&self, id: &str) -> Result<ApprovalRecord> {
        self.approvals.get_approval(id).await
    }

    pub async fn list_pending(&self) -> Result<Vec<ApprovalRecord>> {
        self.approvals.list_pending().await
    }

    async fn decide(
        &self,
        id: &str,
        status: ApprovalStatus,
        approver_id: &str,
        comment: &str,
    ) -> Result<ApprovalRecord> {
        let record = self
            .approvals
            .decide(
                id,
                Decision {
                    status,
                    approver_id: approver_id.to_string(),
                    comment: comment.to_string(),
                    decided_at: Utc::now(),
                },
            )
            .await?;
        info!(status = ?record.status, "Approval decided");
        Ok(record)
    }

    // The decision stands even if the history is gone.
    async fn update_history(&self, history_id: &str, apply: impl FnOnce(&mut DeployHistory)) {
        let result = async {
            let mut history = self.deploys.get_history(history_id).await?;
            apply(&mut history);
            self.deploys.update_history(&history).await
        }
        .await;
        if let Err(e) = result {
            warn!(history_id, error = %e, "Failed to update deploy history after approval decision");
        }
    }
}

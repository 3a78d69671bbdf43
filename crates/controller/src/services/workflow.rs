//! Workflow orchestration: manual, retry, and webhook triggers.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use notify::{DomainEvent, EventType, Notifier};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use super::models::{
    elapsed_secs, new_id, RunState, TriggerType, Workflow, WorkflowRun,
};
use super::store::WorkflowStore;
use super::tracking::RunTracker;
use super::RUN_NUMBER_ATTEMPTS;
use crate::crd::RunStatus;
use crate::error::{Error, Result};
use crate::execution::RunSubmitter;
use crate::templates::{JobModel, StageModel, WorkflowModel};
use crate::webhooks::PushEvent;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TriggerWorkflow {
    #[serde(default)]
    pub triggered_by: String,
    #[serde(default)]
    pub input_params: BTreeMap<String, String>,
}

pub struct WorkflowService {
    store: Arc<dyn WorkflowStore>,
    submitter: Option<Arc<RunSubmitter>>,
    tracker: Option<Arc<RunTracker>>,
    notifier: Arc<Notifier>,
    namespace: String,
}

impl WorkflowService {
    pub fn new(store: Arc<dyn WorkflowStore>, notifier: Arc<Notifier>, namespace: &str) -> Self {
        Self {
            store,
            submitter: None,
            tracker: None,
            notifier,
            namespace: namespace.to_string(),
        }
    }

    #[must_use]
    pub fn with_submitter(mut self, submitter: Arc<RunSubmitter>) -> Self {
        self.submitter = Some(submitter);
        self
    }

    #[must_use]
    pub fn with_tracker(mut self, tracker: Arc<RunTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub async fn create_workflow(&self, mut workflow: Workflow) -> Result<Workflow> {
        if workflow.id.is_empty() {
            workflow.id = new_id();
        }
        self.store.insert_workflow(workflow).await
    }

    pub async fn get_workflow(&self, id: &str) -> Result<Workflow> {
        self.store.get_workflow(id).await
    }

    pub async fn get_run(&self, id: &str) -> Result<WorkflowRun> {
        self.store.get_run(id).await
    }

    pub async fn list_runs(&self, workflow_id: &str) -> Result<Vec<WorkflowRun>> {
        self.store.list_runs(workflow_id).await
    }

    #[instrument(skip(self, req), fields(triggered_by = %req.triggered_by))]
    pub async fn trigger(&self, workflow_id: &str, req: TriggerWorkflow) -> Result<WorkflowRun> {
        let workflow = self.store.get_workflow(workflow_id).await?;
        if !workflow.enabled {
            return Err(Error::WorkflowDisabled(workflow.name));
        }
        self.start_run(&workflow, TriggerType::Manual, &req.triggered_by, req.input_params)
            .await
    }

    /// Start a new run from a failed or cancelled one, reusing its input params.
    #[instrument(skip(self))]
    pub async fn retry_run(&self, run_id: &str, triggered_by: &str) -> Result<WorkflowRun> {
        let previous = self.store.get_run(run_id).await?;
        if !matches!(previous.status, RunState::Failed | RunState::Cancelled) {
            return Err(Error::InvalidState(
                "only failed or cancelled runs can be retried".to_string(),
            ));
        }
        let workflow = self.store.get_workflow(&previous.workflow_id).await?;
        self.start_run(&workflow, TriggerType::Manual, triggered_by, previous.input_params)
            .await
    }

    /// Start every enabled webhook workflow bound to the pushed repository.
    ///
    /// A workflow matches when its `repo_url` equals the push and its optional
    /// `branch` equals the pushed branch. Returns the number of runs started.
    #[instrument(skip(self, push), fields(repo_url = %push.repo_url, branch = %push.branch))]
    pub async fn trigger_by_webhook(&self, push: &PushEvent) -> Result<usize> {
        let workflows = self.store.list_by_trigger(TriggerType::Webhook).await?;
        let mut triggered = 0;

        for workflow in workflows.iter().filter(|w| w.enabled) {
            if workflow.trigger_config.get("repo_url").map(String::as_str) != Some(push.repo_url.as_str()) {
                continue;
            }
            if let Some(branch) = workflow.trigger_config.get("branch") {
                if !branch.is_empty() && *branch != push.branch {
                    continue;
                }
            }

            let params = BTreeMap::from([
                ("branch".to_string(), push.branch.clone()),
                ("commit_sha".to_string(), push.commit_sha.clone()),
            ]);
            match self
                .start_run(workflow, TriggerType::Webhook, &push.pusher, params)
                .await
            {
                Ok(_) => triggered += 1,
                Err(e) => warn!(workflow_id = %workflow.id, error = %e, "Webhook trigger failed"),
            }
        }

        info!(triggered, "Processed push webhook");
        Ok(triggered)
    }

    async fn start_run(
        &self,
        workflow: &Workflow,
        trigger_type: TriggerType,
        triggered_by: &str,
        input_params: BTreeMap<String, String>,
    ) -> Result<WorkflowRun> {
        let mut run = self
            .allocate_run(workflow, trigger_type, triggered_by, input_params)
            .await?;
        info!(workflow_id = %workflow.id, run_number = run.run_number, "Created workflow run");

        if let Some(submitter) = &self.submitter {
            let model = self.workflow_model(workflow, &run);
            match submitter.submit_workflow(&model).await {
                Ok(submitted) => {
                    run.status = RunState::Running;
                    run.started_at = Some(Utc::now());
                    run.execution_ref = Some(submitted.name.clone());
                    self.store.update_run(&run).await?;
                    if let Some(tracker) = &self.tracker {
                        tracker.track(&submitted.name, &run.id);
                    }
                }
                Err(e) => {
                    warn!(run_id = %run.id, error = %e, "Failed to submit workflow, run stays pending");
                }
            }
        }

        self.notifier.notify(DomainEvent::new(
            EventType::WorkflowStarted,
            &workflow.project_id,
            triggered_by,
            json!({
                "workflow_run_id": run.id,
                "workflow_id": workflow.id,
                "run_number": run.run_number,
                "trigger_type": run.trigger_type,
            }),
        ));
        Ok(run)
    }

    async fn allocate_run(
        &self,
        workflow: &Workflow,
        trigger_type: TriggerType,
        triggered_by: &str,
        input_params: BTreeMap<String, String>,
    ) -> Result<WorkflowRun> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let run = WorkflowRun {
                id: new_id(),
                workflow_id: workflow.id.clone(),
                run_number: self.store.max_run_number(&workflow.id).await? + 1,
                status: RunState::Pending,
                trigger_type,
                triggered_by: triggered_by.to_string(),
                input_params: input_params.clone(),
                execution_ref: None,
                error_message: String::new(),
                started_at: None,
                finished_at: None,
                duration_secs: None,
                created_at: Utc::now(),
            };
            match self.store.insert_run(run).await {
                Err(Error::RunNumberConflict { run_number, .. }) if attempt < RUN_NUMBER_ATTEMPTS => {
                    debug!(run_number, attempt, "Run number taken, reallocating");
                }
                other => return other,
            }
        }
    }

    fn workflow_model(&self, workflow: &Workflow, run: &WorkflowRun) -> WorkflowModel {
        let mut stages: Vec<_> = workflow.stages.iter().filter(|s| s.enabled).collect();
        stages.sort_by_key(|s| s.sort_order);

        let stages = stages
            .into_iter()
            .map(|stage| {
                let mut jobs: Vec<_> = stage.jobs.iter().filter(|j| j.enabled).collect();
                jobs.sort_by_key(|j| j.sort_order);
                StageModel {
                    id: stage.id.clone(),
                    name: stage.name.clone(),
                    stage_type: stage.stage_type.clone(),
                    parallel: stage.parallel,
                    jobs: jobs
                        .into_iter()
                        .map(|job| JobModel {
                            id: job.id.clone(),
                            name: job.name.clone(),
                            job_type: job.job_type.clone(),
                            config: job.config.clone(),
                            timeout_secs: job.timeout_secs,
                        })
                        .collect(),
                }
            })
            .collect();

        WorkflowModel {
            workflow_id: workflow.id.clone(),
            workflow_name: workflow.name.clone(),
            run_id: run.id.clone(),
            run_number: run.run_number,
            project_id: workflow.project_id.clone(),
            namespace: self.namespace.clone(),
            stages,
            params: run.input_params.clone(),
        }
    }

    /// Move a run to `status`. Publishes `workflow.completed` on terminal states.
    #[instrument(skip(self, message))]
    pub async fn update_run_status(
        &self,
        run_id: &str,
        status: RunState,
        message: &str,
    ) -> Result<WorkflowRun> {
        let mut run = self.store.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Err(Error::InvalidState(format!(
                "workflow run {run_id} already finished as {}",
                run.status
            )));
        }

        let now = Utc::now();
        run.status = status;
        if !message.is_empty() {
            run.error_message = message.to_string();
        }
        if status == RunState::Running && run.started_at.is_none() {
            run.started_at = Some(now);
        }
        if status.is_terminal() {
            run.finished_at = Some(now);
            run.duration_secs = elapsed_secs(run.started_at, now);
        }
        self.store.update_run(&run).await?;

        if status.is_terminal() {
            let project_id = match self.store.get_workflow(&run.workflow_id).await {
                Ok(workflow) => workflow.project_id,
                Err(_) => String::new(),
            };
            self.notifier.notify(DomainEvent::new(
                EventType::WorkflowCompleted,
                project_id,
                &run.triggered_by,
                json!({
                    "workflow_run_id": run.id,
                    "workflow_id": run.workflow_id,
                    "status": status,
                    "duration_secs": run.duration_secs,
                }),
            ));
        }
        Ok(run)
    }

    pub async fn apply_watch_status(&self, run_id: &str, status: &RunStatus) -> Result<()> {
        let run = self.store.get_run(run_id).await?;
        let changed = !run.status.is_terminal()
            && status.phase != RunState::Pending
            && status.phase != run.status;
        if changed {
            self.update_run_status(run_id, status.phase, &status.message)
                .await?;
        }
        if status.phase.is_terminal() || run.status.is_terminal() {
            if let Some(tracker) = &self.tracker {
                tracker.release(&status.name);
            }
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn cancel_run(&self, run_id: &str) -> Result<WorkflowRun> {
        let mut run = self.store.get_run(run_id).await?;
        if !matches!(run.status, RunState::Pending | RunState::Running) {
            return Err(Error::InvalidState(
                "only pending or running workflows can be cancelled".to_string(),
            ));
        }

        if let (Some(submitter), Some(name)) = (&self.submitter, &run.execution_ref) {
            if let Err(e) = submitter
                .cancel_workflow(&self.namespace, &run.workflow_id, run.run_number)
                .await
            {
                warn!(run = %name, error = %e, "Failed to cancel PipelineRun");
            }
            if let Some(tracker) = &self.tracker {
                tracker.release(name);
            }
        }

        let now = Utc::now();
        run.status = RunState::Cancelled;
        run.finished_at = Some(now);
        run.duration_secs = elapsed_secs(run.started_at, now);
        self.store.update_run(&run).await?;
        info!(run_number = run.run_number, "Workflow run cancelled");
        Ok(run)
    }
}

//! Build orchestration: run numbering, image tags, submission, and status.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashSet;
use notify::{DomainEvent, EventType, Notifier};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::models::{elapsed_secs, new_id, BuildConfig, BuildRun, RunState, TagStrategy};
use super::store::BuildStore;
use super::tracking::RunTracker;
use super::RUN_NUMBER_ATTEMPTS;
use crate::crd::RunStatus;
use crate::error::{Error, Result};
use crate::execution::{BuildLogSink, RunSubmitter};
use crate::templates::{catalog, BuildModel};

pub const DEFAULT_BRANCH: &str = "main";
pub const DEFAULT_DOCKERFILE: &str = "Dockerfile";
pub const DEFAULT_CONTEXT: &str = ".";

/// Derive an image tag.
///
/// `branch-commit[:8]` for [`TagStrategy::BranchCommit`] when a commit of at
/// least eight characters is known, otherwise `branch-run_number`.
#[must_use]
pub fn generate_image_tag(
    branch: &str,
    commit_sha: &str,
    run_number: u32,
    strategy: TagStrategy,
    unix_time: i64,
) -> String {
    match strategy {
        TagStrategy::Timestamp => format!("{branch}-{unix_time}"),
        TagStrategy::Latest => "latest".to_string(),
        TagStrategy::BranchCommit => match commit_sha.get(..8) {
            Some(short) => format!("{branch}-{short}"),
            None => format!("{branch}-{run_number}"),
        },
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TriggerBuild {
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub commit_sha: Option<String>,
    #[serde(default)]
    pub triggered_by: String,
}

pub struct BuildService {
    store: Arc<dyn BuildStore>,
    submitter: Option<Arc<RunSubmitter>>,
    tracker: Option<Arc<RunTracker>>,
    logs: Option<(Arc<dyn BuildLogSink>, CancellationToken)>,
    /// Runs whose step logs are already being relayed.
    followed: DashSet<String>,
    notifier: Arc<Notifier>,
    namespace: String,
}

impl BuildService {
    pub fn new(store: Arc<dyn BuildStore>, notifier: Arc<Notifier>, namespace: &str) -> Self {
        Self {
            store,
            submitter: None,
            tracker: None,
            logs: None,
            followed: DashSet::new(),
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

    /// Publish step logs of running builds until `cancel` fires.
    #[must_use]
    pub fn with_log_relay(
        mut self,
        relay: Arc<dyn BuildLogSink>,
        cancel: CancellationToken,
    ) -> Self {
        self.logs = Some((relay, cancel));
        self
    }

    /// Store a build config, filling defaults for branch, Dockerfile, and context.
    pub async fn create_config(&self, mut config: BuildConfig) -> Result<BuildConfig> {
        if config.id.is_empty() {
            config.id = new_id();
        }
        if config.branch.is_empty() {
            config.branch = DEFAULT_BRANCH.to_string();
        }
        if config.dockerfile_path.is_empty() {
            config.dockerfile_path = DEFAULT_DOCKERFILE.to_string();
        }
        if config.docker_context.is_empty() {
            config.docker_context = DEFAULT_CONTEXT.to_string();
        }
        if let Some(name) = &config.template {
            if catalog::find(name).is_none() {
                return Err(Error::InvalidState(format!("unknown build template: {name}")));
            }
        }
        self.store.insert_config(config).await
    }

    pub async fn get_config(&self, id: &str) -> Result<BuildConfig> {
        self.store.get_config(id).await
    }

    pub async fn get_run(&self, id: &str) -> Result<BuildRun> {
        self.store.get_run(id).await
    }

    pub async fn list_runs(&self, config_id: &str) -> Result<Vec<BuildRun>> {
        self.store.list_runs(config_id).await
    }

    /// Create a run and submit its `TaskRun`.
    ///
    /// Submission failures are logged and leave the run `pending`.
    #[instrument(skip(self, req), fields(triggered_by = %req.triggered_by))]
    pub async fn trigger_build(&self, config_id: &str, req: TriggerBuild) -> Result<BuildRun> {
        let config = self.store.get_config(config_id).await?;
        let branch = req
            .branch
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| config.branch.clone());
        let commit_sha = req.commit_sha.unwrap_or_default();

        let mut run = self
            .allocate_run(&config, &branch, &commit_sha, &req.triggered_by)
            .await?;
        info!(run_number = run.run_number, image_tag = %run.image_tag, "Created build run");

        if let Some(submitter) = &self.submitter {
            let model = self.build_model(&config, &run);
            match submitter.submit_build(&model).await {
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
                    warn!(run_id = %run.id, error = %e, "Failed to submit build, run stays pending");
                }
            }
        }

        self.notifier.notify(DomainEvent::new(
            EventType::BuildStarted,
            &config.project_id,
            &req.triggered_by,
            json!({
                "build_run_id": run.id,
                "build_config_id": config.id,
                "run_number": run.run_number,
                "service_id": config.service_id,
                "image_tag": run.image_tag,
            }),
        ));

        Ok(run)
    }

    async fn allocate_run(
        &self,
        config: &BuildConfig,
        branch: &str,
        commit_sha: &str,
        triggered_by: &str,
    ) -> Result<BuildRun> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let run_number = self.store.max_run_number(&config.id).await? + 1;
            let now = Utc::now();
            let run = BuildRun {
                id: new_id(),
                build_config_id: config.id.clone(),
                run_number,
                status: RunState::Pending,
                branch: branch.to_string(),
                commit_sha: commit_sha.to_string(),
                commit_message: String::new(),
                image_tag: generate_image_tag(
                    branch,
                    commit_sha,
                    run_number,
                    config.tag_strategy,
                    now.timestamp(),
                ),
                execution_ref: None,
                triggered_by: triggered_by.to_string(),
                started_at: None,
                finished_at: None,
                duration_secs: None,
                created_at: now,
            };
            match self.store.insert_run(run).await {
                Err(Error::RunNumberConflict { run_number, .. }) if attempt < RUN_NUMBER_ATTEMPTS => {
                    debug!(run_number, attempt, "Run number taken, reallocating");
                }
                other => return other,
            }
        }
    }

    fn build_model(&self, config: &BuildConfig, run: &BuildRun) -> BuildModel {
        let template = config.template.as_deref().and_then(catalog::find);
        let build_script = if config.build_script.is_empty() {
            template.map(|t| t.build_script.to_string()).unwrap_or_default()
        } else {
            config.build_script.clone()
        };
        BuildModel {
            build_config_id: config.id.clone(),
            run_id: run.id.clone(),
            run_number: run.run_number,
            project_id: config.project_id.clone(),
            service_name: config.name.clone(),
            namespace: self.namespace.clone(),
            repo_url: config.repo_url.clone(),
            branch: run.branch.clone(),
            commit_sha: run.commit_sha.clone(),
            build_image: template.map(|t| t.build_image.to_string()).unwrap_or_default(),
            build_script,
            dockerfile_path: config.dockerfile_path.clone(),
            docker_context: config.docker_context.clone(),
            image_repo: config.image_repo.clone(),
            image_tag: run.image_tag.clone(),
            build_env: config.build_env.clone(),
            variables: config.variables.clone(),
            cache_enabled: config.cache_enabled,
        }
    }

    /// Move a run to `status`, stamping start and finish times.
    ///
    /// Terminal runs are immutable.
    #[instrument(skip(self, message))]
    pub async fn update_run_status(
        &self,
        run_id: &str,
        status: RunState,
        message: &str,
    ) -> Result<BuildRun> {
        let mut run = self.store.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Err(Error::InvalidState(format!(
                "build run {run_id} already finished as {}",
                run.status
            )));
        }

        let now = Utc::now();
        run.status = status;
        if status == RunState::Running && run.started_at.is_none() {
            run.started_at = Some(now);
        }
        if status.is_terminal() {
            run.finished_at = Some(now);
            run.duration_secs = elapsed_secs(run.started_at, now);
            if !message.is_empty() {
                run.commit_message = message.to_string();
            }
        }
        self.store.update_run(&run).await?;

        let event_type = match status {
            RunState::Succeeded => Some(EventType::BuildCompleted),
            RunState::Failed => Some(EventType::BuildFailed),
            _ => None,
        };
        if let Some(event_type) = event_type {
            let project_id = match self.store.get_config(&run.build_config_id).await {
                Ok(config) => config.project_id,
                Err(_) => String::new(),
            };
            self.notifier.notify(DomainEvent::new(
                event_type,
                project_id,
                &run.triggered_by,
                json!({
                    "build_run_id": run.id,
                    "build_config_id": run.build_config_id,
                    "status": status,
                    "image_tag": run.image_tag,
                    "duration_secs": run.duration_secs,
                }),
            ));
        }
        Ok(run)
    }

    /// Apply a watcher status to the run, releasing the subscription once terminal.
    ///
    /// Log relay starts on the first `Running` status that names a pod and
    /// its step containers, which may arrive after the phase change itself.
    pub async fn apply_watch_status(&self, run_id: &str, status: &RunStatus) -> Result<()> {
        let run = self.store.get_run(run_id).await?;
        let changed = !run.status.is_terminal()
            && status.phase != RunState::Pending
            && status.phase != run.status;
        if changed {
            self.update_run_status(run_id, status.phase, &status.message)
                .await?;
        }
        if status.phase == RunState::Running && !run.status.is_terminal() {
            self.follow_logs(run_id, status);
        }
        if status.phase.is_terminal() || run.status.is_terminal() {
            self.followed.remove(run_id);
            if let Some(tracker) = &self.tracker {
                tracker.release(&status.name);
            }
        }
        Ok(())
    }

    fn follow_logs(&self, run_id: &str, status: &RunStatus) {
        let Some((relay, cancel)) = &self.logs else {
            return;
        };
        if self.followed.contains(run_id) {
            return;
        }
        let containers: Vec<String> = status
            .steps
            .iter()
            .map(|step| step.container.clone())
            .filter(|container| !container.is_empty())
            .collect();
        if status.pod_name.is_empty() || containers.is_empty() {
            debug!(run = %status.name, "No pod or steps reported yet, deferring log relay");
            return;
        }
        if !self.followed.insert(run_id.to_string()) {
            return;
        }

        let relay = Arc::clone(relay);
        let cancel = cancel.child_token();
        let namespace = self.namespace.clone();
        let pod = status.pod_name.clone();
        let run_id = run_id.to_string();
        tokio::spawn(async move {
            let mut full_log = String::new();
            for container in containers {
                match relay
                    .stream_pod_logs(&namespace, &pod, &container, &run_id, cancel.clone())
                    .await
                {
                    Ok(captured) => full_log.push_str(&captured),
                    Err(e) => {
                        warn!(pod = %pod, container = %container, error = %e, "Log relay failed");
                    }
                }
                if cancel.is_cancelled() {
                    return;
                }
            }
            if let Err(e) = relay.archive(&run_id, &full_log).await {
                warn!(run_id = %run_id, error = %e, "Failed to archive build log");
            }
        });
    }

    /// Cancel a pending or running build.
    ///
    /// The `TaskRun` patch is best-effort; the run is always marked cancelled.
    #[instrument(skip(self))]
    pub async fn cancel_run(&self, run_id: &str) -> Result<BuildRun> {
        let mut run = self.store.get_run(run_id).await?;
        if !matches!(run.status, RunState::Pending | RunState::Running) {
            return Err(Error::InvalidState(
                "only pending or running builds can be cancelled".to_string(),
            ));
        }

        if let (Some(submitter), Some(name)) = (&self.submitter, &run.execution_ref) {
            if let Err(e) = submitter
                .cancel_build(&self.namespace, &run.build_config_id, run.run_number)
                .await
            {
                warn!(run = %name, error = %e, "Failed to cancel TaskRun");
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
        info!(run_number = run.run_number, "Build run cancelled");
        Ok(run)
    }

}

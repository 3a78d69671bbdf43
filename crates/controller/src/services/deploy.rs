//! Deploy orchestration: config mirroring, sync, rollback, and rollouts.
//!
//! Every cluster-facing collaborator is optional. Without an app manager the
//! status reads report `Unknown`, without a sync controller histories are
//! recorded but not synced, and without a rollout controller rollout
//! operations fail with [`Error::RolloutUnavailable`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use notify::{DomainEvent, EventType, Notifier};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::models::{new_id, DeployConfig, DeployHistory, HistoryStatus, SyncPolicy};
use super::store::DeployStore;
use crate::crd::application::SYNC_SYNCED;
use crate::crd::{AppStatus, ArgoApp, ResourceTree, RolloutStatus, SyncResult};
use crate::delivery::{AppManager, GitOpsWriter, RolloutController, SyncController};
use crate::error::{Error, Result};

pub const DEFAULT_TARGET_REVISION: &str = "main";
pub const APP_NAME_PREFIX: &str = "zcicd";
const OUT_OF_SYNC: &str = "OutOfSync";

/// `zcicd-{project_id[..8]}-{name}`.
#[must_use]
pub fn argo_app_name(project_id: &str, name: &str) -> String {
    let short = project_id.get(..8).unwrap_or(project_id);
    format!("{APP_NAME_PREFIX}-{short}-{name}")
}

/// Partial update of a deploy config. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateDeployConfig {
    pub name: Option<String>,
    pub deploy_type: Option<String>,
    pub repo_url: Option<String>,
    pub target_revision: Option<String>,
    pub chart_path: Option<String>,
    pub values_override: Option<BTreeMap<String, Value>>,
    pub sync_policy: Option<SyncPolicy>,
    pub auto_sync: Option<bool>,
    pub self_heal: Option<bool>,
    pub prune: Option<bool>,
    pub namespace: Option<String>,
}

/// Wait for convergence after each sync trigger.
#[derive(Debug, Clone)]
struct SyncWait {
    timeout: Duration,
    cancel: CancellationToken,
}

pub struct DeployService {
    store: Arc<dyn DeployStore>,
    apps: Option<Arc<AppManager>>,
    sync: Option<Arc<SyncController>>,
    rollouts: Option<Arc<RolloutController>>,
    gitops: Option<Arc<GitOpsWriter>>,
    notifier: Arc<Notifier>,
    wait: Option<SyncWait>,
}

impl DeployService {
    pub fn new(store: Arc<dyn DeployStore>, notifier: Arc<Notifier>) -> Self {
        Self {
            store,
            apps: None,
            sync: None,
            rollouts: None,
            gitops: None,
            notifier,
            wait: None,
        }
    }

    #[must_use]
    pub fn with_apps(mut self, apps: Arc<AppManager>) -> Self {
        self.apps = Some(apps);
        self
    }

    #[must_use]
    pub fn with_sync(mut self, sync: Arc<SyncController>) -> Self {
        self.sync = Some(sync);
        self
    }

    #[must_use]
    pub fn with_rollouts(mut self, rollouts: Arc<RolloutController>) -> Self {
        self.rollouts = Some(rollouts);
        self
    }

    #[must_use]
    pub fn with_gitops(mut self, gitops: Arc<GitOpsWriter>) -> Self {
        self.gitops = Some(gitops);
        self
    }

    /// Block each sync until the application converges, `timeout` elapses, or
    /// `cancel` fires.
    #[must_use]
    pub fn with_sync_wait(mut self, timeout: Duration, cancel: CancellationToken) -> Self {
        self.wait = Some(SyncWait { timeout, cancel });
        self
    }

    #[instrument(skip(self, config), fields(project_id = %config.project_id, name = %config.name))]
    pub async fn create_config(&self, mut config: DeployConfig) -> Result<DeployConfig> {
        if config.id.is_empty() {
            config.id = new_id();
        }
        if config.target_revision.is_empty() {
            config.target_revision = DEFAULT_TARGET_REVISION.to_string();
        }
        config.argo_app_name = argo_app_name(&config.project_id, &config.name);
        let config = self.store.insert_config(config).await?;

        if let Some(apps) = &self.apps {
            if let Err(e) = apps.create_app(&self.argo_app(apps, &config)).await {
                warn!(app = %config.argo_app_name, error = %e, "Failed to create Argo CD application");
            }
        }
        Ok(config)
    }

    pub async fn get_config(&self, id: &str) -> Result<DeployConfig> {
        self.store.get_config(id).await
    }

    #[instrument(skip(self, update))]
    pub async fn update_config(&self, id: &str, update: UpdateDeployConfig) -> Result<DeployConfig> {
        let mut config = self.store.get_config(id).await?;

        let non_empty = |value: Option<String>| value.filter(|v| !v.is_empty());
        if let Some(name) = non_empty(update.name) {
            config.name = name;
        }
        if let Some(deploy_type) = non_empty(update.deploy_type) {
            config.deploy_type = deploy_type;
        }
        if let Some(repo_url) = non_empty(update.repo_url) {
            config.repo_url = repo_url;
        }
        if let Some(revision) = non_empty(update.target_revision) {
            config.target_revision = revision;
        }
        if let Some(chart_path) = non_empty(update.chart_path) {
            config.chart_path = chart_path;
        }
        if let Some(namespace) = non_empty(update.namespace) {
            config.namespace = namespace;
        }
        if let Some(values) = update.values_override {
            config.values_override = values;
        }
        if let Some(policy) = update.sync_policy {
            config.sync_policy = policy;
        }
        config.auto_sync = update.auto_sync.unwrap_or(config.auto_sync);
        config.self_heal = update.self_heal.unwrap_or(config.self_heal);
        config.prune = update.prune.unwrap_or(config.prune);

        self.store.update_config(&config).await?;

        if let Some(apps) = &self.apps {
            if !config.argo_app_name.is_empty() {
                if let Err(e) = apps.update_app(&self.argo_app(apps, &config)).await {
                    warn!(app = %config.argo_app_name, error = %e, "Failed to update Argo CD application");
                }
            }
        }
        Ok(config)
    }

    #[instrument(skip(self))]
    pub async fn delete_config(&self, id: &str) -> Result<()> {
        let config = self.store.get_config(id).await?;
        if let Some(apps) = &self.apps {
            if !config.argo_app_name.is_empty() {
                if let Err(e) = apps.delete_app(&config.argo_app_name).await {
                    warn!(app = %config.argo_app_name, error = %e, "Failed to delete Argo CD application");
                }
            }
        }
        self.store.delete_config(id).await
    }

    fn argo_app(&self, apps: &AppManager, config: &DeployConfig) -> ArgoApp {
        ArgoApp {
            name: config.argo_app_name.clone(),
            namespace: apps.namespace().to_string(),
            repo_url: config.repo_url.clone(),
            target_revision: config.target_revision.clone(),
            path: config.chart_path.clone(),
            dest_namespace: config.namespace.clone(),
            values_override: config.values_override.clone(),
            auto_sync: config.auto_sync || config.sync_policy == SyncPolicy::Auto,
            self_heal: config.self_heal,
            prune: config.prune,
            ..ArgoApp::default()
        }
    }

    /// Record a deployment, write GitOps overrides, and sync the application.
    ///
    /// An empty `revision` syncs the config's target revision. Failures mark
    /// the history failed and are returned; nothing is retried.
    ///
    /// Only a `Synced` result finalizes the history. Any other result leaves
    /// it `syncing` with the observed sync and health status, and no later
    /// step updates it; a subsequent sync records a new history.
    #[instrument(skip(self))]
    pub async fn trigger_sync(
        &self,
        config_id: &str,
        revision: &str,
        triggered_by: &str,
    ) -> Result<DeployHistory> {
        let config = self.store.get_config(config_id).await?;
        let revision = if revision.is_empty() {
            config.target_revision.clone()
        } else {
            revision.to_string()
        };

        let started = Utc::now();
        let mut history = self
            .store
            .insert_history(DeployHistory {
                id: new_id(),
                deploy_config_id: config.id.clone(),
                revision: revision.clone(),
                status: HistoryStatus::Syncing,
                sync_status: OUT_OF_SYNC.to_string(),
                health_status: String::new(),
                started_at: Some(started),
                finished_at: None,
                duration_secs: 0,
                triggered_by: triggered_by.to_string(),
                rollback_from: None,
                gitops_commit: None,
                error_message: String::new(),
                created_at: started,
            })
            .await?;
        self.publish(EventType::DeploySyncing, &config, &history);

        if let Some(gitops) = &self.gitops {
            if !config.values_override.is_empty() {
                let path = format!("{}/values.yaml", config.chart_path);
                match gitops
                    .update_values(
                        &config.repo_url,
                        &config.target_revision,
                        &path,
                        &config.values_override,
                    )
                    .await
                {
                    Ok(sha) => {
                        history.gitops_commit = Some(sha);
                        self.publish(EventType::GitOpsUpdate, &config, &history);
                    }
                    Err(e) => {
                        self.fail(&config, &mut history, started, &e).await?;
                        return Err(e);
                    }
                }
            }
        }

        if let Some(sync) = &self.sync {
            if !config.argo_app_name.is_empty() {
                let result = match self.sync_app(sync, &config.argo_app_name, &revision).await {
                    Ok(result) => result,
                    Err(e) => {
                        self.fail(&config, &mut history, started, &e).await?;
                        return Err(match e {
                            Error::SyncTimeout { .. } | Error::SyncCancelled { .. } => e,
                            other => Error::SyncFailed(other.public_message()),
                        });
                    }
                };
                history.sync_status = result.status;
                history.health_status = result.health;
                if !result.revision.is_empty() {
                    history.revision = result.revision;
                }
            }
        }

        if history.sync_status == SYNC_SYNCED {
            finish(&mut history, HistoryStatus::Succeeded, started);
            self.publish(EventType::DeploySucceeded, &config, &history);
        } else {
            info!(
                history_id = %history.id,
                sync_status = %history.sync_status,
                "Application not yet synced, history left syncing"
            );
        }
        self.store.update_history(&history).await?;
        info!(history_id = %history.id, status = ?history.status, "Deploy sync recorded");
        Ok(history)
    }

    async fn sync_app(&self, sync: &SyncController, app: &str, revision: &str) -> Result<SyncResult> {
        let result = sync.trigger_sync(app, revision).await?;
        match &self.wait {
            Some(wait) if !result.is_converged() => {
                sync.wait_for_sync(app, wait.timeout, &wait.cancel).await
            }
            _ => Ok(result),
        }
    }

    async fn fail(
        &self,
        config: &DeployConfig,
        history: &mut DeployHistory,
        started: DateTime<Utc>,
        error: &Error,
    ) -> Result<()> {
        history.error_message = error.to_string();
        finish(history, HistoryStatus::Failed, started);
        self.store.update_history(history).await?;
        self.publish(EventType::DeployFailed, config, history);
        warn!(history_id = %history.id, error = %error, "Deploy failed");
        Ok(())
    }

    /// Re-sync the revision recorded by `history_id` as a new history.
    ///
    /// The new history is always finalized: succeeded when the sync was
    /// accepted or no sync controller is wired, failed otherwise.
    #[instrument(skip(self))]
    pub async fn rollback(
        &self,
        config_id: &str,
        history_id: &str,
        triggered_by: &str,
    ) -> Result<DeployHistory> {
        let config = self.store.get_config(config_id).await?;
        let target = self.store.get_history(history_id).await?;
        if target.deploy_config_id != config.id {
            return Err(Error::RollbackFailed(format!(
                "history {history_id} does not belong to deploy config {config_id}"
            )));
        }
        if target.revision.is_empty() {
            return Err(Error::RollbackFailed(format!(
                "history {history_id} has no revision to roll back to"
            )));
        }

        let started = Utc::now();
        let mut history = self
            .store
            .insert_history(DeployHistory {
                id: new_id(),
                deploy_config_id: config.id.clone(),
                revision: target.revision.clone(),
                status: HistoryStatus::Syncing,
                sync_status: String::new(),
                health_status: String::new(),
                started_at: Some(started),
                finished_at: None,
                duration_secs: 0,
                triggered_by: triggered_by.to_string(),
                rollback_from: Some(target.id.clone()),
                gitops_commit: None,
                error_message: String::new(),
                created_at: started,
            })
            .await?;

        let outcome = match &self.sync {
            Some(sync) if !config.argo_app_name.is_empty() => {
                sync.trigger_sync(&config.argo_app_name, &target.revision)
                    .await
                    .map(Some)
            }
            _ => Ok(None),
        };
        match outcome {
            Ok(result) => {
                if let Some(result) = result {
                    history.sync_status = result.status;
                    history.health_status = result.health;
                }
                finish(&mut history, HistoryStatus::Succeeded, started);
            }
            Err(e) => {
                warn!(error = %e, "Rollback sync failed");
                history.error_message = e.to_string();
                finish(&mut history, HistoryStatus::Failed, started);
            }
        }

        self.store.update_history(&history).await?;
        self.publish(EventType::DeployRollback, &config, &history);
        info!(rollback_from = %target.id, status = ?history.status, "Rollback recorded");
        Ok(history)
    }

    pub async fn get_history(&self, id: &str) -> Result<DeployHistory> {
        self.store.get_history(id).await
    }

    pub async fn list_histories(&self, config_id: &str) -> Result<Vec<DeployHistory>> {
        self.store.list_histories(config_id).await
    }

    pub async fn get_status(&self, config_id: &str) -> Result<AppStatus> {
        let config = self.store.get_config(config_id).await?;
        match &self.apps {
            Some(apps) if !config.argo_app_name.is_empty() => {
                apps.get_status(&config.argo_app_name).await
            }
            _ => Ok(AppStatus::default()),
        }
    }

    pub async fn get_resources(&self, config_id: &str) -> Result<ResourceTree> {
        let config = self.store.get_config(config_id).await?;
        match &self.apps {
            Some(apps) if !config.argo_app_name.is_empty() => {
                apps.get_resource_tree(&config.argo_app_name).await
            }
            _ => Ok(ResourceTree::default()),
        }
    }

    pub async fn get_rollout_status(&self, config_id: &str) -> Result<RolloutStatus> {
        let (rollouts, name) = self.rollout_target(config_id).await?;
        rollouts.get_status(&name).await
    }

    pub async fn promote_rollout(&self, config_id: &str) -> Result<()> {
        let (rollouts, name) = self.rollout_target(config_id).await?;
        rollouts.promote(&name).await
    }

    pub async fn abort_rollout(&self, config_id: &str) -> Result<()> {
        let (rollouts, name) = self.rollout_target(config_id).await?;
        rollouts.abort(&name).await
    }

    async fn rollout_target(&self, config_id: &str) -> Result<(&RolloutController, String)> {
        let config = self.store.get_config(config_id).await?;
        let rollouts = self.rollouts.as_deref().ok_or(Error::RolloutUnavailable)?;
        Ok((rollouts, config.argo_app_name))
    }

    fn publish(&self, event_type: EventType, config: &DeployConfig, history: &DeployHistory) {
        self.notifier.notify(DomainEvent::new(
            event_type,
            &config.project_id,
            &history.triggered_by,
            json!({
                "deploy_config_id": config.id,
                "deploy_history_id": history.id,
                "app": config.argo_app_name,
                "revision": history.revision,
                "status": history.status,
                "gitops_commit": history.gitops_commit,
                "error": history.error_message,
            }),
        ));
    }
}

fn finish(history: &mut DeployHistory, status: HistoryStatus, started: DateTime<Utc>) {
    let now = Utc::now();
    history.status = status;
    history.finished_at = Some(now);
    history.duration_secs = (now - started).num_seconds().max(0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{MemoryResourceClient, ResourceClient};
    use crate::crd::ResourceKind;
    use crate::delivery::gitops::{lock_key, STUB_COMMIT_SHA};
    use crate::delivery::{LockStore, MemoryLockStore, StubRepository};
    use crate::services::store::MemoryStore;

    const ARGO_NS: &str = "argocd";

    fn config() -> DeployConfig {
        DeployConfig {
            project_id: "proj0001-long-id".into(),
            name: "api".into(),
            repo_url: "https://git.example.com/org/deploy.git".into(),
            chart_path: "charts/api".into(),
            namespace: "api-prod".into(),
            ..DeployConfig::default()
        }
    }

    struct Fixture {
        client: Arc<MemoryResourceClient>,
        locks: Arc<MemoryLockStore>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                client: Arc::new(MemoryResourceClient::new()),
                locks: Arc::new(MemoryLockStore::new()),
            }
        }

        fn service(&self) -> DeployService {
            let client: Arc<dyn ResourceClient> = self.client.clone();
            DeployService::new(Arc::new(MemoryStore::new()), Arc::new(Notifier::disabled()))
                .with_apps(Arc::new(AppManager::new(client.clone(), ARGO_NS)))
                .with_sync(Arc::new(
                    SyncController::new(client, ARGO_NS).with_poll_interval(Duration::from_secs(1)),
                ))
                .with_gitops(Arc::new(GitOpsWriter::new(
                    self.locks.clone(),
                    Arc::new(StubRepository),
                )))
        }

        async fn set_app_status(&self, app: &str, sync: &str, health: &str) {
            self.client
                .patch_merge(
                    ResourceKind::Application,
                    ARGO_NS,
                    app,
                    &json!({"status": {
                        "sync": {"status": sync, "revision": "abc123"},
                        "health": {"status": health},
                    }}),
                )
                .await
                .unwrap();
        }
    }

    #[test]
    fn app_name_uses_project_prefix() {
        assert_eq!(argo_app_name("0123456789abcdef", "web"), "zcicd-01234567-web");
        assert_eq!(argo_app_name("short", "web"), "zcicd-short-web");
    }

    #[tokio::test]
    async fn create_config_mirrors_application() {
        let fixture = Fixture::new();
        let service = fixture.service();
        let created = service.create_config(config()).await.unwrap();

        assert_eq!(created.argo_app_name, "zcicd-proj0001-api");
        assert_eq!(created.target_revision, "main");
        let app = fixture
            .client
            .get(ResourceKind::Application, ARGO_NS, "zcicd-proj0001-api")
            .await
            .unwrap();
        assert_eq!(app["spec"]["destination"]["namespace"], "api-prod");
    }

    #[tokio::test]
    async fn update_config_keeps_unset_fields() {
        let fixture = Fixture::new();
        let service = fixture.service();
        let created = service.create_config(config()).await.unwrap();

        let updated = service
            .update_config(
                &created.id,
                UpdateDeployConfig {
                    target_revision: Some("v2".into()),
                    name: Some(String::new()),
                    auto_sync: Some(true),
                    ..UpdateDeployConfig::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "api");
        assert_eq!(updated.target_revision, "v2");
        assert!(updated.auto_sync);

        let app = fixture
            .client
            .get(ResourceKind::Application, ARGO_NS, &created.argo_app_name)
            .await
            .unwrap();
        assert_eq!(app["spec"]["source"]["targetRevision"], "v2");
    }

    #[tokio::test]
    async fn synced_result_marks_history_succeeded() {
        let fixture = Fixture::new();
        let service = fixture.service();
        let created = service.create_config(config()).await.unwrap();
        fixture
            .set_app_status(&created.argo_app_name, "Synced", "Healthy")
            .await;

        let history = service.trigger_sync(&created.id, "", "alice").await.unwrap();
        assert_eq!(history.status, HistoryStatus::Succeeded);
        assert_eq!(history.revision, "abc123");
        assert!(history.finished_at.is_some());
        assert!(history.gitops_commit.is_none());
    }

    #[tokio::test]
    async fn missing_application_fails_history() {
        let fixture = Fixture::new();
        let client: Arc<dyn ResourceClient> = fixture.client.clone();
        let store = Arc::new(MemoryStore::new());
        let service = DeployService::new(store, Arc::new(Notifier::disabled()))
            .with_sync(Arc::new(SyncController::new(client, ARGO_NS)));
        let created = service.create_config(config()).await.unwrap();

        let err = service.trigger_sync(&created.id, "v1", "alice").await.unwrap_err();
        assert_eq!(err.code(), crate::error::codes::DEPLOY_SYNC_FAILED);

        let histories = service.list_histories(&created.id).await.unwrap();
        assert_eq!(histories.len(), 1);
        assert_eq!(histories[0].status, HistoryStatus::Failed);
        assert!(!histories[0].error_message.is_empty());
        assert!(histories[0].finished_at.is_some());
    }

    #[tokio::test]
    async fn gitops_write_records_commit() {
        let fixture = Fixture::new();
        let service = fixture.service();
        let mut cfg = config();
        cfg.values_override = BTreeMap::from([("replicas".to_string(), json!(3))]);
        let created = service.create_config(cfg).await.unwrap();

        let history = service.trigger_sync(&created.id, "", "alice").await.unwrap();
        assert_eq!(history.gitops_commit.as_deref(), Some(STUB_COMMIT_SHA));
        assert_eq!(history.status, HistoryStatus::Syncing);
    }

    #[tokio::test]
    async fn held_gitops_lock_fails_fast() {
        let fixture = Fixture::new();
        let service = fixture.service();
        let mut cfg = config();
        cfg.values_override = BTreeMap::from([("replicas".to_string(), json!(3))]);
        let created = service.create_config(cfg).await.unwrap();

        let key = lock_key(&created.repo_url);
        assert!(fixture
            .locks
            .try_acquire(&key, Duration::from_secs(60))
            .await
            .unwrap());

        let err = service.trigger_sync(&created.id, "", "alice").await.unwrap_err();
        assert!(matches!(err, Error::LockHeld { .. }));
        assert!(err.is_retryable());
        let histories = service.list_histories(&created.id).await.unwrap();
        assert_eq!(histories[0].status, HistoryStatus::Failed);
    }

    #[tokio::test]
    async fn unsynced_result_leaves_history_syncing() {
        let fixture = Fixture::new();
        let service = fixture.service();
        let created = service.create_config(config()).await.unwrap();
        fixture
            .set_app_status(&created.argo_app_name, "OutOfSync", "Progressing")
            .await;

        let history = service.trigger_sync(&created.id, "v2", "alice").await.unwrap();
        assert_eq!(history.status, HistoryStatus::Syncing);
        assert_eq!(history.sync_status, "OutOfSync");
        assert_eq!(history.health_status, "Progressing");
        assert!(history.finished_at.is_none());

        let stored = service.get_history(&history.id).await.unwrap();
        assert_eq!(stored, history);
    }

    #[tokio::test(start_paused = true)]
    async fn convergence_timeout_fails_history() {
        let fixture = Fixture::new();
        let service = fixture
            .service()
            .with_sync_wait(Duration::from_secs(5), CancellationToken::new());
        let created = service.create_config(config()).await.unwrap();
        fixture
            .set_app_status(&created.argo_app_name, "OutOfSync", "Progressing")
            .await;

        let err = service.trigger_sync(&created.id, "", "alice").await.unwrap_err();
        assert!(matches!(err, Error::SyncTimeout { timeout_secs: 5, .. }));
        let histories = service.list_histories(&created.id).await.unwrap();
        assert_eq!(histories[0].status, HistoryStatus::Failed);
    }

    #[tokio::test]
    async fn rollback_points_at_target_history() {
        let fixture = Fixture::new();
        let service = fixture.service();
        let created = service.create_config(config()).await.unwrap();
        fixture
            .set_app_status(&created.argo_app_name, "Synced", "Healthy")
            .await;
        let first = service.trigger_sync(&created.id, "v1", "alice").await.unwrap();

        let rollback = service.rollback(&created.id, &first.id, "bob").await.unwrap();
        assert_eq!(rollback.rollback_from.as_deref(), Some(first.id.as_str()));
        assert_eq!(rollback.revision, first.revision);
        assert_eq!(rollback.status, HistoryStatus::Succeeded);
        assert!(rollback.finished_at.is_some());
    }

    #[tokio::test]
    async fn status_without_app_manager_is_unknown() {
        let service = DeployService::new(Arc::new(MemoryStore::new()), Arc::new(Notifier::disabled()));
        let created = service.create_config(config()).await.unwrap();
        let status = service.get_status(&created.id).await.unwrap();
        assert_eq!(status.sync_status, "Unknown");
        assert_eq!(status.health_status, "Unknown");
        assert!(service.get_resources(&created.id).await.unwrap().nodes.is_empty());
    }

    #[tokio::test]
    async fn rollout_ops_need_a_controller() {
        let fixture = Fixture::new();
        let service = fixture.service();
        let created = service.create_config(config()).await.unwrap();

        let err = service.promote_rollout(&created.id).await.unwrap_err();
        assert!(matches!(err, Error::RolloutUnavailable));
        assert!(matches!(
            service.abort_rollout(&created.id).await,
            Err(Error::RolloutUnavailable)
        ));
        assert_eq!(service.get_config(&created.id).await.unwrap(), created);
        assert!(service.list_histories(&created.id).await.unwrap().is_empty());
    }
}

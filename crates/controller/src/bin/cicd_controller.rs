/*
 * zcicd Control Plane - Controller Service
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Controller Service - CI/CD control plane
//!
//! This service:
//! - Submits Tekton `PipelineRun`/`TaskRun` resources and watches their status
//! - Relays build logs as Server-Sent Events
//! - Syncs, rolls back, and promotes Argo CD deployments
//! - Triggers workflows from GitHub and GitLab push webhooks

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post},
    Router,
};
use cicd_controller::config::{ClusterMode, ControllerConfig, WebhookSecrets};
use cicd_controller::crd::AppStatus;
use cicd_controller::delivery::{
    AppManager, GitOpsWriter, HealthMonitor, LockStore, MemoryLockStore, RedisLockStore,
    RolloutController, StubRepository, SyncController,
};
use cicd_controller::execution::{LogRelay, RunSubmitter, StatusWatcher};
use cicd_controller::services::models::{BuildConfig, DeployConfig, Workflow};
use cicd_controller::services::{
    run_status_pump, status_channel, ApprovalService, BuildService, DeployService, MemoryStore,
    RunOwner, RunTracker, TriggerBuild, TriggerWorkflow, UpdateDeployConfig, WorkflowService,
};
use cicd_controller::templates::TemplateRenderer;
use cicd_controller::webhooks::{
    parse_github_push, parse_gitlab_push, verify_github_signature, verify_gitlab_token, PushEvent,
    GITHUB_EVENT_HEADER, GITHUB_PUSH_EVENT, GITHUB_SIGNATURE_HEADER, GITLAB_EVENT_HEADER,
    GITLAB_PUSH_EVENT, GITLAB_TOKEN_HEADER,
};
use cicd_controller::{
    load_controller_config, Error, KindRegistry, KubeResourceClient, MemoryResourceClient,
    ResourceClient, ResourceKind,
};
use futures::stream::StreamExt;
use notify::{LogChannel, Notifier, NotifyChannel, WebhookChannel};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    cors::CorsLayer,
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Clone)]
struct AppState {
    builds: Arc<BuildService>,
    workflows: Arc<WorkflowService>,
    deploys: Arc<DeployService>,
    approvals: Arc<ApprovalService>,
    logs: Option<Arc<LogRelay>>,
    secrets: Arc<WebhookSecrets>,
    watchers: Arc<[Arc<StatusWatcher>; 2]>,
    shutdown: CancellationToken,
}

/// Domain error rendered as `{code, message}`.
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            error!(error = %self.0, code = self.0.code(), "Request failed");
        } else {
            debug!(error = %self.0, code = self.0.code(), "Request rejected");
        }
        (
            status,
            Json(json!({
                "code": self.0.code(),
                "message": self.0.public_message(),
            })),
        )
            .into_response()
    }
}

fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::NotFound { .. } => StatusCode::NOT_FOUND,
        Error::LockHeld { .. } | Error::RunNumberConflict { .. } | Error::AlreadyDecided => {
            StatusCode::CONFLICT
        }
        Error::InvalidState(_)
        | Error::WorkflowDisabled(_)
        | Error::SyncFailed(_)
        | Error::RollbackFailed(_)
        | Error::SyncTimeout { .. }
        | Error::SyncCancelled { .. }
        | Error::RolloutUnavailable => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,cicd_controller=debug".into());
    let json_output = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json_output {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn build_notifier(config: &ControllerConfig) -> Notifier {
    let notifier = Notifier::from_env();
    match config.events.webhook_url.as_deref() {
        Some(url) if notifier.has_channels() && notifier.channel_count() == 1 => {
            info!("Event webhook channel enabled from configuration");
            let channels: Vec<Arc<dyn NotifyChannel>> = vec![
                Arc::new(LogChannel),
                Arc::new(WebhookChannel::new(url.to_string())),
            ];
            Notifier::with_channels(channels)
        }
        _ => notifier,
    }
}

async fn connect_locks(config: &ControllerConfig) -> Arc<dyn LockStore> {
    if config.redis.disabled {
        info!("Redis disabled, GitOps locks are process-local");
        return Arc::new(MemoryLockStore::new());
    }
    match RedisLockStore::connect(&config.redis.url).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            warn!(error = %e, "Failed to connect GitOps lock store, falling back to process-local locks");
            Arc::new(MemoryLockStore::new())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!(
        "Starting zcicd Controller Service v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = load_controller_config();
    config.validate().context("invalid controller configuration")?;
    let exec_ns = config.cluster.execution_namespace.clone();
    let argo_ns = config.cluster.argo_namespace.clone();

    let (client, kube_client): (Arc<dyn ResourceClient>, Option<kube::Client>) =
        match config.cluster.mode {
            ClusterMode::Kube => {
                let kube_client = kube::Client::try_default()
                    .await
                    .context("failed to create Kubernetes client")?;
                info!("Connected to Kubernetes cluster");
                let client: Arc<dyn ResourceClient> = Arc::new(KubeResourceClient::new(
                    kube_client.clone(),
                    KindRegistry::standard(),
                ));
                (client, Some(kube_client))
            }
            ClusterMode::Memory => {
                warn!("Running with the in-memory resource client, nothing reaches a cluster");
                let client: Arc<dyn ResourceClient> = Arc::new(MemoryResourceClient::new());
                (client, None)
            }
        };

    let shutdown = CancellationToken::new();
    let notifier = Arc::new(build_notifier(&config));
    let store = Arc::new(MemoryStore::new());

    let logs = if config.redis.disabled {
        None
    } else {
        match LogRelay::connect(&config.redis.url, kube_client).await {
            Ok(relay) => Some(Arc::new(relay)),
            Err(e) => {
                warn!(error = %e, "Log relay unavailable");
                None
            }
        }
    };

    // Execution engine
    let renderer = TemplateRenderer::new().context("failed to load execution templates")?;
    let submitter = Arc::new(RunSubmitter::new(client.clone(), renderer));
    let task_runs = Arc::new(StatusWatcher::new(
        client.clone(),
        ResourceKind::TaskRun,
        &exec_ns,
    ));
    let pipeline_runs = Arc::new(StatusWatcher::new(
        client.clone(),
        ResourceKind::PipelineRun,
        &exec_ns,
    ));
    let (updates_tx, updates_rx) = status_channel();

    let mut builds = BuildService::new(store.clone(), notifier.clone(), &exec_ns)
        .with_submitter(submitter.clone())
        .with_tracker(Arc::new(RunTracker::new(
            RunOwner::Build,
            task_runs.clone(),
            updates_tx.clone(),
        )));
    if let Some(relay) = &logs {
        builds = builds.with_log_relay(relay.clone(), shutdown.clone());
    }
    let builds = Arc::new(builds);
    let workflows = Arc::new(
        WorkflowService::new(store.clone(), notifier.clone(), &exec_ns)
            .with_submitter(submitter)
            .with_tracker(Arc::new(RunTracker::new(
                RunOwner::Workflow,
                pipeline_runs.clone(),
                updates_tx,
            ))),
    );

    // Delivery engine
    let gitops = GitOpsWriter::new(connect_locks(&config).await, Arc::new(StubRepository))
        .with_lock_ttl(config.delivery.lock_ttl());
    let mut deploys = DeployService::new(store.clone(), notifier.clone())
        .with_apps(Arc::new(AppManager::new(client.clone(), &argo_ns)))
        .with_sync(Arc::new(
            SyncController::new(client.clone(), &argo_ns)
                .with_poll_interval(config.delivery.poll_interval()),
        ))
        .with_rollouts(Arc::new(RolloutController::new(
            client.clone(),
            &config.cluster.rollout_namespace,
        )))
        .with_gitops(Arc::new(gitops));
    if config.delivery.wait_for_convergence {
        deploys = deploys.with_sync_wait(config.delivery.sync_timeout(), shutdown.child_token());
    }
    let approvals = Arc::new(ApprovalService::new(store.clone(), store));

    // Background tasks
    task_runs.start(&shutdown);
    pipeline_runs.start(&shutdown);
    let health = HealthMonitor::new(client.clone(), &argo_ns);
    health.start(
        &shutdown,
        Arc::new(|app: &str, status: &AppStatus| {
            info!(
                app,
                sync = %status.sync_status,
                health = %status.health_status,
                "Application state changed"
            );
        }),
    );
    let pump = tokio::spawn(run_status_pump(
        updates_rx,
        builds.clone(),
        workflows.clone(),
        shutdown.clone(),
    ));

    let state = AppState {
        builds,
        workflows,
        deploys: Arc::new(deploys),
        approvals,
        logs,
        secrets: Arc::new(config.webhooks.clone()),
        watchers: Arc::new([task_runs.clone(), pipeline_runs.clone()]),
        shutdown: shutdown.clone(),
    };

    let app = build_router(state, config.server.request_timeout());

    let listener = tokio::net::TcpListener::bind(&config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen_addr))?;
    info!("Controller HTTP server listening on {}", config.server.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    task_runs.shutdown().await;
    pipeline_runs.shutdown().await;
    health.shutdown().await;
    if let Err(e) = pump.await {
        warn!(error = %e, "Status pump ended abnormally");
    }
    info!("Controller service stopped");

    Ok(())
}

/// All HTTP routes over `state`. Each request is bounded by `request_timeout`.
fn build_router(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/webhooks/github", post(github_webhook))
        .route("/webhooks/gitlab", post(gitlab_webhook))
        .route("/api/v1/builds", post(create_build_config))
        .route("/api/v1/builds/{config_id}", get(get_build_config))
        .route(
            "/api/v1/builds/{config_id}/runs",
            post(trigger_build).get(list_build_runs),
        )
        .route("/api/v1/builds/runs/{run_id}", get(get_build_run))
        .route("/api/v1/builds/runs/{run_id}/cancel", post(cancel_build))
        .route("/api/v1/builds/runs/{run_id}/logs", get(build_logs))
        .route("/api/v1/workflows", post(create_workflow))
        .route("/api/v1/workflows/{workflow_id}", get(get_workflow))
        .route(
            "/api/v1/workflows/{workflow_id}/runs",
            post(trigger_workflow).get(list_workflow_runs),
        )
        .route("/api/v1/workflows/runs/{run_id}", get(get_workflow_run))
        .route("/api/v1/workflows/runs/{run_id}/cancel", post(cancel_workflow))
        .route("/api/v1/workflows/runs/{run_id}/retry", post(retry_workflow))
        .route("/api/v1/deploys", post(create_deploy_config))
        .route(
            "/api/v1/deploys/{config_id}",
            get(get_deploy_config)
                .put(update_deploy_config)
                .delete(delete_deploy_config),
        )
        .route("/api/v1/deploys/{config_id}/histories", get(list_deploy_histories))
        .route("/api/v1/deploys/histories/{history_id}", get(get_deploy_history))
        .route("/api/v1/deploys/{config_id}/sync", post(sync_deploy))
        .route("/api/v1/deploys/{config_id}/rollback", post(rollback_deploy))
        .route("/api/v1/deploys/{config_id}/status", get(deploy_status))
        .route("/api/v1/deploys/{config_id}/resources", get(deploy_resources))
        .route("/api/v1/deploys/{config_id}/rollout", get(rollout_status))
        .route("/api/v1/deploys/{config_id}/rollout/promote", post(promote_rollout))
        .route("/api/v1/deploys/{config_id}/rollout/abort", post(abort_rollout))
        .route("/api/v1/approvals", post(create_approval))
        .route("/api/v1/approvals/pending", get(list_pending_approvals))
        .route("/api/v1/approvals/{approval_id}", get(get_approval))
        .route("/api/v1/approvals/{approval_id}/approve", post(approve))
        .route("/api/v1/approvals/{approval_id}/reject", post(reject))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                        .on_request(DefaultOnRequest::new().level(Level::INFO))
                        .on_response(DefaultOnResponse::new().level(Level::INFO)),
                )
                .layer(CorsLayer::permissive())
                .layer(TimeoutLayer::new(request_timeout)),
        )
        .with_state(state)
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "cicd-controller",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn readiness_check(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    if !state.watchers.iter().all(|w| w.is_running()) {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    Ok(Json(json!({
        "status": "ready",
        "service": "cicd-controller",
        "version": env!("CARGO_PKG_VERSION")
    })))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

fn ignored(reason: String) -> Json<Value> {
    Json(json!({"status": "ignored", "reason": reason}))
}

async fn github_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, StatusCode> {
    if let Some(secret) = state.secrets.github_secret.as_deref() {
        let signature = header_str(&headers, GITHUB_SIGNATURE_HEADER);
        if !verify_github_signature(&body, signature, secret) {
            warn!("Rejected GitHub webhook with invalid signature");
            return Err(StatusCode::FORBIDDEN);
        }
    }

    let event = header_str(&headers, GITHUB_EVENT_HEADER);
    if event != GITHUB_PUSH_EVENT {
        return Ok(ignored(format!("event '{event}' is not a push")));
    }
    let push = parse_github_push(&body).map_err(|e| {
        warn!(error = %e, "Invalid GitHub push payload");
        StatusCode::BAD_REQUEST
    })?;
    trigger_push(&state, &push).await
}

async fn gitlab_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, StatusCode> {
    if let Some(secret) = state.secrets.gitlab_secret.as_deref() {
        if !verify_gitlab_token(header_str(&headers, GITLAB_TOKEN_HEADER), secret) {
            warn!("Rejected GitLab webhook with invalid token");
            return Err(StatusCode::FORBIDDEN);
        }
    }

    let event = header_str(&headers, GITLAB_EVENT_HEADER);
    if event != GITLAB_PUSH_EVENT {
        return Ok(ignored(format!("event '{event}' is not a push")));
    }
    let push = parse_gitlab_push(&body).map_err(|e| {
        warn!(error = %e, "Invalid GitLab push payload");
        StatusCode::BAD_REQUEST
    })?;
    trigger_push(&state, &push).await
}

async fn trigger_push(state: &AppState, push: &PushEvent) -> Result<Json<Value>, StatusCode> {
    match state.workflows.trigger_by_webhook(push).await {
        Ok(triggered) => Ok(Json(json!({"status": "accepted", "triggered": triggered}))),
        Err(e) => {
            error!(error = %e, "Failed to trigger workflows from push");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

type Created = Result<(StatusCode, Json<Value>), ApiError>;

async fn create_build_config(
    State(state): State<AppState>,
    Json(config): Json<BuildConfig>,
) -> Created {
    let config = state.builds.create_config(config).await?;
    Ok((StatusCode::CREATED, Json(json!(config))))
}

async fn get_build_config(
    State(state): State<AppState>,
    Path(config_id): Path<String>,
) -> ApiResult<Value> {
    let config = state.builds.get_config(&config_id).await?;
    Ok(Json(json!(config)))
}

async fn list_build_runs(
    State(state): State<AppState>,
    Path(config_id): Path<String>,
) -> ApiResult<Value> {
    let runs = state.builds.list_runs(&config_id).await?;
    Ok(Json(json!(runs)))
}

async fn get_build_run(State(state): State<AppState>, Path(run_id): Path<String>) -> ApiResult<Value> {
    let run = state.builds.get_run(&run_id).await?;
    Ok(Json(json!(run)))
}

async fn trigger_build(
    State(state): State<AppState>,
    Path(config_id): Path<String>,
    Json(req): Json<TriggerBuild>,
) -> ApiResult<Value> {
    let run = state.builds.trigger_build(&config_id, req).await?;
    Ok(Json(json!(run)))
}

async fn cancel_build(State(state): State<AppState>, Path(run_id): Path<String>) -> ApiResult<Value> {
    let run = state.builds.cancel_run(&run_id).await?;
    Ok(Json(json!(run)))
}

/// Build log lines as Server-Sent Events.
///
/// Finished runs replay the archived log; others follow the live channel.
async fn build_logs(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Response, ApiError> {
    let run = state.builds.get_run(&run_id).await?;
    let relay = state
        .logs
        .as_ref()
        .ok_or_else(|| Error::Internal("log relay is not configured".to_string()))?;

    if run.status.is_terminal() {
        if let Some(archived) = relay.archived(&run_id).await? {
            let events: Vec<Result<Event, Infallible>> = archived
                .lines()
                .map(|line| Ok(Event::default().data(line)))
                .collect();
            return Ok(Sse::new(futures::stream::iter(events).boxed()).into_response());
        }
    }

    let lines = relay.subscribe(&run_id, state.shutdown.child_token()).await?;
    let stream = futures::stream::unfold(lines, |mut lines| async move {
        let line = lines.recv().await?;
        Some((Ok::<_, Infallible>(Event::default().data(line)), lines))
    });
    Ok(Sse::new(stream.boxed()).keep_alive(KeepAlive::default()).into_response())
}

async fn create_workflow(
    State(state): State<AppState>,
    Json(workflow): Json<Workflow>,
) -> Created {
    let workflow = state.workflows.create_workflow(workflow).await?;
    Ok((StatusCode::CREATED, Json(json!(workflow))))
}

async fn get_workflow(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
) -> ApiResult<Value> {
    let workflow = state.workflows.get_workflow(&workflow_id).await?;
    Ok(Json(json!(workflow)))
}

async fn list_workflow_runs(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
) -> ApiResult<Value> {
    let runs = state.workflows.list_runs(&workflow_id).await?;
    Ok(Json(json!(runs)))
}

async fn get_workflow_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<Value> {
    let run = state.workflows.get_run(&run_id).await?;
    Ok(Json(json!(run)))
}

async fn trigger_workflow(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
    Json(req): Json<TriggerWorkflow>,
) -> ApiResult<Value> {
    let run = state.workflows.trigger(&workflow_id, req).await?;
    Ok(Json(json!(run)))
}

async fn cancel_workflow(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<Value> {
    let run = state.workflows.cancel_run(&run_id).await?;
    Ok(Json(json!(run)))
}

#[derive(Debug, Default, Deserialize)]
struct ActorRequest {
    #[serde(default)]
    triggered_by: String,
}

async fn retry_workflow(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Json(req): Json<ActorRequest>,
) -> ApiResult<Value> {
    let run = state.workflows.retry_run(&run_id, &req.triggered_by).await?;
    Ok(Json(json!(run)))
}

async fn create_deploy_config(
    State(state): State<AppState>,
    Json(config): Json<DeployConfig>,
) -> Created {
    let config = state.deploys.create_config(config).await?;
    Ok((StatusCode::CREATED, Json(json!(config))))
}

async fn get_deploy_config(
    State(state): State<AppState>,
    Path(config_id): Path<String>,
) -> ApiResult<Value> {
    let config = state.deploys.get_config(&config_id).await?;
    Ok(Json(json!(config)))
}

async fn update_deploy_config(
    State(state): State<AppState>,
    Path(config_id): Path<String>,
    Json(update): Json<UpdateDeployConfig>,
) -> ApiResult<Value> {
    let config = state.deploys.update_config(&config_id, update).await?;
    Ok(Json(json!(config)))
}

async fn delete_deploy_config(
    State(state): State<AppState>,
    Path(config_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.deploys.delete_config(&config_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_deploy_histories(
    State(state): State<AppState>,
    Path(config_id): Path<String>,
) -> ApiResult<Value> {
    let histories = state.deploys.list_histories(&config_id).await?;
    Ok(Json(json!(histories)))
}

async fn get_deploy_history(
    State(state): State<AppState>,
    Path(history_id): Path<String>,
) -> ApiResult<Value> {
    let history = state.deploys.get_history(&history_id).await?;
    Ok(Json(json!(history)))
}

#[derive(Debug, Default, Deserialize)]
struct SyncRequest {
    #[serde(default)]
    revision: String,
    #[serde(default)]
    triggered_by: String,
}

async fn sync_deploy(
    State(state): State<AppState>,
    Path(config_id): Path<String>,
    Json(req): Json<SyncRequest>,
) -> ApiResult<Value> {
    let history = state
        .deploys
        .trigger_sync(&config_id, &req.revision, &req.triggered_by)
        .await?;
    Ok(Json(json!(history)))
}

#[derive(Debug, Deserialize)]
struct RollbackRequest {
    history_id: String,
    #[serde(default)]
    triggered_by: String,
}

async fn rollback_deploy(
    State(state): State<AppState>,
    Path(config_id): Path<String>,
    Json(req): Json<RollbackRequest>,
) -> ApiResult<Value> {
    let history = state
        .deploys
        .rollback(&config_id, &req.history_id, &req.triggered_by)
        .await?;
    Ok(Json(json!(history)))
}

async fn deploy_status(
    State(state): State<AppState>,
    Path(config_id): Path<String>,
) -> ApiResult<Value> {
    let status = state.deploys.get_status(&config_id).await?;
    Ok(Json(json!(status)))
}

async fn deploy_resources(
    State(state): State<AppState>,
    Path(config_id): Path<String>,
) -> ApiResult<Value> {
    let tree = state.deploys.get_resources(&config_id).await?;
    Ok(Json(json!(tree)))
}

async fn rollout_status(
    State(state): State<AppState>,
    Path(config_id): Path<String>,
) -> ApiResult<Value> {
    let status = state.deploys.get_rollout_status(&config_id).await?;
    Ok(Json(json!(status)))
}

async fn promote_rollout(
    State(state): State<AppState>,
    Path(config_id): Path<String>,
) -> ApiResult<Value> {
    state.deploys.promote_rollout(&config_id).await?;
    Ok(Json(json!({"status": "promoted"})))
}

async fn abort_rollout(
    State(state): State<AppState>,
    Path(config_id): Path<String>,
) -> ApiResult<Value> {
    state.deploys.abort_rollout(&config_id).await?;
    Ok(Json(json!({"status": "aborted"})))
}

#[derive(Debug, Deserialize)]
struct ApprovalRequest {
    deploy_history_id: String,
    #[serde(default)]
    environment_id: String,
    #[serde(default)]
    requested_by: String,
}

async fn create_approval(
    State(state): State<AppState>,
    Json(req): Json<ApprovalRequest>,
) -> Created {
    let record = state
        .approvals
        .create_approval(&req.deploy_history_id, &req.environment_id, &req.requested_by)
        .await?;
    Ok((StatusCode::CREATED, Json(json!(record))))
}

async fn list_pending_approvals(State(state): State<AppState>) -> ApiResult<Value> {
    let pending = state.approvals.list_pending().await?;
    Ok(Json(json!(pending)))
}

async fn get_approval(
    State(state): State<AppState>,
    Path(approval_id): Path<String>,
) -> ApiResult<Value> {
    let record = state.approvals.get(&approval_id).await?;
    Ok(Json(json!(record)))
}

#[derive(Debug, Deserialize)]
struct DecisionRequest {
    approver_id: String,
    #[serde(default)]
    comment: String,
}

async fn approve(
    State(state): State<AppState>,
    Path(approval_id): Path<String>,
    Json(req): Json<DecisionRequest>,
) -> ApiResult<Value> {
    let record = state
        .approvals
        .approve(&approval_id, &req.approver_id, &req.comment)
        .await?;
    Ok(Json(json!(record)))
}

async fn reject(
    State(state): State<AppState>,
    Path(approval_id): Path<String>,
    Json(req): Json<DecisionRequest>,
) -> ApiResult<Value> {
    let record = state
        .approvals
        .reject(&approval_id, &req.approver_id, &req.comment)
        .await?;
    Ok(Json(json!(record)))
}

/// Resolves on Ctrl+C or SIGTERM and cancels `shutdown`.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
    shutdown.cancel();
}

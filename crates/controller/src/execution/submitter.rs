//! Render-and-submit for execution runs.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{info, instrument, warn};

use crate::client::ResourceClient;
use crate::crd::ResourceKind;
use crate::error::Result;
use crate::templates::{
    pipeline_run_name, task_run_name, BuildModel, TemplateRenderer, WorkflowModel,
};

pub const BUILD_CONFIG_LABEL: &str = "zcicd.io/build-config-id";
pub const WORKFLOW_LABEL: &str = "zcicd.io/workflow-id";

/// Value written to `spec.status` to cancel a Tekton run while still running
/// its `finally` tasks.
pub const CANCEL_STATUS: &str = "CancelledRunFinally";

/// External reference to a submitted execution resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedRun {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
}

/// Builds manifests and submits them through a [`ResourceClient`].
pub struct RunSubmitter {
    client: Arc<dyn ResourceClient>,
    renderer: TemplateRenderer,
}

impl RunSubmitter {
    pub fn new(client: Arc<dyn ResourceClient>, renderer: TemplateRenderer) -> Self {
        Self { client, renderer }
    }

    /// Render and create a `TaskRun` for a build.
    #[instrument(skip(self, model), fields(build_config_id = %model.build_config_id, run_number = model.run_number))]
    pub async fn submit_build(&self, model: &BuildModel) -> Result<SubmittedRun> {
        let manifest = self.renderer.render_task_run(model)?;
        self.client
            .create(manifest.kind, &manifest.namespace, &manifest.document)
            .await?;
        info!(name = %manifest.name, "Submitted build TaskRun");
        Ok(SubmittedRun {
            kind: manifest.kind,
            namespace: manifest.namespace,
            name: manifest.name,
        })
    }

    /// Render and create a `PipelineRun` for a workflow.
    #[instrument(skip(self, model), fields(workflow_id = %model.workflow_id, run_number = model.run_number))]
    pub async fn submit_workflow(&self, model: &WorkflowModel) -> Result<SubmittedRun> {
        let manifest = self.renderer.render_pipeline_run(model)?;
        self.client
            .create(manifest.kind, &manifest.namespace, &manifest.document)
            .await?;
        info!(name = %manifest.name, "Submitted workflow PipelineRun");
        Ok(SubmittedRun {
            kind: manifest.kind,
            namespace: manifest.namespace,
            name: manifest.name,
        })
    }

    /// Cancel a build run located by its deterministic name.
    pub async fn cancel_build(
        &self,
        namespace: &str,
        build_config_id: &str,
        run_number: u32,
    ) -> Result<()> {
        let name = task_run_name(build_config_id, run_number);
        self.cancel(ResourceKind::TaskRun, namespace, &name).await
    }

    /// Cancel a workflow run located by its deterministic name.
    pub async fn cancel_workflow(
        &self,
        namespace: &str,
        workflow_id: &str,
        run_number: u32,
    ) -> Result<()> {
        let name = pipeline_run_name(workflow_id, run_number);
        self.cancel(ResourceKind::PipelineRun, namespace, &name).await
    }

    #[instrument(skip(self))]
    pub async fn cancel(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<()> {
        let patch = json!({ "spec": { "status": CANCEL_STATUS } });
        match self.client.patch_merge(kind, namespace, name, &patch).await {
            Ok(_) => {
                info!("Requested run cancellation");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Failed to cancel run");
                Err(e)
            }
        }
    }

    /// Execution resources created for a build config.
    pub async fn list_build_runs(&self, namespace: &str, build_config_id: &str) -> Result<Vec<Value>> {
        self.client
            .list(
                ResourceKind::TaskRun,
                namespace,
                &format!("{BUILD_CONFIG_LABEL}={build_config_id}"),
            )
            .await
    }

    /// Execution resources created for a workflow.
    pub async fn list_workflow_runs(&self, namespace: &str, workflow_id: &str) -> Result<Vec<Value>> {
        self.client
            .list(
                ResourceKind::PipelineRun,
                namespace,
                &format!("{WORKFLOW_LABEL}={workflow_id}"),
            )
            .await
    }

    /// Remove an execution resource.
    pub async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<()> {
        self.client.delete(kind, namespace, name).await
    }
}

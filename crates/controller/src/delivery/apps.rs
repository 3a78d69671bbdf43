//! Argo CD `Application` lifecycle.

use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::client::ResourceClient;
use crate::crd::{nested_str, AppStatus, ArgoApp, ResourceKind, ResourceTree};
use crate::error::Result;

/// Creates, updates, and reads applications in the Argo CD namespace.
pub struct AppManager {
    client: Arc<dyn ResourceClient>,
    namespace: String,
}

impl AppManager {
    pub fn new(client: Arc<dyn ResourceClient>, argo_namespace: &str) -> Self {
        Self {
            client,
            namespace: argo_namespace.to_string(),
        }
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[instrument(skip(self, app), fields(app = %app.name))]
    pub async fn create_app(&self, app: &ArgoApp) -> Result<()> {
        let manifest = app.to_manifest(&self.namespace)?;
        let namespace = nested_str(&manifest, &["metadata", "namespace"]);
        self.client
            .create(ResourceKind::Application, &namespace, &manifest)
            .await?;
        info!("Created Argo CD application");
        Ok(())
    }

    /// Replace the application spec, carrying over the live `resourceVersion`.
    #[instrument(skip(self, app), fields(app = %app.name))]
    pub async fn update_app(&self, app: &ArgoApp) -> Result<()> {
        let mut manifest = app.to_manifest(&self.namespace)?;
        let namespace = nested_str(&manifest, &["metadata", "namespace"]);
        let existing = self
            .client
            .get(ResourceKind::Application, &namespace, &app.name)
            .await?;

        let version = nested_str(&existing, &["metadata", "resourceVersion"]);
        if !version.is_empty() {
            manifest["metadata"]["resourceVersion"] = version.into();
        }
        self.client
            .update(ResourceKind::Application, &namespace, &manifest)
            .await?;
        info!("Updated Argo CD application");
        Ok(())
    }

    pub async fn delete_app(&self, name: &str) -> Result<()> {
        self.client
            .delete(ResourceKind::Application, &self.namespace, name)
            .await?;
        info!(app = %name, "Deleted Argo CD application");
        Ok(())
    }

    pub async fn get_app(&self, name: &str) -> Result<ArgoApp> {
        let doc = self
            .client
            .get(ResourceKind::Application, &self.namespace, name)
            .await?;
        Ok(ArgoApp::from_manifest(&doc))
    }

    pub async fn get_status(&self, name: &str) -> Result<AppStatus> {
        let doc = self
            .client
            .get(ResourceKind::Application, &self.namespace, name)
            .await?;
        let status = AppStatus::from_doc(&doc);
        debug!(app = %name, sync = %status.sync_status, health = %status.health_status, "Read application status");
        Ok(status)
    }

    pub async fn get_resource_tree(&self, name: &str) -> Result<ResourceTree> {
        let doc = self
            .client
            .get(ResourceKind::Application, &self.namespace, name)
            .await?;
        Ok(ResourceTree::from_doc(&doc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MemoryResourceClient;
    use serde_json::json;

    fn app() -> ArgoApp {
        ArgoApp {
            name: "zcicd-0a1b2c3d-api".into(),
            repo_url: "https://git.example.com/org/deploy.git".into(),
            target_revision: "main".into(),
            path: "charts/api".into(),
            dest_namespace: "staging".into(),
            ..ArgoApp::default()
        }
    }

    #[tokio::test]
    async fn create_then_update_keeps_resource_version() {
        let client = Arc::new(MemoryResourceClient::new());
        let manager = AppManager::new(client.clone(), "argocd");
        manager.create_app(&app()).await.unwrap();

        let mut changed = app();
        changed.target_revision = "v1.2.0".into();
        manager.update_app(&changed).await.unwrap();

        let read = manager.get_app("zcicd-0a1b2c3d-api").await.unwrap();
        assert_eq!(read.target_revision, "v1.2.0");
        assert_eq!(read.path, "charts/api");
    }

    #[tokio::test]
    async fn status_and_tree_tolerate_missing_status() {
        let client = Arc::new(MemoryResourceClient::new());
        let manager = AppManager::new(client.clone(), "argocd");
        manager.create_app(&app()).await.unwrap();

        let status = manager.get_status("zcicd-0a1b2c3d-api").await.unwrap();
        assert!(status.sync_status.is_empty());
        assert!(manager
            .get_resource_tree("zcicd-0a1b2c3d-api")
            .await
            .unwrap()
            .nodes
            .is_empty());

        client
            .patch_merge(
                ResourceKind::Application,
                "argocd",
                "zcicd-0a1b2c3d-api",
                &json!({"status": {
                    "sync": {"status": "Synced", "revision": "abc"},
                    "health": {"status": "Healthy"},
                    "resources": [{"kind": "Deployment", "name": "api", "status": "Synced"}]
                }}),
            )
            .await
            .unwrap();
        let status = manager.get_status("zcicd-0a1b2c3d-api").await.unwrap();
        assert_eq!(status.health_status, "Healthy");
        assert_eq!(status.resources.len(), 1);
    }

    #[tokio::test]
    async fn delete_missing_app_is_an_error() {
        let manager = AppManager::new(Arc::new(MemoryResourceClient::new()), "argocd");
        let err = manager.delete_app("absent").await.unwrap_err();
        assert!(err.is_kube_not_found());
    }
}

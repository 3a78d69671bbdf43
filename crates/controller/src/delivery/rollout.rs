//! Progressive rollout control via Argo Rollouts annotations.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{info, instrument};

use crate::client::ResourceClient;
use crate::crd::rollout::{ABORT_ANNOTATION, PROMOTE_ANNOTATION};
use crate::crd::{ResourceKind, RolloutStatus};
use crate::error::{Error, Result};

pub struct RolloutController {
    client: Arc<dyn ResourceClient>,
    namespace: String,
}

impl RolloutController {
    pub fn new(client: Arc<dyn ResourceClient>, namespace: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
        }
    }

    pub async fn get_status(&self, name: &str) -> Result<RolloutStatus> {
        let doc = self
            .client
            .get(ResourceKind::Rollout, &self.namespace, name)
            .await?;
        Ok(RolloutStatus::from_doc(&doc))
    }

    /// Promote the rollout to full traffic.
    #[instrument(skip(self))]
    pub async fn promote(&self, name: &str) -> Result<()> {
        self.annotate(name, PROMOTE_ANNOTATION, "full").await?;
        info!("Requested rollout promotion");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn abort(&self, name: &str) -> Result<()> {
        self.annotate(name, ABORT_ANNOTATION, "true").await?;
        info!("Requested rollout abort");
        Ok(())
    }

    /// Read-modify-write of one annotation. The read immediately precedes the
    /// replace, and the replace is rejected if the object changed in between.
    async fn annotate(&self, name: &str, key: &str, value: &str) -> Result<()> {
        let mut doc = self
            .client
            .get(ResourceKind::Rollout, &self.namespace, name)
            .await?;

        let metadata = doc
            .get_mut("metadata")
            .and_then(Value::as_object_mut)
            .ok_or_else(|| Error::Internal(format!("rollout {name} has no metadata")))?;
        let annotations = metadata
            .entry("annotations")
            .or_insert_with(|| Value::Object(Map::new()));
        if !annotations.is_object() {
            *annotations = Value::Object(Map::new());
        }
        annotations[key] = Value::String(value.to_string());

        self.client
            .update(ResourceKind::Rollout, &self.namespace, &doc)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MemoryResourceClient;
    use serde_json::json;

    async fn seeded() -> (RolloutController, Arc<MemoryResourceClient>) {
        let client = Arc::new(MemoryResourceClient::new());
        client
            .create(
                ResourceKind::Rollout,
                "default",
                &json!({
                    "metadata": {"name": "api", "annotations": {"team": "core"}},
                    "spec": {"strategy": {"canary": {"steps": [{"setWeight": 20}, {"pause": {}}]}}},
                    "status": {"phase": "Paused", "currentStepIndex": 1, "stableRS": "6d4f"}
                }),
            )
            .await
            .unwrap();
        (RolloutController::new(client.clone(), "default"), client)
    }

    #[tokio::test]
    async fn promote_sets_annotation_and_keeps_others() {
        let (rollouts, client) = seeded().await;
        rollouts.promote("api").await.unwrap();

        let doc = client
            .get(ResourceKind::Rollout, "default", "api")
            .await
            .unwrap();
        assert_eq!(doc["metadata"]["annotations"][PROMOTE_ANNOTATION], "full");
        assert_eq!(doc["metadata"]["annotations"]["team"], "core");
    }

    #[tokio::test]
    async fn abort_sets_annotation() {
        let (rollouts, client) = seeded().await;
        rollouts.abort("api").await.unwrap();
        let doc = client
            .get(ResourceKind::Rollout, "default", "api")
            .await
            .unwrap();
        assert_eq!(doc["metadata"]["annotations"][ABORT_ANNOTATION], "true");
    }

    #[tokio::test]
    async fn status_reads_steps() {
        let (rollouts, _) = seeded().await;
        let status = rollouts.get_status("api").await.unwrap();
        assert_eq!(status.phase, "Paused");
        assert_eq!(status.current_step, 1);
        assert_eq!(status.total_steps, 2);
        assert_eq!(status.stable_revision, "6d4f");
    }

    #[tokio::test]
    async fn promote_missing_rollout_fails() {
        let rollouts = RolloutController::new(Arc::new(MemoryResourceClient::new()), "default");
        assert!(rollouts.promote("ghost").await.unwrap_err().is_kube_not_found());
    }
}

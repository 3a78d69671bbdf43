use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use serde_json::Value;
use tracing::{debug, instrument};

use super::ResourceClient;
use crate::crd::{object_name, KindRegistry, ResourceKind};
use crate::error::{Error, Result};

/// [`ResourceClient`] backed by the Kubernetes dynamic API.
#[derive(Clone)]
pub struct KubeResourceClient {
    client: Client,
    kinds: KindRegistry,
}

impl KubeResourceClient {
    #[must_use]
    pub fn new(client: Client, kinds: KindRegistry) -> Self {
        Self { client, kinds }
    }

    fn api(&self, kind: ResourceKind, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.kinds.resource(kind))
    }
}

fn to_object(doc: &Value) -> Result<DynamicObject> {
    Ok(serde_json::from_value(doc.clone())?)
}

fn to_doc(obj: &DynamicObject) -> Result<Value> {
    Ok(serde_json::to_value(obj)?)
}

#[async_trait]
impl ResourceClient for KubeResourceClient {
    #[instrument(skip(self, manifest))]
    async fn create(
        &self,
        kind: ResourceKind,
        namespace: &str,
        manifest: &Value,
    ) -> Result<Value> {
        let obj = to_object(manifest)?;
        let created = self
            .api(kind, namespace)
            .create(&PostParams::default(), &obj)
            .await?;
        debug!(name = %object_name(manifest), "Created resource");
        to_doc(&created)
    }

    async fn get(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<Value> {
        let obj = self.api(kind, namespace).get(name).await?;
        to_doc(&obj)
    }

    #[instrument(skip(self, patch))]
    async fn patch_merge(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<Value> {
        let patched = self
            .api(kind, namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        to_doc(&patched)
    }

    async fn update(&self, kind: ResourceKind, namespace: &str, doc: &Value) -> Result<Value> {
        let obj = to_object(doc)?;
        let name = object_name(doc);
        let replaced = self
            .api(kind, namespace)
            .replace(&name, &PostParams::default(), &obj)
            .await?;
        to_doc(&replaced)
    }

    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<()> {
        self.api(kind, namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Value>> {
        let mut params = ListParams::default();
        if !label_selector.is_empty() {
            params = params.labels(label_selector);
        }
        let list = self.api(kind, namespace).list(&params).await?;
        list.items.iter().map(to_doc).collect()
    }

    fn watch(&self, kind: ResourceKind, namespace: &str) -> BoxStream<'static, Result<Value>> {
        watcher(self.api(kind, namespace), watcher::Config::default())
            .default_backoff()
            .applied_objects()
            .map_err(|e| Error::Watch(e.to_string()))
            .and_then(|obj| async move { to_doc(&obj) })
            .boxed()
    }
}

//! In-process resource store.
//!
//! Used when the controller runs without a cluster and as the cluster double in
//! tests. Semantics follow the API server closely enough for the engines:
//! create conflicts, 404s, merge patches, optimistic concurrency on replace,
//! and change notifications to watchers.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use kube::core::ErrorResponse;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};

use super::ResourceClient;
use crate::crd::{nested_str, object_name, ResourceKind};
use crate::error::{Error, Result};

const CHANGE_BUFFER: usize = 256;

type Key = (ResourceKind, String, String);

#[derive(Clone, Debug)]
struct Change {
    kind: ResourceKind,
    namespace: String,
    doc: Value,
}

pub struct MemoryResourceClient {
    objects: Mutex<BTreeMap<Key, Value>>,
    changes: broadcast::Sender<Change>,
    version: AtomicU64,
}

impl Default for MemoryResourceClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryResourceClient {
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            objects: Mutex::new(BTreeMap::new()),
            changes,
            version: AtomicU64::new(1),
        }
    }

    /// Number of stored resources of `kind` across namespaces.
    pub async fn count(&self, kind: ResourceKind) -> usize {
        self.objects
            .lock()
            .await
            .keys()
            .filter(|(k, _, _)| *k == kind)
            .count()
    }

    fn stamp(&self, doc: &mut Value) {
        let version = self.version.fetch_add(1, Ordering::SeqCst);
        if let Some(meta) = doc.get_mut("metadata").and_then(Value::as_object_mut) {
            meta.insert(
                "resourceVersion".to_string(),
                Value::String(version.to_string()),
            );
        }
    }

    fn publish(&self, kind: ResourceKind, namespace: &str, doc: &Value) {
        // No receivers is fine.
        let _ = self.changes.send(Change {
            kind,
            namespace: namespace.to_string(),
            doc: doc.clone(),
        });
    }
}

fn api_error(code: u16, reason: &str, message: String) -> Error {
    Error::Kube(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    }))
}

fn not_found(kind: ResourceKind, name: &str) -> Error {
    api_error(404, "NotFound", format!("{kind} \"{name}\" not found"))
}

fn key(kind: ResourceKind, namespace: &str, name: &str) -> Key {
    (kind, namespace.to_string(), name.to_string())
}

/// RFC 7386 JSON merge patch.
pub(crate) fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(serde_json::Map::new());
    }
    if let Value::Object(target_map) = target {
        for (k, v) in patch_map {
            if v.is_null() {
                target_map.remove(k);
            } else {
                merge_patch(target_map.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
    }
}

fn matches_selector(doc: &Value, selector: &str) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => {
                doc.get("metadata")
                    .and_then(|m| m.get("labels"))
                    .and_then(|l| l.get(k.trim()))
                    .and_then(Value::as_str)
                    == Some(v.trim())
            }
            None => doc
                .get("metadata")
                .and_then(|m| m.get("labels"))
                .and_then(|l| l.get(term))
                .is_some(),
        })
}

#[async_trait]
impl ResourceClient for MemoryResourceClient {
    async fn create(
        &self,
        kind: ResourceKind,
        namespace: &str,
        manifest: &Value,
    ) -> Result<Value> {
        let name = object_name(manifest);
        if name.is_empty() {
            return Err(api_error(422, "Invalid", "metadata.name is required".into()));
        }
        let mut objects = self.objects.lock().await;
        let k = key(kind, namespace, &name);
        if objects.contains_key(&k) {
            return Err(api_error(
                409,
                "AlreadyExists",
                format!("{kind} \"{name}\" already exists"),
            ));
        }
        let mut doc = manifest.clone();
        self.stamp(&mut doc);
        objects.insert(k, doc.clone());
        drop(objects);
        self.publish(kind, namespace, &doc);
        Ok(doc)
    }

    async fn get(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<Value> {
        self.objects
            .lock()
            .await
            .get(&key(kind, namespace, name))
            .cloned()
            .ok_or_else(|| not_found(kind, name))
    }

    async fn patch_merge(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<Value> {
        let mut objects = self.objects.lock().await;
        let doc = objects
            .get_mut(&key(kind, namespace, name))
            .ok_or_else(|| not_found(kind, name))?;
        merge_patch(doc, patch);
        self.stamp(doc);
        let doc = doc.clone();
        drop(objects);
        self.publish(kind, namespace, &doc);
        Ok(doc)
    }

    async fn update(&self, kind: ResourceKind, namespace: &str, doc: &Value) -> Result<Value> {
        let name = object_name(doc);
        let mut objects = self.objects.lock().await;
        let current = objects
            .get_mut(&key(kind, namespace, &name))
            .ok_or_else(|| not_found(kind, &name))?;

        let expected = nested_str(doc, &["metadata", "resourceVersion"]);
        let actual = nested_str(current, &["metadata", "resourceVersion"]);
        if !expected.is_empty() && expected != actual {
            return Err(api_error(
                409,
                "Conflict",
                format!("the object has been modified; resourceVersion {expected} != {actual}"),
            ));
        }

        *current = doc.clone();
        self.stamp(current);
        let doc = current.clone();
        drop(objects);
        self.publish(kind, namespace, &doc);
        Ok(doc)
    }

    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<()> {
        self.objects
            .lock()
            .await
            .remove(&key(kind, namespace, name))
            .map(|_| ())
            .ok_or_else(|| not_found(kind, name))
    }

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Value>> {
        Ok(self
            .objects
            .lock()
            .await
            .iter()
            .filter(|((k, ns, _), doc)| {
                *k == kind && ns == namespace && matches_selector(doc, label_selector)
            })
            .map(|(_, doc)| doc.clone())
            .collect())
    }

    fn watch(&self, kind: ResourceKind, namespace: &str) -> BoxStream<'static, Result<Value>> {
        let namespace = namespace.to_string();
        stream::unfold(self.changes.subscribe(), move |mut rx| {
            let namespace = namespace.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(change) if change.kind == kind && change.namespace == namespace => {
                            return Some((Ok(change.doc), rx));
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            return Some((
                                Err(Error::Watch(format!("watch lagged by {skipped} events"))),
                                rx,
                            ));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manifest(name: &str, labels: Value) -> Value {
        json!({
            "apiVersion": "tekton.dev/v1",
            "kind": "TaskRun",
            "metadata": {"name": name, "labels": labels},
            "spec": {"status": null}
        })
    }

    #[tokio::test]
    async fn create_conflicts_on_duplicate_name() {
        let client = MemoryResourceClient::new();
        let doc = manifest("build-1-run-1", json!({}));
        client.create(ResourceKind::TaskRun, "ci", &doc).await.unwrap();
        let err = client
            .create(ResourceKind::TaskRun, "ci", &doc)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Kube(kube::Error::Api(ref e)) if e.code == 409));
    }

    #[tokio::test]
    async fn merge_patch_sets_and_removes_fields() {
        let client = MemoryResourceClient::new();
        client
            .create(ResourceKind::TaskRun, "ci", &manifest("r", json!({"a": "1"})))
            .await
            .unwrap();
        let patched = client
            .patch_merge(
                ResourceKind::TaskRun,
                "ci",
                "r",
                &json!({"spec": {"status": "CancelledRunFinally"}, "metadata": {"labels": {"a": null}}}),
            )
            .await
            .unwrap();
        assert_eq!(patched["spec"]["status"], "CancelledRunFinally");
        assert!(patched["metadata"]["labels"].get("a").is_none());
    }

    #[tokio::test]
    async fn stale_update_is_rejected() {
        let client = MemoryResourceClient::new();
        let created = client
            .create(ResourceKind::Rollout, "apps", &manifest("api", json!({})))
            .await
            .unwrap();
        client
            .patch_merge(ResourceKind::Rollout, "apps", "api", &json!({"status": {}}))
            .await
            .unwrap();
        let err = client
            .update(ResourceKind::Rollout, "apps", &created)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Kube(kube::Error::Api(ref e)) if e.code == 409));
    }

    #[tokio::test]
    async fn list_filters_by_label_and_namespace() {
        let client = MemoryResourceClient::new();
        client
            .create(ResourceKind::TaskRun, "ci", &manifest("a", json!({"zcicd.io/build-config-id": "c1"})))
            .await
            .unwrap();
        client
            .create(ResourceKind::TaskRun, "ci", &manifest("b", json!({"zcicd.io/build-config-id": "c2"})))
            .await
            .unwrap();
        client
            .create(ResourceKind::TaskRun, "other", &manifest("c", json!({"zcicd.io/build-config-id": "c1"})))
            .await
            .unwrap();

        let found = client
            .list(ResourceKind::TaskRun, "ci", "zcicd.io/build-config-id=c1")
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(object_name(&found[0]), "a");
        assert_eq!(client.list(ResourceKind::TaskRun, "ci", "").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn watch_only_sees_matching_kind_and_namespace() {
        let client = MemoryResourceClient::new();
        let mut events = client.watch(ResourceKind::TaskRun, "ci");
        client
            .create(ResourceKind::PipelineRun, "ci", &manifest("p", json!({})))
            .await
            .unwrap();
        client
            .create(ResourceKind::TaskRun, "other", &manifest("o", json!({})))
            .await
            .unwrap();
        client
            .create(ResourceKind::TaskRun, "ci", &manifest("t", json!({})))
            .await
            .unwrap();
        let doc = events.next().await.unwrap().unwrap();
        assert_eq!(object_name(&doc), "t");
    }

    #[tokio::test]
    async fn missing_resource_is_not_found() {
        let client = MemoryResourceClient::new();
        let err = client
            .get(ResourceKind::Application, "argocd", "nope")
            .await
            .unwrap_err();
        assert!(err.is_kube_not_found());
    }
}

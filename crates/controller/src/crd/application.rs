//! Argo CD `Application` encoding and status decoding.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::{nested, nested_str, object_name};
use crate::error::Result;

pub const DEFAULT_PROJECT: &str = "default";
pub const DEFAULT_DEST_SERVER: &str = "https://kubernetes.default.svc";

pub const SYNC_SYNCED: &str = "Synced";
pub const HEALTH_PROGRESSING: &str = "Progressing";
pub const UNKNOWN: &str = "Unknown";

/// Desired state of an Argo CD application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ArgoApp {
    pub name: String,
    /// Namespace the `Application` object lives in. Empty means the Argo namespace.
    pub namespace: String,
    /// Empty means [`DEFAULT_PROJECT`].
    pub project: String,
    pub repo_url: String,
    pub target_revision: String,
    pub path: String,
    pub dest_namespace: String,
    /// Empty means [`DEFAULT_DEST_SERVER`].
    pub dest_server: String,
    pub values_override: BTreeMap<String, Value>,
    pub auto_sync: bool,
    pub self_heal: bool,
    pub prune: bool,
}

impl ArgoApp {
    /// Build the `Application` manifest.
    pub fn to_manifest(&self, argo_namespace: &str) -> Result<Value> {
        let project = non_empty_or(&self.project, DEFAULT_PROJECT);
        let server = non_empty_or(&self.dest_server, DEFAULT_DEST_SERVER);
        let namespace = non_empty_or(&self.namespace, argo_namespace);

        let mut source = json!({
            "repoURL": self.repo_url,
            "targetRevision": self.target_revision,
            "path": self.path,
        });
        if !self.values_override.is_empty() {
            source["helm"] = json!({ "values": serde_yaml::to_string(&self.values_override)? });
        }

        let mut spec = json!({
            "project": project,
            "source": source,
            "destination": {
                "server": server,
                "namespace": self.dest_namespace,
            },
        });
        if self.auto_sync {
            spec["syncPolicy"] = json!({
                "automated": {
                    "selfHeal": self.self_heal,
                    "prune": self.prune,
                }
            });
        }

        Ok(json!({
            "apiVersion": "argoproj.io/v1alpha1",
            "kind": "Application",
            "metadata": {
                "name": self.name,
                "namespace": namespace,
            },
            "spec": spec,
        }))
    }

    /// Recover the desired state from a manifest's `metadata` and `spec`.
    #[must_use]
    pub fn from_manifest(doc: &Value) -> Self {
        let automated = nested(doc, &["spec", "syncPolicy", "automated"]);
        let flag = |key: &str| {
            automated
                .and_then(|a| a.get(key))
                .and_then(Value::as_bool)
                .unwrap_or(false)
        };
        let values_override = nested(doc, &["spec", "source", "helm", "values"])
            .and_then(Value::as_str)
            .and_then(|raw| serde_yaml::from_str::<BTreeMap<String, Value>>(raw).ok())
            .unwrap_or_default();

        Self {
            name: object_name(doc),
            namespace: nested_str(doc, &["metadata", "namespace"]),
            project: nested_str(doc, &["spec", "project"]),
            repo_url: nested_str(doc, &["spec", "source", "repoURL"]),
            target_revision: nested_str(doc, &["spec", "source", "targetRevision"]),
            path: nested_str(doc, &["spec", "source", "path"]),
            dest_namespace: nested_str(doc, &["spec", "destination", "namespace"]),
            dest_server: nested_str(doc, &["spec", "destination", "server"]),
            values_override,
            auto_sync: automated.is_some(),
            self_heal: flag("selfHeal"),
            prune: flag("prune"),
        }
    }
}

fn non_empty_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.is_empty() {
        fallback
    } else {
        value
    }
}

/// A managed resource reported by the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ResourceNode {
    pub group: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub status: String,
    pub health: String,
    pub message: String,
}

impl ResourceNode {
    fn from_doc(node: &Value) -> Self {
        Self {
            group: nested_str(node, &["group"]),
            kind: nested_str(node, &["kind"]),
            namespace: nested_str(node, &["namespace"]),
            name: nested_str(node, &["name"]),
            status: nested_str(node, &["status"]),
            health: nested_str(node, &["health", "status"]),
            message: nested_str(node, &["health", "message"]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ResourceTree {
    pub nodes: Vec<ResourceNode>,
}

impl ResourceTree {
    #[must_use]
    pub fn from_doc(doc: &Value) -> Self {
        let nodes = nested(doc, &["status", "resources"])
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter(|item| item.is_object())
                    .map(ResourceNode::from_doc)
                    .collect()
            })
            .unwrap_or_default();
        Self { nodes }
    }
}

/// Current sync and health view of an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppStatus {
    pub sync_status: String,
    pub health_status: String,
    pub revision: String,
    pub message: String,
    pub resources: Vec<ResourceNode>,
}

impl Default for AppStatus {
    fn default() -> Self {
        Self {
            sync_status: UNKNOWN.to_string(),
            health_status: UNKNOWN.to_string(),
            revision: String::new(),
            message: String::new(),
            resources: Vec::new(),
        }
    }
}

impl AppStatus {
    #[must_use]
    pub fn from_doc(doc: &Value) -> Self {
        Self {
            sync_status: nested_str(doc, &["status", "sync", "status"]),
            health_status: nested_str(doc, &["status", "health", "status"]),
            revision: nested_str(doc, &["status", "sync", "revision"]),
            message: nested_str(doc, &["status", "health", "message"]),
            resources: ResourceTree::from_doc(doc).nodes,
        }
    }
}

/// Outcome of a sync operation as last observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SyncResult {
    pub status: String,
    pub health: String,
    pub revision: String,
    pub message: String,
    pub started_at: String,
    pub finished_at: String,
}

impl SyncResult {
    #[must_use]
    pub fn from_doc(doc: &Value) -> Self {
        Self {
            status: nested_str(doc, &["status", "sync", "status"]),
            health: nested_str(doc, &["status", "health", "status"]),
            revision: nested_str(doc, &["status", "sync", "revision"]),
            message: nested_str(doc, &["status", "operationState", "message"]),
            started_at: nested_str(doc, &["status", "operationState", "startedAt"]),
            finished_at: nested_str(doc, &["status", "operationState", "finishedAt"]),
        }
    }

    /// Synced and no longer progressing.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.status == SYNC_SYNCED && self.health != HEALTH_PROGRESSING
    }
}

/// Merge patch requesting a hard refresh and a sync to `revision`.
#[must_use]
pub fn sync_patch(revision: &str, initiated_by: &str) -> Value {
    let mut annotations = Map::new();
    annotations.insert(
        "argocd.argoproj.io/refresh".to_string(),
        Value::String("hard".to_string()),
    );
    json!({
        "metadata": { "annotations": annotations },
        "operation": {
            "initiatedBy": { "username": initiated_by },
            "sync": { "revision": revision },
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_app() -> ArgoApp {
        ArgoApp {
            name: "zcicd-0a1b2c3d-api".to_string(),
            repo_url: "https://git.example.com/org/deploy.git".to_string(),
            target_revision: "main".to_string(),
            path: "charts/api".to_string(),
            dest_namespace: "staging".to_string(),
            ..ArgoApp::default()
        }
    }

    #[test]
    fn manifest_applies_defaults() {
        let manifest = sample_app().to_manifest("argocd").unwrap();
        assert_eq!(manifest["metadata"]["namespace"], "argocd");
        assert_eq!(manifest["spec"]["project"], "default");
        assert_eq!(
            manifest["spec"]["destination"]["server"],
            "https://kubernetes.default.svc"
        );
        assert!(manifest["spec"].get("syncPolicy").is_none());
        assert!(manifest["spec"]["source"].get("helm").is_none());
    }

    #[test]
    fn round_trip_recovers_source_and_destination() {
        let mut app = sample_app();
        app.auto_sync = true;
        app.self_heal = true;
        app.values_override
            .insert("replicaCount".to_string(), json!(3));
        app.values_override
            .insert("image".to_string(), json!({"tag": "main-abcdef12"}));

        let manifest = app.to_manifest("argocd").unwrap();
        let decoded = ArgoApp::from_manifest(&manifest);

        assert_eq!(decoded.repo_url, app.repo_url);
        assert_eq!(decoded.target_revision, app.target_revision);
        assert_eq!(decoded.path, app.path);
        assert_eq!(decoded.dest_namespace, app.dest_namespace);
        assert_eq!(decoded.values_override, app.values_override);
        assert!(decoded.auto_sync);
        assert!(decoded.self_heal);
        assert!(!decoded.prune);
    }

    #[test]
    fn helm_values_are_a_yaml_block() {
        let mut app = sample_app();
        app.values_override.insert("replicaCount".into(), json!(2));
        let manifest = app.to_manifest("argocd").unwrap();
        let values = manifest["spec"]["source"]["helm"]["values"].as_str().unwrap();
        assert_eq!(values.trim(), "replicaCount: 2");
    }

    #[test]
    fn decodes_application_status() {
        let doc = json!({
            "status": {
                "sync": {"status": "Synced", "revision": "4f1c2e"},
                "health": {"status": "Degraded", "message": "pod crashloop"},
                "operationState": {
                    "message": "successfully synced",
                    "startedAt": "2024-05-01T10:00:00Z",
                    "finishedAt": "2024-05-01T10:00:12Z"
                },
                "resources": [
                    {"group": "apps", "kind": "Deployment", "namespace": "staging",
                     "name": "api", "status": "Synced", "health": {"status": "Degraded"}},
                    42
                ]
            }
        });
        let status = AppStatus::from_doc(&doc);
        assert_eq!(status.sync_status, "Synced");
        assert_eq!(status.health_status, "Degraded");
        assert_eq!(status.message, "pod crashloop");
        assert_eq!(status.resources.len(), 1);
        assert_eq!(status.resources[0].health, "Degraded");

        let sync = SyncResult::from_doc(&doc);
        assert_eq!(sync.revision, "4f1c2e");
        assert_eq!(sync.message, "successfully synced");
        assert_eq!(sync.finished_at, "2024-05-01T10:00:12Z");
        assert!(sync.is_converged());
    }

    #[test]
    fn progressing_is_not_converged() {
        let result = SyncResult {
            status: "Synced".into(),
            health: "Progressing".into(),
            ..SyncResult::default()
        };
        assert!(!result.is_converged());
        let empty = SyncResult::from_doc(&json!({}));
        assert!(!empty.is_converged());
    }

    #[test]
    fn sync_patch_requests_hard_refresh() {
        let patch = sync_patch("v1.2.0", "zcicd");
        assert_eq!(
            patch["metadata"]["annotations"]["argocd.argoproj.io/refresh"],
            "hard"
        );
        assert_eq!(patch["operation"]["sync"]["revision"], "v1.2.0");
        assert_eq!(patch["operation"]["initiatedBy"]["username"], "zcicd");
    }
}

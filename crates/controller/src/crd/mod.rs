//! Custom resource coordinates and status codecs.
//!
//! Raw documents are decoded into typed views here and nowhere else. Decoders
//! are tolerant: a missing or malformed nested field yields its zero value.

use std::collections::HashMap;

use kube::discovery::ApiResource;
use serde_json::Value;

pub mod application;
pub mod rollout;
pub mod run;

pub use application::{AppStatus, ArgoApp, ResourceNode, ResourceTree, SyncResult};
pub use rollout::RolloutStatus;
pub use run::{RunPhase, RunStatus, StepStatus};

/// Label applied to every resource this controller creates.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "zcicd";

/// Logical resource kinds the controller talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    PipelineRun,
    TaskRun,
    Pipeline,
    Task,
    Application,
    Rollout,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 6] = [
        Self::PipelineRun,
        Self::TaskRun,
        Self::Pipeline,
        Self::Task,
        Self::Application,
        Self::Rollout,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PipelineRun => "PipelineRun",
            Self::TaskRun => "TaskRun",
            Self::Pipeline => "Pipeline",
            Self::Task => "Task",
            Self::Application => "Application",
            Self::Rollout => "Rollout",
        }
    }

    fn default_resource(self) -> ApiResource {
        let (group, version, plural) = match self {
            Self::PipelineRun => ("tekton.dev", "v1", "pipelineruns"),
            Self::TaskRun => ("tekton.dev", "v1", "taskruns"),
            Self::Pipeline => ("tekton.dev", "v1", "pipelines"),
            Self::Task => ("tekton.dev", "v1", "tasks"),
            Self::Application => ("argoproj.io", "v1alpha1", "applications"),
            Self::Rollout => ("argoproj.io", "v1alpha1", "rollouts"),
        };
        ApiResource {
            group: group.to_string(),
            version: version.to_string(),
            api_version: format!("{group}/{version}"),
            kind: self.as_str().to_string(),
            plural: plural.to_string(),
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps logical kinds to group/version/resource coordinates.
///
/// Injected into resource clients at construction so alternative API versions
/// can be targeted without touching call sites.
#[derive(Debug, Clone)]
pub struct KindRegistry {
    resources: HashMap<ResourceKind, ApiResource>,
}

impl KindRegistry {
    /// Tekton `v1` and Argo `v1alpha1` coordinates.
    #[must_use]
    pub fn standard() -> Self {
        let resources = ResourceKind::ALL
            .iter()
            .map(|kind| (*kind, kind.default_resource()))
            .collect();
        Self { resources }
    }

    /// Replace the coordinates registered for `kind`.
    #[must_use]
    pub fn with_resource(mut self, kind: ResourceKind, resource: ApiResource) -> Self {
        self.resources.insert(kind, resource);
        self
    }

    /// Coordinates for `kind`. Every kind is registered by construction.
    #[must_use]
    pub fn resource(&self, kind: ResourceKind) -> ApiResource {
        self.resources
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| kind.default_resource())
    }
}

impl Default for KindRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

/// String at `path`, or empty when absent or not a string.
pub(crate) fn nested_str(doc: &Value, path: &[&str]) -> String {
    nested(doc, path)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Value at `path`, if every segment exists.
pub(crate) fn nested<'a>(doc: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(doc, |cur, key| cur.get(key))
}

/// `metadata.name` of a document.
#[must_use]
pub fn object_name(doc: &Value) -> String {
    nested_str(doc, &["metadata", "name"])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn standard_registry_covers_every_kind() {
        let registry = KindRegistry::standard();
        let pr = registry.resource(ResourceKind::PipelineRun);
        assert_eq!(pr.api_version, "tekton.dev/v1");
        assert_eq!(pr.plural, "pipelineruns");

        let app = registry.resource(ResourceKind::Application);
        assert_eq!(app.api_version, "argoproj.io/v1alpha1");
        assert_eq!(app.kind, "Application");

        let ro = registry.resource(ResourceKind::Rollout);
        assert_eq!(ro.plural, "rollouts");
    }

    #[test]
    fn registry_override_replaces_coordinates() {
        let registry = KindRegistry::standard().with_resource(
            ResourceKind::TaskRun,
            ApiResource {
                group: "tekton.dev".into(),
                version: "v1beta1".into(),
                api_version: "tekton.dev/v1beta1".into(),
                kind: "TaskRun".into(),
                plural: "taskruns".into(),
            },
        );
        assert_eq!(
            registry.resource(ResourceKind::TaskRun).version,
            "v1beta1"
        );
        assert_eq!(registry.resource(ResourceKind::PipelineRun).version, "v1");
    }

    #[test]
    fn nested_lookup_tolerates_gaps() {
        let doc = json!({"status": {"sync": {"status": "Synced"}, "health": 3}});
        assert_eq!(nested_str(&doc, &["status", "sync", "status"]), "Synced");
        assert_eq!(nested_str(&doc, &["status", "health", "status"]), "");
        assert_eq!(nested_str(&doc, &["status", "health"]), "");
        assert_eq!(nested_str(&doc, &["missing"]), "");
    }
}

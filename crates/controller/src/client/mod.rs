//! Generic custom resource access.
//!
//! [`ResourceClient`] is the only path from the engines to the cluster. It
//! speaks raw JSON documents addressed by [`ResourceKind`]; typed decoding
//! happens in [`crate::crd`].

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::crd::ResourceKind;
use crate::error::Result;

mod kube_client;
pub mod memory;

pub use kube_client::KubeResourceClient;
pub use memory::MemoryResourceClient;

/// Capability over "apply arbitrary custom resource".
///
/// All methods are remote calls that can fail transiently. Retry policy is
/// left to callers.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// Create a resource from a full manifest.
    async fn create(&self, kind: ResourceKind, namespace: &str, manifest: &Value)
        -> Result<Value>;

    async fn get(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<Value>;

    /// Apply a JSON merge patch.
    async fn patch_merge(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<Value>;

    /// Replace a resource. The document's `metadata.resourceVersion` guards
    /// against lost updates.
    async fn update(&self, kind: ResourceKind, namespace: &str, doc: &Value) -> Result<Value>;

    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<()>;

    /// List resources matching a `k=v,k2=v2` label selector. Empty selects all.
    async fn list(
        &self,
        kind: ResourceKind,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Value>>;

    /// Stream of added or modified documents. Deletions are not reported.
    fn watch(&self, kind: ResourceKind, namespace: &str) -> BoxStream<'static, Result<Value>>;
}

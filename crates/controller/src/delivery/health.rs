//! Application health monitor.
//!
//! Watches every `Application` in the Argo CD namespace and reports sync or
//! health transitions to a single callback. Repeated events with an unchanged
//! `(sync, health)` pair are suppressed.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::ResourceClient;
use crate::crd::application::UNKNOWN;
use crate::crd::{object_name, AppStatus, ResourceKind};
use crate::error::Result;
use crate::watch::WatchTask;

pub type HealthCallback = Arc<dyn Fn(&str, &AppStatus) + Send + Sync>;

/// One-shot health view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppHealth {
    pub sync: String,
    pub health: String,
}

pub struct HealthMonitor {
    client: Arc<dyn ResourceClient>,
    namespace: String,
    task: WatchTask,
    last_seen: Arc<DashMap<String, (String, String)>>,
}

impl HealthMonitor {
    pub fn new(client: Arc<dyn ResourceClient>, argo_namespace: &str) -> Self {
        Self {
            task: WatchTask::new(Arc::clone(&client), ResourceKind::Application, argo_namespace),
            client,
            namespace: argo_namespace.to_string(),
            last_seen: Arc::new(DashMap::new()),
        }
    }

    /// Begin watching. No-op when already running.
    pub fn start(&self, shutdown: &CancellationToken, callback: HealthCallback) -> bool {
        let last_seen = Arc::clone(&self.last_seen);
        self.task.start(shutdown, move |doc| {
            let name = object_name(&doc);
            if name.is_empty() {
                return;
            }
            let status = AppStatus::from_doc(&doc);
            let current = (status.sync_status.clone(), status.health_status.clone());
            let changed = last_seen
                .insert(name.clone(), current.clone())
                .map_or(true, |previous| previous != current);
            if changed {
                debug!(app = %name, sync = %current.0, health = %current.1, "Application status changed");
                callback(&name, &status);
            }
        })
    }

    pub fn stop(&self) {
        self.task.stop();
    }

    pub async fn shutdown(&self) {
        self.task.shutdown().await;
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }

    /// Read sync and health once, outside the watch.
    pub async fn get_health(&self, app: &str) -> Result<AppHealth> {
        let doc = self
            .client
            .get(ResourceKind::Application, &self.namespace, app)
            .await?;
        let status = AppStatus::from_doc(&doc);
        Ok(AppHealth {
            sync: or_unknown(status.sync_status),
            health: or_unknown(status.health_status),
        })
    }
}

fn or_unknown(value: String) -> String {
    if value.is_empty() {
        UNKNOWN.to_string()
    } else {
        value
    }
}

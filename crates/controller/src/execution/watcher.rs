//! Run status watcher.
//!
//! Watches one execution kind and hands each decoded [`RunStatus`] to the
//! callback subscribed for that resource name. Callbacks run inline on the
//! watch task and must not block.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::client::ResourceClient;
use crate::crd::{ResourceKind, RunStatus};
use crate::watch::WatchTask;

pub type StatusCallback = Arc<dyn Fn(&RunStatus) + Send + Sync>;

/// Handle returned by [`CallbackRegistry::register`].
///
/// Unregistering with a stale handle never removes a newer registration for
/// the same name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    name: String,
    id: u64,
}

impl Subscription {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Name-keyed callback map shared between request handlers and the watch task.
#[derive(Default)]
pub struct CallbackRegistry {
    callbacks: DashMap<String, (u64, StatusCallback)>,
    next_id: AtomicU64,
}

impl CallbackRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `callback` to status changes of resource `name`, replacing any
    /// previous subscription for that name.
    pub fn register(&self, name: &str, callback: StatusCallback) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks.insert(name.to_string(), (id, callback));
        debug!(name = %name, "Registered run status callback");
        Subscription {
            name: name.to_string(),
            id,
        }
    }

    /// Idempotent. Returns whether a callback was removed.
    pub fn unregister(&self, subscription: &Subscription) -> bool {
        self.callbacks
            .remove_if(&subscription.name, |_, (id, _)| *id == subscription.id)
            .is_some()
    }

    /// Invoke the callback for `status.name`, if any.
    pub fn dispatch(&self, status: &RunStatus) -> bool {
        // Clone out so the shard lock is not held while the callback runs.
        let callback = self
            .callbacks
            .get(&status.name)
            .map(|entry| Arc::clone(&entry.value().1));
        match callback {
            Some(callback) => {
                callback(status);
                true
            }
            None => {
                trace!(name = %status.name, "No callback registered");
                false
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}

/// Continuous watch over an execution kind.
pub struct StatusWatcher {
    task: WatchTask,
    registry: Arc<CallbackRegistry>,
}

impl StatusWatcher {
    pub fn new(client: Arc<dyn ResourceClient>, kind: ResourceKind, namespace: &str) -> Self {
        Self {
            task: WatchTask::new(client, kind, namespace),
            registry: Arc::new(CallbackRegistry::new()),
        }
    }

    pub fn register(&self, name: &str, callback: StatusCallback) -> Subscription {
        self.registry.register(name, callback)
    }

    pub fn unregister(&self, subscription: &Subscription) -> bool {
        self.registry.unregister(subscription)
    }

    #[must_use]
    pub fn registry(&self) -> Arc<CallbackRegistry> {
        Arc::clone(&self.registry)
    }

    /// No-op when already running.
    pub fn start(&self, shutdown: &CancellationToken) -> bool {
        let registry = Arc::clone(&self.registry);
        self.task.start(shutdown, move |doc| {
            registry.dispatch(&RunStatus::from_doc(&doc));
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MemoryResourceClient;
    use crate::crd::RunPhase;
    use serde_json::json;
    use std::sync::Mutex;

    fn recorder() -> (StatusCallback, Arc<Mutex<Vec<RunPhase>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let cb: StatusCallback = Arc::new(move |status: &RunStatus| {
            sink.lock().unwrap().push(status.phase);
        });
        (cb, seen)
    }

    fn status(name: &str, phase: RunPhase) -> RunStatus {
        RunStatus {
            name: name.to_string(),
            phase,
            ..RunStatus::default()
        }
    }

    #[test]
    fn dispatch_routes_by_name() {
        let registry = CallbackRegistry::new();
        let (cb, seen) = recorder();
        registry.register("build-a-run-1", cb);

        assert!(registry.dispatch(&status("build-a-run-1", RunPhase::Running)));
        assert!(!registry.dispatch(&status("build-b-run-1", RunPhase::Failed)));
        assert_eq!(*seen.lock().unwrap(), vec![RunPhase::Running]);
    }

    #[test]
    fn unregister_is_idempotent_and_ignores_stale_handles() {
        let registry = CallbackRegistry::new();
        let (first, _) = recorder();
        let (second, seen) = recorder();

        let stale = registry.register("wf-1-run-1", first);
        let current = registry.register("wf-1-run-1", second);

        assert!(!registry.unregister(&stale));
        assert!(registry.dispatch(&status("wf-1-run-1", RunPhase::Succeeded)));
        assert_eq!(seen.lock().unwrap().len(), 1);

        assert!(registry.unregister(&current));
        assert!(!registry.unregister(&current));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn watcher_decodes_and_dispatches_updates() {
        let client = Arc::new(MemoryResourceClient::new());
        let watcher = StatusWatcher::new(client.clone(), ResourceKind::TaskRun, "ci");
        let (cb, seen) = recorder();
        watcher.register("build-c-run-2", cb);

        let shutdown = CancellationToken::new();
        assert!(watcher.start(&shutdown));
        assert!(!watcher.start(&shutdown));

        client
            .create(
                ResourceKind::TaskRun,
                "ci",
                &json!({"metadata": {"name": "build-c-run-2"}}),
            )
            .await
            .unwrap();
        client
            .patch_merge(
                ResourceKind::TaskRun,
                "ci",
                "build-c-run-2",
                &json!({"status": {"conditions": [{"type": "Succeeded", "status": "True"}]}}),
            )
            .await
            .unwrap();

        for _ in 0..100 {
            if seen.lock().unwrap().len() == 2 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(
            *seen.lock().unwrap(),
            vec![RunPhase::Pending, RunPhase::Succeeded]
        );

        shutdown.cancel();
        watcher.stop();
        watcher.shutdown().await;
        assert!(!watcher.is_running());
    }
}

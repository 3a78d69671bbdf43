//! Feedback path from the status watchers to the owning services.
//!
//! A [`RunTracker`] registers one watcher subscription per submitted run. The
//! subscription's callback only enqueues a [`StatusUpdate`] on a bounded
//! channel; the status pump drains that channel and applies updates through
//! the services, so callbacks never block the watch task.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::crd::RunStatus;
use crate::execution::{StatusCallback, StatusWatcher, Subscription};

pub const STATUS_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOwner {
    Build,
    Workflow,
}

/// A decoded status addressed to one run record.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub owner: RunOwner,
    pub run_id: String,
    pub status: RunStatus,
}

#[must_use]
pub fn status_channel() -> (mpsc::Sender<StatusUpdate>, mpsc::Receiver<StatusUpdate>) {
    mpsc::channel(STATUS_CHANNEL_CAPACITY)
}

/// Per-kind subscription bookkeeping.
pub struct RunTracker {
    owner: RunOwner,
    watcher: Arc<StatusWatcher>,
    updates: mpsc::Sender<StatusUpdate>,
    subscriptions: DashMap<String, Subscription>,
}

impl RunTracker {
    pub fn new(
        owner: RunOwner,
        watcher: Arc<StatusWatcher>,
        updates: mpsc::Sender<StatusUpdate>,
    ) -> Self {
        Self {
            owner,
            watcher,
            updates,
            subscriptions: DashMap::new(),
        }
    }

    /// Forward status changes of `resource_name` to the run `run_id`.
    pub fn track(&self, resource_name: &str, run_id: &str) {
        let owner = self.owner;
        let run_id = run_id.to_string();
        let updates = self.updates.clone();
        let callback: StatusCallback = Arc::new(move |status: &RunStatus| {
            let update = StatusUpdate {
                owner,
                run_id: run_id.clone(),
                status: status.clone(),
            };
            if let Err(e) = updates.try_send(update) {
                warn!(run = %status.name, error = %e, "Dropping run status update");
            }
        });
        let subscription = self.watcher.register(resource_name, callback);
        self.subscriptions
            .insert(resource_name.to_string(), subscription);
    }

    /// Stop forwarding for `resource_name`. Idempotent.
    pub fn release(&self, resource_name: &str) {
        if let Some((_, subscription)) = self.subscriptions.remove(resource_name) {
            self.watcher.unregister(&subscription);
            debug!(run = %resource_name, "Released run subscription");
        }
    }

    #[must_use]
    pub fn tracked(&self) -> usize {
        self.subscriptions.len()
    }
}

/// Applies queued updates until `cancel` fires or every sender is dropped.
pub async fn run_status_pump(
    mut updates: mpsc::Receiver<StatusUpdate>,
    builds: Arc<super::BuildService>,
    workflows: Arc<super::WorkflowService>,
    cancel: CancellationToken,
) {
    info!("Status pump started");
    loop {
        let update = tokio::select! {
            () = cancel.cancelled() => break,
            next = updates.recv() => match next {
                Some(update) => update,
                None => break,
            },
        };

        let result = match update.owner {
            RunOwner::Build => builds.apply_watch_status(&update.run_id, &update.status).await,
            RunOwner::Workflow => {
                workflows
                    .apply_watch_status(&update.run_id, &update.status)
                    .await
            }
        };
        if let Err(e) = result {
            warn!(run_id = %update.run_id, error = %e, "Failed to apply run status");
        }
    }
    info!("Status pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MemoryResourceClient;
    use crate::crd::{ResourceKind, RunPhase};

    #[tokio::test]
    async fn callback_enqueues_and_release_unsubscribes() {
        let watcher = Arc::new(StatusWatcher::new(
            Arc::new(MemoryResourceClient::new()),
            ResourceKind::TaskRun,
            "ci",
        ));
        let (tx, mut rx) = status_channel();
        let tracker = RunTracker::new(RunOwner::Build, Arc::clone(&watcher), tx);

        tracker.track("build-c-run-1", "run-1");
        assert_eq!(tracker.tracked(), 1);

        let status = RunStatus {
            name: "build-c-run-1".into(),
            phase: RunPhase::Running,
            ..RunStatus::default()
        };
        assert!(watcher.registry().dispatch(&status));
        let update = rx.recv().await.unwrap();
        assert_eq!(update.owner, RunOwner::Build);
        assert_eq!(update.run_id, "run-1");
        assert_eq!(update.status.phase, RunPhase::Running);

        tracker.release("build-c-run-1");
        tracker.release("build-c-run-1");
        assert_eq!(tracker.tracked(), 0);
        assert!(!watcher.registry().dispatch(&status));
    }
}

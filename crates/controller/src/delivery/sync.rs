//! Sync trigger and convergence polling.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::client::ResourceClient;
use crate::crd::application::sync_patch;
use crate::crd::{ResourceKind, SyncResult};
use crate::error::{Error, Result};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const INITIATED_BY: &str = "zcicd";

pub struct SyncController {
    client: Arc<dyn ResourceClient>,
    namespace: String,
    poll_interval: Duration,
}

impl SyncController {
    pub fn new(client: Arc<dyn ResourceClient>, argo_namespace: &str) -> Self {
        Self {
            client,
            namespace: argo_namespace.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Override the poll interval. Zero is clamped to one millisecond.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Request a hard refresh and a sync to `revision`.
    ///
    /// Returns what the API server reports right after the patch, which is
    /// usually not converged yet.
    #[instrument(skip(self))]
    pub async fn trigger_sync(&self, app: &str, revision: &str) -> Result<SyncResult> {
        let patch = sync_patch(revision, INITIATED_BY);
        let doc = self
            .client
            .patch_merge(ResourceKind::Application, &self.namespace, app, &patch)
            .await
            .map_err(|e| {
                warn!(error = %e, "Sync trigger failed");
                e
            })?;
        info!("Triggered application sync");
        Ok(SyncResult::from_doc(&doc))
    }

    pub async fn get_sync_status(&self, app: &str) -> Result<SyncResult> {
        let doc = self
            .client
            .get(ResourceKind::Application, &self.namespace, app)
            .await?;
        Ok(SyncResult::from_doc(&doc))
    }

    /// Poll until the application is synced and no longer progressing.
    ///
    /// Returns [`Error::SyncTimeout`] once `timeout` elapses and
    /// [`Error::SyncCancelled`] when `cancel` fires, whichever comes first.
    /// Both bound in-flight status reads too. A failed read is retried on the
    /// next tick.
    #[instrument(skip(self, cancel), fields(timeout_secs = timeout.as_secs()))]
    pub async fn wait_for_sync(
        &self,
        app: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<SyncResult> {
        let deadline = Instant::now() + timeout;
        let poll = async {
            let mut ticker =
                time::interval_at(Instant::now() + self.poll_interval, self.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.get_sync_status(app).await {
                    Ok(result) if result.is_converged() => return result,
                    Ok(result) => {
                        debug!(status = %result.status, health = %result.health, "Still syncing");
                    }
                    Err(e) => warn!(error = %e, "Failed to read sync status, retrying"),
                }
            }
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!("Wait for sync cancelled");
                Err(Error::SyncCancelled { app: app.to_string() })
            }
            () = time::sleep_until(deadline) => {
                warn!("Timed out waiting for sync");
                Err(Error::SyncTimeout {
                    app: app.to_string(),
                    timeout_secs: timeout.as_secs(),
                })
            }
            result = poll => {
                info!(revision = %result.revision, health = %result.health, "Application converged");
                Ok(result)
            }
        }
    }
}

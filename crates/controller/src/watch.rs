//! Long-running watch tasks.
//!
//! A [`WatchTask`] owns one background loop over a resource kind. It has an
//! explicit start/stop contract: starting twice is a no-op and stopping is
//! safe to repeat, including from a shutdown path that races a manual stop.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::ResourceClient;
use crate::crd::ResourceKind;

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(2);

#[derive(Default)]
struct Running {
    cancel: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

/// Background watch over one resource kind in one namespace.
pub struct WatchTask {
    client: Arc<dyn ResourceClient>,
    kind: ResourceKind,
    namespace: String,
    running: Mutex<Running>,
}

impl WatchTask {
    pub fn new(client: Arc<dyn ResourceClient>, kind: ResourceKind, namespace: &str) -> Self {
        Self {
            client,
            kind,
            namespace: namespace.to_string(),
            running: Mutex::new(Running::default()),
        }
    }

    /// Spawn the loop, feeding each applied document to `handler`.
    ///
    /// Returns `false` without spawning when already running. `shutdown`
    /// cancels the loop as well as [`WatchTask::stop`].
    pub fn start<F>(&self, shutdown: &CancellationToken, handler: F) -> bool
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.cancel.as_ref().is_some_and(|c| !c.is_cancelled()) {
            debug!(kind = %self.kind, "Watch already running");
            return false;
        }

        let token = shutdown.child_token();
        let events = self.client.watch(self.kind, &self.namespace);
        let handle = tokio::spawn(run_loop(
            Arc::clone(&self.client),
            events,
            self.kind,
            self.namespace.clone(),
            token.clone(),
            handler,
        ));
        running.cancel = Some(token);
        running.handle = Some(handle);
        true
    }

    /// Signal the loop to exit. Safe to call any number of times.
    pub fn stop(&self) {
        let cancel = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel
            .take();
        if let Some(token) = cancel {
            token.cancel();
            info!(kind = %self.kind, namespace = %self.namespace, "Watch stopped");
        }
    }

    /// Stop and wait for the loop to finish.
    pub async fn shutdown(&self) {
        self.stop();
        let handle = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handle
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(kind = %self.kind, error = %e, "Watch task ended abnormally");
            }
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel
            .as_ref()
            .is_some_and(|c| !c.is_cancelled())
    }
}

async fn run_loop<F>(
    client: Arc<dyn ResourceClient>,
    mut events: BoxStream<'static, crate::error::Result<Value>>,
    kind: ResourceKind,
    namespace: String,
    cancel: CancellationToken,
    handler: F,
) where
    F: Fn(Value) + Send + Sync + 'static,
{
    info!(kind = %kind, namespace = %namespace, "Watch started");

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            next = events.next() => match next {
                Some(Ok(doc)) => handler(doc),
                Some(Err(e)) => {
                    warn!(kind = %kind, error = %e, "Watch stream error");
                }
                None => {
                    warn!(kind = %kind, "Watch stream ended, resubscribing");
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
                    }
                    events = client.watch(kind, &namespace);
                }
            },
        }
    }

    debug!(kind = %kind, namespace = %namespace, "Watch loop exited");
}

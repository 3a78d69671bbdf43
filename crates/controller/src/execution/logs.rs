//! Live build log relay over Redis pub/sub.
//!
//! Pod log lines are published to `build:logs:{run_id}`. Readers subscribe to
//! the same channel and receive lines through a bounded channel that closes
//! when the caller cancels or the subscription drops. Completed logs are kept
//! under `build:logs:archive:{run_id}`.

use async_trait::async_trait;
use futures::{AsyncBufReadExt, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, LogParams};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};

const SUBSCRIBER_BUFFER: usize = 100;

#[must_use]
pub fn log_channel(run_id: &str) -> String {
    format!("build:logs:{run_id}")
}

#[must_use]
pub fn archive_key(run_id: &str) -> String {
    format!("build:logs:archive:{run_id}")
}

/// Where build step logs go: followed per container, then archived whole.
#[async_trait]
pub trait BuildLogSink: Send + Sync {
    async fn stream_pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        run_id: &str,
        cancel: CancellationToken,
    ) -> Result<String>;

    async fn archive(&self, run_id: &str, logs: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct LogRelay {
    redis: redis::Client,
    conn: ConnectionManager,
    kube: Option<kube::Client>,
}

impl LogRelay {
    /// Connect to Redis. `kube` enables [`LogRelay::stream_pod_logs`].
    pub async fn connect(redis_url: &str, kube: Option<kube::Client>) -> Result<Self> {
        let redis = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(redis.clone()).await?;
        info!("Log relay connected to Redis");
        Ok(Self { redis, conn, kube })
    }

    pub async fn publish(&self, run_id: &str, line: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(log_channel(run_id), line).await?;
        Ok(())
    }

    /// Follow a container log and publish each line until it ends or `cancel` fires.
    ///
    /// Returns the published lines, newline-terminated.
    #[instrument(skip(self, cancel))]
    pub async fn stream_pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        run_id: &str,
        cancel: CancellationToken,
    ) -> Result<String> {
        let Some(kube) = &self.kube else {
            return Err(Error::Config(
                "log streaming requires a Kubernetes client".to_string(),
            ));
        };

        let pods: Api<Pod> = Api::namespaced(kube.clone(), namespace);
        let params = LogParams {
            container: Some(container.to_string()),
            follow: true,
            ..LogParams::default()
        };
        let reader = pods.log_stream(pod, &params).await?;
        let lines = reader.lines();
        futures::pin_mut!(lines);
        let mut published = 0_u64;
        let mut captured = String::new();

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("Log stream cancelled");
                    break;
                }
                next = lines.try_next() => match next? {
                    Some(line) => {
                        self.publish(run_id, &line).await?;
                        captured.push_str(&line);
                        captured.push('\n');
                        published += 1;
                    }
                    None => break,
                },
            }
        }

        info!(lines = published, "Pod log stream finished");
        Ok(captured)
    }

    /// Subscribe to live lines for `run_id`.
    pub async fn subscribe(
        &self,
        run_id: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<String>> {
        let channel = log_channel(run_id);
        let mut pubsub = self.redis.get_async_pubsub().await?;
        pubsub.subscribe(&channel).await?;

        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        tokio::spawn(async move {
            let messages = pubsub.into_on_message();
            futures::pin_mut!(messages);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tx.closed() => break,
                    msg = messages.next() => {
                        let Some(msg) = msg else { break };
                        let line: String = match msg.get_payload() {
                            Ok(line) => line,
                            Err(e) => {
                                warn!(channel = %channel, error = %e, "Dropping undecodable log line");
                                continue;
                            }
                        };
                        tokio::select! {
                            () = cancel.cancelled() => break,
                            sent = tx.send(line) => if sent.is_err() { break },
                        }
                    }
                }
            }
            debug!(channel = %channel, "Log subscription closed");
        });

        Ok(rx)
    }

    /// Store a completed log.
    pub async fn archive(&self, run_id: &str, logs: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(archive_key(run_id), logs).await?;
        Ok(())
    }

    pub async fn archived(&self, run_id: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(archive_key(run_id)).await?)
    }
}

#[async_trait]
impl BuildLogSink for LogRelay {
    async fn stream_pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        run_id: &str,
        cancel: CancellationToken,
    ) -> Result<String> {
        LogRelay::stream_pod_logs(self, namespace, pod, container, run_id, cancel).await
    }

    async fn archive(&self, run_id: &str, logs: &str) -> Result<()> {
        LogRelay::archive(self, run_id, logs).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_names() {
        assert_eq!(log_channel("run-42"), "build:logs:run-42");
        assert_eq!(archive_key("run-42"), "build:logs:archive:run-42");
    }
}

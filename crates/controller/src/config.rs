//! Controller configuration.
//!
//! Loaded from a mounted `ConfigMap` file, then selectively overridden from
//! the environment.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};

pub const ENV_CONFIG_PATH: &str = "CONTROLLER_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "/config/config.yaml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterMode {
    /// Talk to the API server through the in-cluster or kubeconfig client.
    #[default]
    Kube,
    /// Keep every resource in process. No cluster required.
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    #[serde(default)]
    pub mode: ClusterMode,
    #[serde(default = "default_execution_namespace")]
    pub execution_namespace: String,
    #[serde(default = "default_argo_namespace")]
    pub argo_namespace: String,
    #[serde(default = "default_rollout_namespace")]
    pub rollout_namespace: String,
}

fn default_execution_namespace() -> String {
    "zcicd-builds".to_string()
}

fn default_argo_namespace() -> String {
    "argocd".to_string()
}

fn default_rollout_namespace() -> String {
    "default".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            mode: ClusterMode::default(),
            execution_namespace: default_execution_namespace(),
            argo_namespace: default_argo_namespace(),
            rollout_namespace: default_rollout_namespace(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    /// Use the in-process lock store and skip the log relay.
    #[serde(default)]
    pub disabled: bool,
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            disabled: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryConfig {
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_seconds: u64,
    /// Interval between sync status reads while waiting for convergence.
    /// Defaults to 2 seconds, matching [`crate::delivery::sync::DEFAULT_POLL_INTERVAL`].
    #[serde(default = "default_poll_interval")]
    pub sync_poll_interval_seconds: u64,
    #[serde(default = "default_sync_timeout")]
    pub sync_timeout_seconds: u64,
    /// Block each deploy sync until the application converges. The sync
    /// timeout must then be shorter than `server.requestTimeoutSeconds`.
    #[serde(default)]
    pub wait_for_convergence: bool,
}

fn default_lock_ttl() -> u64 {
    60
}

fn default_poll_interval() -> u64 {
    2
}

fn default_sync_timeout() -> u64 {
    300 // 5 minutes
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            lock_ttl_seconds: default_lock_ttl(),
            sync_poll_interval_seconds: default_poll_interval(),
            sync_timeout_seconds: default_sync_timeout(),
            wait_for_convergence: false,
        }
    }
}

impl DeliveryConfig {
    #[must_use]
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_seconds)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.sync_poll_interval_seconds)
    }

    #[must_use]
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Upper bound on a single API request.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

/// Shared secrets for push webhooks. An unset secret skips verification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookSecrets {
    #[serde(default)]
    pub github_secret: Option<String>,
    #[serde(default)]
    pub gitlab_secret: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsConfig {
    /// Receiver for domain events. `EVENT_WEBHOOK_URL` takes precedence.
    #[serde(default)]
    pub webhook_url: Option<String>,
}

/// Main controller configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub webhooks: WebhookSecrets,
    #[serde(default)]
    pub events: EventsConfig,
}

impl ControllerConfig {
    /// Load configuration from mounted ConfigMap file
    pub fn from_mounted_file(config_path: &str) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .map_err(|e| Error::Config(format!("Failed to read config file {config_path}: {e}")))?;
        let config: ControllerConfig = serde_yaml::from_str(&config_str)?;
        Ok(config)
    }

    /// Apply environment overrides on top of the file values.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        let var = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());

        if let Some(mode) = var("CLUSTER_MODE") {
            match mode.to_ascii_lowercase().as_str() {
                "memory" => self.cluster.mode = ClusterMode::Memory,
                "kube" => self.cluster.mode = ClusterMode::Kube,
                other => warn!(mode = other, "Ignoring unknown CLUSTER_MODE"),
            }
        }
        if let Some(ns) = var("EXECUTION_NAMESPACE") {
            self.cluster.execution_namespace = ns;
        }
        if let Some(ns) = var("ARGO_NAMESPACE") {
            self.cluster.argo_namespace = ns;
        }
        if let Some(ns) = var("ROLLOUT_NAMESPACE") {
            self.cluster.rollout_namespace = ns;
        }
        if let Some(url) = var("REDIS_URL") {
            self.redis.url = url;
        }
        if let Some(addr) = var("LISTEN_ADDR") {
            self.server.listen_addr = addr;
        }
        if let Some(secret) = var("GITHUB_WEBHOOK_SECRET") {
            self.webhooks.github_secret = Some(secret);
        }
        if let Some(secret) = var("GITLAB_WEBHOOK_SECRET") {
            self.webhooks.gitlab_secret = Some(secret);
        }
        if let Some(wait) = var("SYNC_WAIT_FOR_CONVERGENCE") {
            self.delivery.wait_for_convergence = wait.eq_ignore_ascii_case("true") || wait == "1";
        }
        self
    }

    /// Validate that configuration has required fields
    pub fn validate(&self) -> Result<()> {
        let namespaces = [
            ("cluster.executionNamespace", &self.cluster.execution_namespace),
            ("cluster.argoNamespace", &self.cluster.argo_namespace),
            ("cluster.rolloutNamespace", &self.cluster.rollout_namespace),
        ];
        for (field, value) in namespaces {
            if value.trim().is_empty() {
                return Err(Error::Config(format!("{field} must not be empty")));
            }
        }
        if self.delivery.lock_ttl_seconds == 0 {
            return Err(Error::Config(
                "delivery.lockTtlSeconds must be greater than zero".to_string(),
            ));
        }
        if self.delivery.sync_poll_interval_seconds == 0 {
            return Err(Error::Config(
                "delivery.syncPollIntervalSeconds must be greater than zero".to_string(),
            ));
        }
        if self.server.request_timeout_seconds == 0 {
            return Err(Error::Config(
                "server.requestTimeoutSeconds must be greater than zero".to_string(),
            ));
        }
        if self.delivery.wait_for_convergence
            && self.delivery.sync_timeout_seconds >= self.server.request_timeout_seconds
        {
            return Err(Error::Config(format!(
                "delivery.syncTimeoutSeconds ({}) must be shorter than server.requestTimeoutSeconds ({}) when waitForConvergence is set",
                self.delivery.sync_timeout_seconds, self.server.request_timeout_seconds
            )));
        }
        Ok(())
    }
}

/// Load from `CONTROLLER_CONFIG_PATH` (or the default mount), falling back to
/// defaults when the file is missing or invalid. Environment overrides apply
/// either way.
#[must_use]
pub fn load_controller_config() -> ControllerConfig {
    let override_path = std::env::var(ENV_CONFIG_PATH).ok();
    let config_path = override_path
        .as_deref()
        .filter(|path| Path::new(path).exists())
        .unwrap_or(DEFAULT_CONFIG_PATH);

    let config = match ControllerConfig::from_mounted_file(config_path) {
        Ok(cfg) => {
            info!("Loaded controller configuration from {}", config_path);
            cfg
        }
        Err(err) => {
            warn!(
                "Failed to load configuration from {}: {}. Using defaults.",
                config_path, err
            );
            ControllerConfig::default()
        }
    };
    config.with_env_overrides()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    const OVERRIDE_VARS: [&str; 4] = [
        "CLUSTER_MODE",
        "EXECUTION_NAMESPACE",
        "REDIS_URL",
        ENV_CONFIG_PATH,
    ];

    fn clear_env() {
        for key in OVERRIDE_VARS {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn defaults_are_valid() {
        let config = ControllerConfig::default();
        assert_eq!(config.cluster.execution_namespace, "zcicd-builds");
        assert_eq!(config.cluster.argo_namespace, "argocd");
        assert_eq!(config.delivery.lock_ttl(), Duration::from_secs(60));
        assert_eq!(config.delivery.poll_interval(), Duration::from_secs(2));
        assert_eq!(config.delivery.sync_timeout(), Duration::from_secs(300));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let config: ControllerConfig = serde_yaml::from_str(
            "cluster:\n  mode: memory\n  argoNamespace: gitops\ndelivery:\n  waitForConvergence: true\n",
        )
        .unwrap();
        assert_eq!(config.cluster.mode, ClusterMode::Memory);
        assert_eq!(config.cluster.argo_namespace, "gitops");
        assert_eq!(config.cluster.execution_namespace, "zcicd-builds");
        assert!(config.delivery.wait_for_convergence);
        assert_eq!(config.delivery.poll_interval(), Duration::from_secs(2));
        assert_eq!(config.server.listen_addr, "0.0.0.0:8080");
        assert_eq!(config.server.request_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn convergence_wait_must_fit_inside_request_timeout() {
        let mut config = ControllerConfig::default();
        config.delivery.wait_for_convergence = true;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("requestTimeoutSeconds"));

        config.delivery.sync_timeout_seconds = 60;
        assert!(config.validate().is_err());

        config.delivery.sync_timeout_seconds = 45;
        assert!(config.validate().is_ok());

        config.delivery.sync_timeout_seconds = 300;
        config.server.request_timeout_seconds = 330;
        assert!(config.validate().is_ok());

        config.delivery.wait_for_convergence = false;
        config.server.request_timeout_seconds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_durations_and_empty_namespaces() {
        let mut config = ControllerConfig::default();
        config.delivery.lock_ttl_seconds = 0;
        assert!(config.validate().is_err());

        let mut config = ControllerConfig::default();
        config.delivery.sync_poll_interval_seconds = 0;
        assert!(config.validate().is_err());

        let mut config = ControllerConfig::default();
        config.cluster.execution_namespace = " ".into();
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn env_overrides_file_values() {
        clear_env();
        std::env::set_var("CLUSTER_MODE", "memory");
        std::env::set_var("EXECUTION_NAMESPACE", "ci");
        std::env::set_var("REDIS_URL", "redis://cache:6379");

        let config = ControllerConfig::default().with_env_overrides();
        assert_eq!(config.cluster.mode, ClusterMode::Memory);
        assert_eq!(config.cluster.execution_namespace, "ci");
        assert_eq!(config.redis.url, "redis://cache:6379");
        clear_env();
    }

    #[test]
    #[serial]
    fn loads_mounted_file() {
        clear_env();
        let path = std::env::temp_dir().join(format!("controller-config-{}.yaml", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "server:\n  listenAddr: 127.0.0.1:9000").unwrap();
        std::env::set_var(ENV_CONFIG_PATH, &path);

        let config = load_controller_config();
        assert_eq!(config.server.listen_addr, "127.0.0.1:9000");

        std::fs::remove_file(&path).unwrap();
        clear_env();
    }
}

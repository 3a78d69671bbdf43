//! Error types for the control plane.
//!
//! Every failure the engines or services can produce is an [`Error`]. User-facing
//! failures carry a stable numeric domain code; transport failures are collapsed
//! into a generic message before they leave the process.

use thiserror::Error;

/// Domain error codes surfaced to callers.
pub mod codes {
    pub const WORKFLOW_DISABLED: u32 = 40003;
    pub const INVALID_RUN_STATE: u32 = 40004;
    pub const WORKFLOW_NOT_FOUND: u32 = 40501;
    pub const WORKFLOW_RUN_NOT_FOUND: u32 = 40502;
    pub const BUILD_CONFIG_NOT_FOUND: u32 = 40601;
    pub const BUILD_RUN_NOT_FOUND: u32 = 40602;
    pub const DEPLOY_CONFIG_NOT_FOUND: u32 = 40701;
    pub const DEPLOY_HISTORY_NOT_FOUND: u32 = 40702;
    pub const DEPLOY_SYNC_FAILED: u32 = 40703;
    pub const DEPLOY_ROLLBACK_FAILED: u32 = 40704;
    pub const ROLLOUT_UNAVAILABLE: u32 = 40705;
    pub const GITOPS_LOCK_HELD: u32 = 40706;
    pub const APPROVAL_NOT_FOUND: u32 = 40801;
    pub const APPROVAL_ALREADY_DECIDED: u32 = 40802;
    pub const INTERNAL: u32 = 50000;
    pub const STORAGE: u32 = 50001;
    pub const EXTERNAL: u32 = 50002;
}

/// Kind of entity a lookup failed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Workflow,
    WorkflowRun,
    BuildConfig,
    BuildRun,
    DeployConfig,
    DeployHistory,
    Approval,
    Resource,
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Workflow => "workflow",
            Self::WorkflowRun => "workflow run",
            Self::BuildConfig => "build config",
            Self::BuildRun => "build run",
            Self::DeployConfig => "deploy config",
            Self::DeployHistory => "deploy history",
            Self::Approval => "approval",
            Self::Resource => "resource",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Watch stream error: {0}")]
    Watch(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Template rendering failed: {0}")]
    Render(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: Entity, id: String },

    #[error("{0}")]
    InvalidState(String),

    #[error("workflow is disabled: {0}")]
    WorkflowDisabled(String),

    #[error("run number {run_number} already allocated for {parent_id}")]
    RunNumberConflict { parent_id: String, run_number: u32 },

    #[error("sync failed: {0}")]
    SyncFailed(String),

    #[error("rollback failed: {0}")]
    RollbackFailed(String),

    #[error("timed out waiting for application {app} to sync after {timeout_secs}s")]
    SyncTimeout { app: String, timeout_secs: u64 },

    #[error("wait for application {app} to sync was cancelled")]
    SyncCancelled { app: String },

    #[error("gitops lock already held for {repo_url}, retry later")]
    LockHeld { repo_url: String },

    #[error("rollout controller not available")]
    RolloutUnavailable,

    #[error("approval already decided")]
    AlreadyDecided,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("{0}")]
    Internal(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Shorthand for a lookup miss.
    pub fn not_found(entity: Entity, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Stable domain code for this error.
    #[must_use]
    pub fn code(&self) -> u32 {
        match self {
            Self::NotFound { entity, .. } => match entity {
                Entity::Workflow => codes::WORKFLOW_NOT_FOUND,
                Entity::WorkflowRun => codes::WORKFLOW_RUN_NOT_FOUND,
                Entity::BuildConfig => codes::BUILD_CONFIG_NOT_FOUND,
                Entity::BuildRun => codes::BUILD_RUN_NOT_FOUND,
                Entity::DeployConfig => codes::DEPLOY_CONFIG_NOT_FOUND,
                Entity::DeployHistory => codes::DEPLOY_HISTORY_NOT_FOUND,
                Entity::Approval => codes::APPROVAL_NOT_FOUND,
                Entity::Resource => codes::EXTERNAL,
            },
            Self::InvalidState(_) => codes::INVALID_RUN_STATE,
            Self::WorkflowDisabled(_) => codes::WORKFLOW_DISABLED,
            Self::SyncFailed(_) | Self::SyncTimeout { .. } | Self::SyncCancelled { .. } => {
                codes::DEPLOY_SYNC_FAILED
            }
            Self::RollbackFailed(_) => codes::DEPLOY_ROLLBACK_FAILED,
            Self::RolloutUnavailable => codes::ROLLOUT_UNAVAILABLE,
            Self::LockHeld { .. } => codes::GITOPS_LOCK_HELD,
            Self::AlreadyDecided => codes::APPROVAL_ALREADY_DECIDED,
            Self::Storage(_) | Self::RunNumberConflict { .. } => codes::STORAGE,
            Self::Kube(_) | Self::Watch(_) | Self::Redis(_) | Self::Io(_) => codes::EXTERNAL,
            Self::Yaml(_)
            | Self::Json(_)
            | Self::Render(_)
            | Self::Config(_)
            | Self::Internal(_) => codes::INTERNAL,
        }
    }

    /// Whether the caller may retry the whole operation unchanged.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockHeld { .. } | Self::RunNumberConflict { .. } | Self::SyncTimeout { .. }
        )
    }

    /// Message safe to show outside the process.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self.code() {
            codes::INTERNAL | codes::STORAGE => "internal error".to_string(),
            codes::EXTERNAL => "external service error".to_string(),
            _ => self.to_string(),
        }
    }

    /// Kubernetes 404 on the underlying API call.
    #[must_use]
    pub fn is_kube_not_found(&self) -> bool {
        matches!(self, Self::Kube(kube::Error::Api(err)) if err.code == 404)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_held_is_retryable_with_gitops_code() {
        let err = Error::LockHeld {
            repo_url: "https://git.example.com/org/deploy.git".to_string(),
        };
        assert!(err.is_retryable());
        assert_eq!(err.code(), codes::GITOPS_LOCK_HELD);
        assert_eq!(
            err.to_string(),
            "gitops lock already held for https://git.example.com/org/deploy.git, retry later"
        );
    }

    #[test]
    fn not_found_codes_follow_entity() {
        assert_eq!(
            Error::not_found(Entity::BuildRun, "r1").code(),
            codes::BUILD_RUN_NOT_FOUND
        );
        assert_eq!(
            Error::not_found(Entity::Approval, "a1").code(),
            codes::APPROVAL_NOT_FOUND
        );
    }

    #[test]
    fn internal_details_are_not_leaked() {
        let err = Error::Storage("connection refused to 10.0.0.3:5432".to_string());
        assert_eq!(err.public_message(), "internal error");

        let err = Error::Watch("tls handshake eof".to_string());
        assert_eq!(err.public_message(), "external service error");

        assert_eq!(
            Error::RolloutUnavailable.public_message(),
            "rollout controller not available"
        );
    }

    #[test]
    fn timeout_and_cancel_are_distinct() {
        let timeout = Error::SyncTimeout {
            app: "a".into(),
            timeout_secs: 5,
        };
        let cancelled = Error::SyncCancelled { app: "a".into() };
        assert!(timeout.is_retryable());
        assert!(!cancelled.is_retryable());
        assert_ne!(timeout.to_string(), cancelled.to_string());
    }
}

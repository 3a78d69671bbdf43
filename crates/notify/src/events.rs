//! Domain event types for the CI/CD control plane.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Prefix shared by every event subject.
pub const SUBJECT_PREFIX: &str = "zcicd";

/// Kinds of domain events emitted by the orchestration services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "build.started")]
    BuildStarted,
    #[serde(rename = "build.completed")]
    BuildCompleted,
    #[serde(rename = "build.failed")]
    BuildFailed,
    #[serde(rename = "deploy.syncing")]
    DeploySyncing,
    #[serde(rename = "deploy.succeeded")]
    DeploySucceeded,
    #[serde(rename = "deploy.failed")]
    DeployFailed,
    #[serde(rename = "deploy.rollback")]
    DeployRollback,
    #[serde(rename = "workflow.started")]
    WorkflowStarted,
    #[serde(rename = "workflow.completed")]
    WorkflowCompleted,
    #[serde(rename = "gitops.update")]
    GitOpsUpdate,
}

impl EventType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::BuildStarted => "build.started",
            Self::BuildCompleted => "build.completed",
            Self::BuildFailed => "build.failed",
            Self::DeploySyncing => "deploy.syncing",
            Self::DeploySucceeded => "deploy.succeeded",
            Self::DeployFailed => "deploy.failed",
            Self::DeployRollback => "deploy.rollback",
            Self::WorkflowStarted => "workflow.started",
            Self::WorkflowCompleted => "workflow.completed",
            Self::GitOpsUpdate => "gitops.update",
        }
    }

    /// Wire subject, e.g. `zcicd.build.started`.
    #[must_use]
    pub fn subject(&self) -> String {
        format!("{SUBJECT_PREFIX}.{}", self.as_str())
    }

    /// Whether the event reports a failure.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::BuildFailed | Self::DeployFailed)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope carried by every channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub project_id: String,
    pub triggered_by: String,
    pub payload: Value,
}

impl DomainEvent {
    #[must_use]
    pub fn new(
        event_type: EventType,
        project_id: impl Into<String>,
        triggered_by: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            timestamp: Utc::now(),
            project_id: project_id.into(),
            triggered_by: triggered_by.into(),
            payload,
        }
    }

    #[must_use]
    pub fn subject(&self) -> String {
        self.event_type.subject()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn subjects_are_prefixed() {
        assert_eq!(EventType::GitOpsUpdate.subject(), "zcicd.gitops.update");
        assert_eq!(EventType::DeployRollback.to_string(), "deploy.rollback");
    }

    #[test]
    fn envelope_serializes_dotted_type() {
        let event = DomainEvent::new(
            EventType::BuildStarted,
            "p1",
            "u1",
            json!({"run_number": 3}),
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event_type"], "build.started");
        assert_eq!(value["project_id"], "p1");
        assert_eq!(value["payload"]["run_number"], 3);

        let back: DomainEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back.event_type, EventType::BuildStarted);
    }
}

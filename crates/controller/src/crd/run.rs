//! Execution run status (Tekton `PipelineRun` / `TaskRun`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{nested, nested_str, object_name};

/// Condition reasons Tekton reports for a cancelled run.
const CANCELLED_REASONS: [&str; 3] = ["TaskRunCancelled", "PipelineRunCancelled", "Cancelled"];

/// Lifecycle phase of an execution run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunPhase {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map the first Tekton condition to a phase.
///
/// Total over all inputs: `type != Succeeded` is still running, `True` succeeded,
/// `False` is cancelled or failed depending on the reason, anything else (e.g.
/// `Unknown`) is running.
#[must_use]
pub fn map_condition(cond_type: &str, cond_status: &str, reason: &str) -> RunPhase {
    if cond_type != "Succeeded" {
        return RunPhase::Running;
    }
    match cond_status {
        "True" => RunPhase::Succeeded,
        "False" if CANCELLED_REASONS.contains(&reason) => RunPhase::Cancelled,
        "False" => RunPhase::Failed,
        _ => RunPhase::Running,
    }
}

/// One step container inside a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StepStatus {
    pub name: String,
    pub container: String,
    pub phase: RunPhase,
}

impl StepStatus {
    fn from_doc(step: &Value) -> Self {
        let phase = if let Some(terminated) = step.get("terminated") {
            match terminated.get("exitCode").and_then(Value::as_i64) {
                Some(0) => RunPhase::Succeeded,
                _ => RunPhase::Failed,
            }
        } else if step.get("running").is_some() {
            RunPhase::Running
        } else {
            RunPhase::Pending
        };
        Self {
            name: nested_str(step, &["name"]),
            container: nested_str(step, &["container"]),
            phase,
        }
    }
}

/// Typed view over an execution resource's status block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RunStatus {
    pub name: String,
    pub phase: RunPhase,
    pub reason: String,
    pub message: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Pod executing a `TaskRun`. Empty for `PipelineRun`s.
    pub pod_name: String,
    pub steps: Vec<StepStatus>,
}

impl RunStatus {
    /// Decode from a raw `PipelineRun`/`TaskRun` document. Never fails.
    #[must_use]
    pub fn from_doc(doc: &Value) -> Self {
        let mut status = Self {
            name: object_name(doc),
            ..Self::default()
        };

        if let Some(cond) = nested(doc, &["status", "conditions"])
            .and_then(Value::as_array)
            .and_then(|conds| conds.first())
        {
            let cond_type = nested_str(cond, &["type"]);
            let cond_status = nested_str(cond, &["status"]);
            status.reason = nested_str(cond, &["reason"]);
            status.message = nested_str(cond, &["message"]);
            status.phase = map_condition(&cond_type, &cond_status, &status.reason);
        }

        status.started_at = parse_time(doc, &["status", "startTime"]);
        status.finished_at = parse_time(doc, &["status", "completionTime"]);
        status.pod_name = nested_str(doc, &["status", "podName"]);
        status.steps = nested(doc, &["status", "steps"])
            .and_then(Value::as_array)
            .map(|steps| {
                steps
                    .iter()
                    .filter(|s| s.is_object())
                    .map(StepStatus::from_doc)
                    .collect()
            })
            .unwrap_or_default();

        status
    }
}

fn parse_time(doc: &Value, path: &[&str]) -> Option<DateTime<Utc>> {
    let raw = nested_str(doc, path);
    DateTime::parse_from_rfc3339(&raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

//! Argo Rollouts status decoding.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{nested, nested_str};

pub const PROMOTE_ANNOTATION: &str = "rollout.argoproj.io/promote";
pub const ABORT_ANNOTATION: &str = "rollout.argoproj.io/abort";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RolloutStatus {
    /// Healthy, Degraded, Paused, Progressing, or Unknown when the rollout has no status yet.
    pub phase: String,
    pub current_step: u32,
    pub total_steps: u32,
    pub stable_revision: String,
    pub canary_revision: String,
    pub message: String,
}

impl RolloutStatus {
    #[must_use]
    pub fn from_doc(doc: &Value) -> Self {
        let total_steps = nested(doc, &["spec", "strategy", "canary", "steps"])
            .and_then(Value::as_array)
            .map_or(0, |steps| u32::try_from(steps.len()).unwrap_or(u32::MAX));

        let Some(status) = doc.get("status").filter(|s| s.is_object()) else {
            return Self {
                phase: "Unknown".to_string(),
                total_steps,
                ..Self::default()
            };
        };

        Self {
            phase: nested_str(status, &["phase"]),
            current_step: status
                .get("currentStepIndex")
                .and_then(Value::as_u64)
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(0),
            total_steps,
            stable_revision: nested_str(status, &["stableRS"]),
            canary_revision: nested_str(status, &["currentPodHash"]),
            message: nested_str(status, &["message"]),
        }
    }
}

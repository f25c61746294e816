use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{Display, EnumString};
use time::OffsetDateTime;

/// Terminal and non-terminal states of a checkpointed run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RunStatus {
    /// Created but not yet started.
    Pending,
    /// In flight.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Exceeded its deadline.
    Timeout,
    /// Cancelled by an operator or the process glue.
    Aborted,
}

impl RunStatus {
    /// Whether the run can no longer change.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Timeout | RunStatus::Aborted
        )
    }
}

/// One orchestrated run, keyed by trace id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Correlation scope of the run.
    pub trace_id: String,
    /// Graph driving the run.
    pub graph_id: String,
    /// Version of the graph definition.
    pub graph_version: String,
    /// Current status.
    pub status: RunStatus,
    /// When the run began.
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    /// When the run reached a terminal status.
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    /// Error detail for failed runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Free-form run metadata.
    #[serde(default)]
    pub metadata: Value,
}

/// One deterministic state transition within a run.
/// Unique on `(trace_id, step_index)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Run this step belongs to.
    pub trace_id: String,
    /// Position within the run.
    pub step_index: i32,
    /// Graph node executed.
    pub node_id: String,
    /// Order-independent digest of the post-step graph state.
    pub state_hash: String,
    /// Digest of the step input.
    pub input_hash: String,
    /// Digest of the step output.
    pub output_hash: String,
    /// Edge taken out of the node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_edge: Option<String>,
    /// When the step started.
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    /// Step duration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    /// Error detail when the step failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Kinds of externally observable I/O captured for replay.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ActivityType {
    /// Agent-to-agent message exchange.
    A2a,
    /// Tool invocation over MCP.
    Mcp,
    /// Artifact read.
    ArtifactRead,
    /// Artifact write.
    ArtifactWrite,
    /// Clock read.
    Time,
    /// Randomness draw.
    Random,
    /// Outbound HTTP call.
    Http,
    /// Database access.
    Database,
}

/// One recorded activity.
/// Unique on `(trace_id, step_index, activity_type, request_hash)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    /// Run the activity belongs to.
    pub trace_id: String,
    /// Step the activity occurred in.
    pub step_index: i32,
    /// What kind of I/O this was.
    pub activity_type: ActivityType,
    /// Digest of the canonical request bytes; the dedupe key within a step.
    pub request_hash: String,
    /// The request as issued.
    pub request_data: Value,
    /// Inline response, when it fits under the blob threshold.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_data: Option<Value>,
    /// Object-store reference for responses above the threshold.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_blob_ref: Option<String>,
    /// When the activity completed.
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// Activity duration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    /// Error detail when the activity failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A step with its recorded activities, in recorded order. The unit of
/// [`crate::traits::Checkpointer::replay`] output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReplay {
    /// The recorded step.
    pub step: StepRecord,
    /// Activities recorded within the step.
    pub activities: Vec<ActivityRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Timeout.is_terminal());
        assert!(RunStatus::Aborted.is_terminal());
    }

    #[test]
    fn activity_type_wire_names_are_kebab() {
        assert_eq!(
            serde_json::to_string(&ActivityType::ArtifactRead).unwrap(),
            "\"artifact-read\""
        );
        assert_eq!(ActivityType::A2a.to_string(), "a2a");
    }
}

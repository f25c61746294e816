use std::fmt::Debug;

use async_trait::async_trait;

use crate::{ActivityRecord, CheckpointError, RunRecord, RunStatus, StepRecord, StepReplay};

/// The durable run / step / activity journal.
///
/// Replay of a step must reproduce the same `state_hash` given identical
/// recorded activities; that is the whole point of this component.
#[async_trait]
pub trait Checkpointer: Send + Sync + Debug {
    /// Register a graph definition runs can reference. Idempotent on
    /// `(graph_id, graph_version)`.
    async fn register_graph(
        &self,
        graph_id: &str,
        graph_version: &str,
        definition: serde_json::Value,
    ) -> Result<(), CheckpointError>;

    /// Record the start of a run. Idempotent on `trace_id`.
    async fn begin_run(&self, run: RunRecord) -> Result<(), CheckpointError>;

    /// Move a run to a terminal status.
    async fn complete_run(
        &self,
        trace_id: &str,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<(), CheckpointError>;

    /// Look up one run.
    async fn get_run(&self, trace_id: &str) -> Result<Option<RunRecord>, CheckpointError>;

    /// Record a step. Unique on `(trace_id, step_index)`; re-recording the
    /// same step upserts idempotently.
    async fn record_step(&self, step: StepRecord) -> Result<(), CheckpointError>;

    /// Record an activity. Unique on `(trace_id, step_index, activity_type,
    /// request_hash)`; an identical request within a step is silently
    /// deduplicated. Returns `false` when deduplicated.
    async fn record_activity(&self, activity: ActivityRecord) -> Result<bool, CheckpointError>;

    /// The ordered `(step, activities)` stream for re-driving a graph
    /// runtime deterministically.
    async fn replay(&self, trace_id: &str) -> Result<Vec<StepReplay>, CheckpointError>;

    /// Remove terminal runs older than the retention window, cascading to
    /// their steps and activities. Returns runs removed.
    async fn cleanup_old_executions(&self, retention_days: u32) -> Result<u64, CheckpointError>;

    /// Release the journal's resources during shutdown. Idempotent.
    async fn close(&self) -> Result<(), CheckpointError> {
        Ok(())
    }
}

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{ActiveValue::Set, ColumnTrait, EntityTrait, Insert, QueryFilter, QueryOrder};
use time::OffsetDateTime;
use tracing::{debug, instrument};

use cmo_core::traits::{Checkpointer, ObjectStore};
use cmo_core::{
    ActivityRecord, CheckpointError, RunRecord, RunStatus, StepRecord, StepReplay,
};

use super::date_time;
use super::entities::{cmo_activity, cmo_graph, cmo_run, cmo_step};
use super::Db;

/// Checkpoint journal on Postgres, with blob externalization for large
/// activity responses.
#[derive(Clone, Debug)]
pub struct PostgresCheckpointer {
    db: Db,
    blob: Arc<dyn ObjectStore>,
    max_inline_bytes: usize,
}

fn store_err(e: sea_orm::DbErr) -> CheckpointError {
    CheckpointError::Store(e.to_string())
}

fn json_err(e: serde_json::Error) -> CheckpointError {
    CheckpointError::Store(e.to_string())
}

fn to_run(model: cmo_run::Model) -> Result<RunRecord, CheckpointError> {
    let status: RunStatus = model
        .status
        .parse()
        .map_err(|_| CheckpointError::Store(format!("bad run status `{}`", model.status)))?;
    Ok(RunRecord {
        trace_id: model.trace_id,
        graph_id: model.graph_id,
        graph_version: model.graph_version,
        status,
        started_at: date_time::from_db(model.started_at),
        completed_at: model.completed_at.map(date_time::from_db),
        error: model.error,
        metadata: model.metadata,
    })
}

fn to_step(model: cmo_step::Model) -> StepRecord {
    StepRecord {
        trace_id: model.trace_id,
        step_index: model.step_index,
        node_id: model.node_id,
        state_hash: model.state_hash,
        input_hash: model.input_hash,
        output_hash: model.output_hash,
        next_edge: model.next_edge,
        started_at: date_time::from_db(model.started_at),
        duration_ms: model.duration_ms,
        error: model.error,
    }
}

fn to_activity(model: cmo_activity::Model) -> Result<ActivityRecord, CheckpointError> {
    let activity_type = model.activity_type.parse().map_err(|_| {
        CheckpointError::Store(format!("bad activity type `{}`", model.activity_type))
    })?;
    Ok(ActivityRecord {
        trace_id: model.trace_id,
        step_index: model.step_index,
        activity_type,
        request_hash: model.request_hash,
        request_data: model.request_data,
        response_data: model.response_data,
        response_blob_ref: model.response_blob_ref,
        timestamp: date_time::from_db(model.timestamp),
        duration_ms: model.duration_ms,
        error: model.error,
    })
}

impl PostgresCheckpointer {
    /// A checkpointer over the shared database, externalizing responses
    /// above `max_inline_bytes` to `blob`.
    pub fn new(db: Db, blob: Arc<dyn ObjectStore>, max_inline_bytes: usize) -> Self {
        Self {
            db,
            blob,
            max_inline_bytes,
        }
    }
}

#[async_trait]
impl Checkpointer for PostgresCheckpointer {
    async fn register_graph(
        &self,
        graph_id: &str,
        graph_version: &str,
        definition: serde_json::Value,
    ) -> Result<(), CheckpointError> {
        let model = cmo_graph::ActiveModel {
            graph_id: Set(graph_id.to_string()),
            graph_version: Set(graph_version.to_string()),
            definition: Set(definition),
            time_created: Set(date_time::now()),
        };
        Insert::one(model)
            .on_conflict(
                OnConflict::columns([
                    cmo_graph::Column::GraphId,
                    cmo_graph::Column::GraphVersion,
                ])
                .do_nothing()
                .to_owned(),
            )
            .exec_without_returning(self.db.conn())
            .await
            .map_err(store_err)?;
        Ok(())
    }

    #[instrument(skip(self, run), fields(trace_id = %run.trace_id))]
    async fn begin_run(&self, run: RunRecord) -> Result<(), CheckpointError> {
        let model = cmo_run::ActiveModel {
            trace_id: Set(run.trace_id.clone()),
            graph_id: Set(run.graph_id.clone()),
            graph_version: Set(run.graph_version.clone()),
            status: Set(run.status.to_string()),
            started_at: Set(date_time::to_db(run.started_at)),
            completed_at: Set(run.completed_at.map(date_time::to_db)),
            error: Set(run.error.clone()),
            metadata: Set(run.metadata.clone()),
        };
        Insert::one(model)
            .on_conflict(
                OnConflict::column(cmo_run::Column::TraceId)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(self.db.conn())
            .await
            .map_err(store_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn complete_run(
        &self,
        trace_id: &str,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<(), CheckpointError> {
        let result = cmo_run::Entity::update_many()
            .col_expr(cmo_run::Column::Status, Expr::value(status.to_string()))
            .col_expr(
                cmo_run::Column::CompletedAt,
                Expr::value(Some(date_time::now())),
            )
            .col_expr(cmo_run::Column::Error, Expr::value(error))
            .filter(cmo_run::Column::TraceId.eq(trace_id))
            .exec(self.db.conn())
            .await
            .map_err(store_err)?;
        if result.rows_affected == 0 {
            return Err(CheckpointError::Store(format!(
                "no run for trace `{trace_id}`"
            )));
        }
        Ok(())
    }

    async fn get_run(&self, trace_id: &str) -> Result<Option<RunRecord>, CheckpointError> {
        cmo_run::Entity::find_by_id(trace_id)
            .one(self.db.conn())
            .await
            .map_err(store_err)?
            .map(to_run)
            .transpose()
    }

    #[instrument(skip(self, step), fields(trace_id = %step.trace_id, step_index = step.step_index))]
    async fn record_step(&self, step: StepRecord) -> Result<(), CheckpointError> {
        let model = cmo_step::ActiveModel {
            trace_id: Set(step.trace_id.clone()),
            step_index: Set(step.step_index),
            node_id: Set(step.node_id.clone()),
            state_hash: Set(step.state_hash.clone()),
            input_hash: Set(step.input_hash.clone()),
            output_hash: Set(step.output_hash.clone()),
            next_edge: Set(step.next_edge.clone()),
            started_at: Set(date_time::to_db(step.started_at)),
            duration_ms: Set(step.duration_ms),
            error: Set(step.error.clone()),
            ..Default::default()
        };
        Insert::one(model)
            .on_conflict(
                OnConflict::columns([cmo_step::Column::TraceId, cmo_step::Column::StepIndex])
                    .update_columns([
                        cmo_step::Column::NodeId,
                        cmo_step::Column::StateHash,
                        cmo_step::Column::InputHash,
                        cmo_step::Column::OutputHash,
                        cmo_step::Column::NextEdge,
                        cmo_step::Column::DurationMs,
                        cmo_step::Column::Error,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(self.db.conn())
            .await
            .map_err(store_err)?;
        Ok(())
    }

    #[instrument(
        skip(self, activity),
        fields(trace_id = %activity.trace_id, step_index = activity.step_index)
    )]
    async fn record_activity(&self, activity: ActivityRecord) -> Result<bool, CheckpointError> {
        let mut response_data = activity.response_data.clone();
        let mut response_blob_ref = activity.response_blob_ref.clone();
        if let Some(response) = &response_data {
            let bytes = serde_json::to_vec(response).map_err(json_err)?;
            if bytes.len() > self.max_inline_bytes {
                let key = format!("activity/{}", cmo_core::utils::sha256_hex(&bytes));
                self.blob.put(&key, &bytes).await?;
                debug!(key, size = bytes.len(), "externalized activity response");
                response_blob_ref = Some(key);
                response_data = None;
            }
        }

        let model = cmo_activity::ActiveModel {
            trace_id: Set(activity.trace_id.clone()),
            step_index: Set(activity.step_index),
            activity_type: Set(activity.activity_type.to_string()),
            request_hash: Set(activity.request_hash.clone()),
            request_data: Set(activity.request_data.clone()),
            response_data: Set(response_data),
            response_blob_ref: Set(response_blob_ref),
            timestamp: Set(date_time::to_db(activity.timestamp)),
            duration_ms: Set(activity.duration_ms),
            error: Set(activity.error.clone()),
            ..Default::default()
        };
        let inserted = Insert::one(model)
            .on_conflict(
                OnConflict::columns([
                    cmo_activity::Column::TraceId,
                    cmo_activity::Column::StepIndex,
                    cmo_activity::Column::ActivityType,
                    cmo_activity::Column::RequestHash,
                ])
                .do_nothing()
                .to_owned(),
            )
            .exec_without_returning(self.db.conn())
            .await
            .map_err(store_err)?;
        Ok(inserted > 0)
    }

    #[instrument(skip(self))]
    async fn replay(&self, trace_id: &str) -> Result<Vec<StepReplay>, CheckpointError> {
        let steps = cmo_step::Entity::find()
            .filter(cmo_step::Column::TraceId.eq(trace_id))
            .order_by_asc(cmo_step::Column::StepIndex)
            .all(self.db.conn())
            .await
            .map_err(store_err)?;
        let activities = cmo_activity::Entity::find()
            .filter(cmo_activity::Column::TraceId.eq(trace_id))
            .order_by_asc(cmo_activity::Column::Id)
            .all(self.db.conn())
            .await
            .map_err(store_err)?;

        let mut by_step: BTreeMap<i32, Vec<ActivityRecord>> = BTreeMap::new();
        for model in activities {
            let mut activity = to_activity(model)?;
            // Give replay complete data: pull externalized responses back in.
            if activity.response_data.is_none() {
                if let Some(reference) = &activity.response_blob_ref {
                    let bytes = self.blob.get(reference).await?;
                    activity.response_data =
                        Some(serde_json::from_slice(&bytes).map_err(json_err)?);
                }
            }
            by_step.entry(activity.step_index).or_default().push(activity);
        }

        Ok(steps
            .into_iter()
            .map(|model| {
                let step = to_step(model);
                let activities = by_step.remove(&step.step_index).unwrap_or_default();
                StepReplay { step, activities }
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn cleanup_old_executions(&self, retention_days: u32) -> Result<u64, CheckpointError> {
        let cutoff = date_time::to_db(
            OffsetDateTime::now_utc() - time::Duration::days(retention_days as i64),
        );
        let terminal = [
            RunStatus::Completed.to_string(),
            RunStatus::Failed.to_string(),
            RunStatus::Timeout.to_string(),
            RunStatus::Aborted.to_string(),
        ];
        let old_runs: Vec<String> = cmo_run::Entity::find()
            .filter(cmo_run::Column::Status.is_in(terminal))
            .filter(cmo_run::Column::StartedAt.lt(cutoff))
            .all(self.db.conn())
            .await
            .map_err(store_err)?
            .into_iter()
            .map(|m| m.trace_id)
            .collect();
        if old_runs.is_empty() {
            return Ok(0);
        }

        cmo_activity::Entity::delete_many()
            .filter(cmo_activity::Column::TraceId.is_in(old_runs.clone()))
            .exec(self.db.conn())
            .await
            .map_err(store_err)?;
        cmo_step::Entity::delete_many()
            .filter(cmo_step::Column::TraceId.is_in(old_runs.clone()))
            .exec(self.db.conn())
            .await
            .map_err(store_err)?;
        let result = cmo_run::Entity::delete_many()
            .filter(cmo_run::Column::TraceId.is_in(old_runs))
            .exec(self.db.conn())
            .await
            .map_err(store_err)?;
        Ok(result.rows_affected)
    }

    async fn close(&self) -> Result<(), CheckpointError> {
        self.db.close().await.map_err(store_err)
    }
}

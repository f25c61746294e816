use async_trait::async_trait;
use sea_orm::sea_query::OnConflict;
use sea_orm::{ActiveValue::Set, ColumnTrait, EntityTrait, Insert, QueryFilter, QueryOrder};
use tracing::instrument;

use cmo_core::traits::{GradingInsert, GradingStore};
use cmo_core::{Decision, DecisionError, GradingEvent};

use super::date_time;
use super::entities::cmo_grading_event;
use super::Db;

/// Grading-event persistence on Postgres. The unique constraint on
/// `idempotency_key` is the durable at-most-once layer.
#[derive(Clone, Debug)]
pub struct PostgresGradingStore {
    db: Db,
}

fn store_err(e: impl std::fmt::Display) -> DecisionError {
    DecisionError::Store(e.to_string())
}

fn to_event(model: cmo_grading_event::Model) -> Result<GradingEvent, DecisionError> {
    let decision: Decision = model.decision.parse().map_err(store_err)?;
    let reasons: Vec<String> = serde_json::from_value(model.reasons).map_err(store_err)?;
    Ok(GradingEvent {
        message_id: model.message_id,
        trace_id: model.trace_id,
        attempt_no: model.attempt_no as u32,
        decision,
        qscore: model.qscore,
        reasons,
        idempotency_key: model.idempotency_key,
        specialist_id: model.specialist_id,
        retry_target_specialist: model.retry_target_specialist,
        created_at: date_time::from_db(model.created_at),
    })
}

impl PostgresGradingStore {
    /// A store over the shared database handle.
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl GradingStore for PostgresGradingStore {
    #[instrument(skip(self, event), fields(idempotency_key = %event.idempotency_key))]
    async fn insert_once(&self, event: GradingEvent) -> Result<GradingInsert, DecisionError> {
        let reasons = serde_json::to_value(&event.reasons).map_err(store_err)?;
        let model = cmo_grading_event::ActiveModel {
            message_id: Set(event.message_id.clone()),
            trace_id: Set(event.trace_id.clone()),
            attempt_no: Set(event.attempt_no as i32),
            decision: Set(event.decision.to_string()),
            qscore: Set(event.qscore),
            reasons: Set(reasons),
            idempotency_key: Set(event.idempotency_key.clone()),
            specialist_id: Set(event.specialist_id.clone()),
            retry_target_specialist: Set(event.retry_target_specialist.clone()),
            created_at: Set(date_time::to_db(event.created_at)),
        };
        let inserted = Insert::one(model)
            .on_conflict(
                OnConflict::column(cmo_grading_event::Column::IdempotencyKey)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(self.db.conn())
            .await
            .map_err(store_err)?;
        if inserted > 0 {
            return Ok(GradingInsert::Inserted);
        }
        let existing = self
            .get_by_idempotency_key(&event.idempotency_key)
            .await?
            .ok_or_else(|| store_err("conflicting grading event vanished"))?;
        Ok(GradingInsert::Existing(existing))
    }

    async fn get_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<GradingEvent>, DecisionError> {
        cmo_grading_event::Entity::find()
            .filter(cmo_grading_event::Column::IdempotencyKey.eq(key))
            .one(self.db.conn())
            .await
            .map_err(store_err)?
            .map(to_event)
            .transpose()
    }

    async fn events_for_trace(&self, trace_id: &str) -> Result<Vec<GradingEvent>, DecisionError> {
        cmo_grading_event::Entity::find()
            .filter(cmo_grading_event::Column::TraceId.eq(trace_id))
            .order_by_asc(cmo_grading_event::Column::AttemptNo)
            .all(self.db.conn())
            .await
            .map_err(store_err)?
            .into_iter()
            .map(to_event)
            .collect()
    }
}

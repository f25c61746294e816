use sea_orm::entity::prelude::*;

/// One grading outcome. At most one row per idempotency key.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "cmo_grading_events")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub message_id: String,
    pub trace_id: String,
    pub attempt_no: i32,
    pub decision: String,
    pub qscore: f64,
    pub reasons: Json,
    #[sea_orm(unique)]
    pub idempotency_key: String,
    pub specialist_id: String,
    pub retry_target_specialist: Option<String>,
    pub created_at: TimeDateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

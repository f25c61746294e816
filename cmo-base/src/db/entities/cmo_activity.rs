use sea_orm::entity::prelude::*;

/// One recorded non-deterministic input. Unique on
/// `(trace_id, step_index, activity_type, request_hash)`.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "cmo_activities")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub trace_id: String,
    pub step_index: i32,
    pub activity_type: String,
    pub request_hash: String,
    pub request_data: Json,
    pub response_data: Option<Json>,
    pub response_blob_ref: Option<String>,
    pub timestamp: TimeDateTime,
    pub duration_ms: Option<i64>,
    pub error: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::cmo_run::Entity",
        from = "Column::TraceId",
        to = "super::cmo_run::Column::TraceId"
    )]
    CmoRun,
}

impl Related<super::cmo_run::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::CmoRun.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

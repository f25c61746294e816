use sea_orm::entity::prelude::*;

/// One recorded state transition. Unique on `(trace_id, step_index)`.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "cmo_steps")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub trace_id: String,
    pub step_index: i32,
    pub node_id: String,
    pub state_hash: String,
    pub input_hash: String,
    pub output_hash: String,
    pub next_edge: Option<String>,
    pub started_at: TimeDateTime,
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

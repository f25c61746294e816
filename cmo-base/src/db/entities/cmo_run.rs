use sea_orm::entity::prelude::*;

/// One orchestrated run, keyed by trace id.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "cmo_runs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub trace_id: String,
    pub graph_id: String,
    pub graph_version: String,
    pub status: String,
    pub started_at: TimeDateTime,
    pub completed_at: Option<TimeDateTime>,
    pub error: Option<String>,
    pub metadata: Json,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::cmo_step::Entity")]
    CmoStep,
}

impl Related<super::cmo_step::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::CmoStep.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

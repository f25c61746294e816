use sea_orm::entity::prelude::*;

/// One versioned graph definition referenced by runs.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "cmo_graphs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub graph_id: String,
    #[sea_orm(primary_key, auto_increment = false)]
    pub graph_version: String,
    pub definition: Json,
    pub time_created: TimeDateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

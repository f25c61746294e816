use sea_orm::entity::prelude::*;

/// One registered agent.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "agents")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub agent_id: String,
    pub version: String,
    pub tenant: String,
    pub project: String,
    pub capabilities: Json,
    pub status: String,
    pub last_heartbeat: Option<TimeDateTime>,
    pub lease_until: TimeDateTime,
    pub metadata: Json,
    pub time_created: TimeDateTime,
    pub time_updated: TimeDateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::agent_topic::Entity")]
    AgentTopic,
}

impl Related<super::agent_topic::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::AgentTopic.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

use sea_orm_migration::prelude::*;

use crate::m20250601_000001_create_table_agent::Agent;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(AgentTopic::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(AgentTopic::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(AgentTopic::AgentId).text().not_null())
                    .col(ColumnDef::new(AgentTopic::Topic).text().not_null())
                    .col(ColumnDef::new(AgentTopic::Role).text().not_null())
                    .col(
                        ColumnDef::new(AgentTopic::TimeCreated)
                            .timestamp()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .from(AgentTopic::Table, AgentTopic::AgentId)
                            .to(Agent::Table, Agent::AgentId)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .table(AgentTopic::Table)
                    .name("uq_agent_topics_tuple")
                    .col(AgentTopic::AgentId)
                    .col(AgentTopic::Topic)
                    .col(AgentTopic::Role)
                    .unique()
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(AgentTopic::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
pub enum AgentTopic {
    #[iden = "agent_topics"]
    Table,
    Id,
    /// Subscribing agent
    AgentId,
    /// Topic name
    Topic,
    /// publisher, subscriber or both
    Role,
    /// Time of record creation
    TimeCreated,
}

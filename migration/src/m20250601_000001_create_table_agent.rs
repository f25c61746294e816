use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Agent::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Agent::AgentId)
                            .text()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Agent::Version).text().not_null())
                    .col(ColumnDef::new(Agent::Tenant).text().not_null())
                    .col(ColumnDef::new(Agent::Project).text().not_null())
                    .col(ColumnDef::new(Agent::Capabilities).json_binary().not_null())
                    .col(ColumnDef::new(Agent::Status).text().not_null())
                    .col(ColumnDef::new(Agent::LastHeartbeat).timestamp())
                    .col(ColumnDef::new(Agent::LeaseUntil).timestamp().not_null())
                    .col(ColumnDef::new(Agent::Metadata).json_binary().not_null())
                    .col(ColumnDef::new(Agent::TimeCreated).timestamp().not_null())
                    .col(ColumnDef::new(Agent::TimeUpdated).timestamp().not_null())
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .table(Agent::Table)
                    .name("idx_agents_scope_status")
                    .col(Agent::Tenant)
                    .col(Agent::Project)
                    .col(Agent::Status)
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .table(Agent::Table)
                    .name("idx_agents_lease_until")
                    .col(Agent::LeaseUntil)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Agent::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
pub enum Agent {
    #[iden = "agents"]
    Table,
    /// Agent identifier
    AgentId,
    /// Agent software version
    Version,
    /// Tenant scope
    Tenant,
    /// Project scope
    Project,
    /// Served capabilities
    Capabilities,
    /// Liveness status
    Status,
    /// Last heartbeat observed
    LastHeartbeat,
    /// Liveness claim expiry
    LeaseUntil,
    /// Operator metadata
    Metadata,
    /// Time of record creation
    TimeCreated,
    /// Time of the last record update
    TimeUpdated,
}

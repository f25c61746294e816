use sea_orm_migration::prelude::*;

use crate::m20250601_000002_create_table_cmo_run::CmoRun;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(CmoStep::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(CmoStep::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(CmoStep::TraceId).text().not_null())
                    .col(ColumnDef::new(CmoStep::StepIndex).integer().not_null())
                    .col(ColumnDef::new(CmoStep::NodeId).text().not_null())
                    .col(ColumnDef::new(CmoStep::StateHash).text().not_null())
                    .col(ColumnDef::new(CmoStep::InputHash).text().not_null())
                    .col(ColumnDef::new(CmoStep::OutputHash).text().not_null())
                    .col(ColumnDef::new(CmoStep::NextEdge).text())
                    .col(ColumnDef::new(CmoStep::StartedAt).timestamp().not_null())
                    .col(ColumnDef::new(CmoStep::DurationMs).big_integer())
                    .col(ColumnDef::new(CmoStep::Error).text())
                    .foreign_key(
                        ForeignKey::create()
                            .from(CmoStep::Table, CmoStep::TraceId)
                            .to(CmoRun::Table, CmoRun::TraceId)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .table(CmoStep::Table)
                    .name("uq_cmo_steps_trace_index")
                    .col(CmoStep::TraceId)
                    .col(CmoStep::StepIndex)
                    .unique()
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(CmoStep::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
pub enum CmoStep {
    #[iden = "cmo_steps"]
    Table,
    Id,
    /// Run this step belongs to
    TraceId,
    /// Position within the run
    StepIndex,
    /// Graph node executed
    NodeId,
    /// Digest of the post-step graph state
    StateHash,
    /// Digest of the step input
    InputHash,
    /// Digest of the step output
    OutputHash,
    /// Edge taken out of the node
    NextEdge,
    /// When the step started
    StartedAt,
    /// Step duration
    DurationMs,
    /// Error detail when the step failed
    Error,
}

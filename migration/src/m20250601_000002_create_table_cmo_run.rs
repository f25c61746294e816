use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(CmoRun::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(CmoRun::TraceId)
                            .text()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(CmoRun::GraphId).text().not_null())
                    .col(ColumnDef::new(CmoRun::GraphVersion).text().not_null())
                    .col(ColumnDef::new(CmoRun::Status).text().not_null())
                    .col(ColumnDef::new(CmoRun::StartedAt).timestamp().not_null())
                    .col(ColumnDef::new(CmoRun::CompletedAt).timestamp())
                    .col(ColumnDef::new(CmoRun::Error).text())
                    .col(ColumnDef::new(CmoRun::Metadata).json_binary().not_null())
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .table(CmoRun::Table)
                    .name("idx_cmo_runs_status_started")
                    .col(CmoRun::Status)
                    .col(CmoRun::StartedAt)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(CmoRun::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
pub enum CmoRun {
    #[iden = "cmo_runs"]
    Table,
    /// Correlation scope of the run
    TraceId,
    /// Graph driving the run
    GraphId,
    /// Graph definition version
    GraphVersion,
    /// Run status
    Status,
    /// When the run began
    StartedAt,
    /// When the run reached a terminal status
    CompletedAt,
    /// Error detail for failed runs
    Error,
    /// Free-form run metadata
    Metadata,
}
